//! Adapter contract: the nine verbs every backend binding implements.
//!
//! This trait is the only seam between the core and a transport. Nothing
//! above it may assume REST, GraphQL or a local store.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::error::DataError;
use crate::application::pagination::{Filter, Pagination, Sort};
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

/// Adapter verbs, used for fingerprints, logging and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verb {
    GetList,
    GetOne,
    GetMany,
    GetManyReference,
    Create,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::GetList => "getList",
            Verb::GetOne => "getOne",
            Verb::GetMany => "getMany",
            Verb::GetManyReference => "getManyReference",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::UpdateMany => "updateMany",
            Verb::Delete => "delete",
            Verb::DeleteMany => "deleteMany",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Verb::GetList | Verb::GetOne | Verb::GetMany | Verb::GetManyReference
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetListParams {
    pub pagination: Pagination,
    pub sort: Sort,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetListResult {
    pub data: Vec<Record>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOneParams {
    pub id: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetManyParams {
    pub ids: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetManyReferenceParams {
    /// Field of `resource` that points at the referenced record.
    pub target: String,
    pub id: Identifier,
    pub pagination: Pagination,
    pub sort: Sort,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub data: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub id: Identifier,
    pub data: Record,
    pub previous_data: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateManyParams {
    pub ids: Vec<Identifier>,
    pub data: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub id: Identifier,
    pub previous_data: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteManyParams {
    pub ids: Vec<Identifier>,
}

/// Backend binding for the nine CRUD verbs.
///
/// `get_many` returns whatever subset of the requested ids it can resolve;
/// absent ids are not an error. Write verbs carry no partial-success
/// guarantee.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn get_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError>;

    async fn get_one(&self, resource: &Resource, params: GetOneParams)
    -> Result<Record, DataError>;

    async fn get_many(
        &self,
        resource: &Resource,
        params: GetManyParams,
    ) -> Result<Vec<Record>, DataError>;

    async fn get_many_reference(
        &self,
        resource: &Resource,
        params: GetManyReferenceParams,
    ) -> Result<GetListResult, DataError>;

    async fn create(&self, resource: &Resource, params: CreateParams)
    -> Result<Record, DataError>;

    async fn update(&self, resource: &Resource, params: UpdateParams)
    -> Result<Record, DataError>;

    async fn update_many(
        &self,
        resource: &Resource,
        params: UpdateManyParams,
    ) -> Result<Vec<Identifier>, DataError>;

    async fn delete(&self, resource: &Resource, params: DeleteParams)
    -> Result<Record, DataError>;

    async fn delete_many(
        &self,
        resource: &Resource,
        params: DeleteManyParams,
    ) -> Result<Vec<Identifier>, DataError>;
}
