//! Adapter for backends following the simple-REST conventions:
//!
//! | verb             | request                                                  |
//! |------------------|----------------------------------------------------------|
//! | getList          | `GET /posts?sort=["title","ASC"]&range=[0,9]&filter={…}` |
//! | getOne           | `GET /posts/123`                                         |
//! | getMany          | `GET /posts?filter={"id":[123,456]}`                     |
//! | getManyReference | `GET /comments?filter={"post_id":123}&…`                 |
//! | create           | `POST /posts`                                            |
//! | update           | `PUT /posts/123`                                         |
//! | delete           | `DELETE /posts/123`                                      |
//!
//! `updateMany` and `deleteMany` issue one call per id. List totals come
//! from the `Content-Range` header.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::header::{CONTENT_RANGE, HeaderMap};
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::application::adapter::{
    Adapter, CreateParams, DeleteManyParams, DeleteParams, GetListParams, GetListResult,
    GetManyParams, GetManyReferenceParams, GetOneParams, UpdateManyParams, UpdateParams,
};
use crate::application::error::DataError;
use crate::application::pagination::{Filter, Pagination, Sort};
use crate::domain::entities::{ID_FIELD, Record};
use crate::domain::types::{Identifier, Resource};

use super::error::InfraError;

const TOTAL_COUNT_HEADER: &str = "x-total-count";

#[derive(Clone, Debug)]
pub struct RestAdapter {
    client: Client,
    base: Url,
}

impl RestAdapter {
    pub fn new(base: Url) -> Result<Self, InfraError> {
        if base.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "`{base}` cannot be used as a base url"
            )));
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .build()
            .map_err(|err| InfraError::configuration(format!("http client: {err}")))?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("folio/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, resource: &Resource, id: Option<&Identifier>) -> Result<Url, DataError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DataError::unexpected(format!("`{}` has no path", self.base)))?;
            segments.pop_if_empty().push(resource.as_str());
            if let Some(id) = id {
                segments.push(&id.to_string());
            }
        }
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        resource: &Resource,
        id: Option<&Identifier>,
        query: &[(&str, String)],
        body: Option<&Record>,
    ) -> Result<Response, DataError> {
        let mut url = self.url(resource, id)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        debug!(method = %method, url = %url, "rest request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| DataError::transport(err.to_string()))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(resource, id, response).await)
        }
    }

    async fn fetch_page(
        &self,
        resource: &Resource,
        pagination: &Pagination,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<GetListResult, DataError> {
        let (start, end) = pagination.range();
        let query = [
            ("sort", json!([sort.field, sort.order.as_str()]).to_string()),
            ("range", json!([start, end]).to_string()),
            ("filter", Value::Object(filter.clone()).to_string()),
        ];

        let response = self
            .request(Method::GET, resource, None, &query, None)
            .await?;
        let total = total_from_headers(response.headers());
        let data: Vec<Record> = decode(response).await?;
        let total = total.unwrap_or_else(|| {
            warn!(resource = %resource, "response carries no Content-Range; using page length");
            data.len() as u64
        });
        Ok(GetListResult { data, total })
    }
}

#[async_trait]
impl Adapter for RestAdapter {
    #[instrument(skip(self, params), fields(resource = %resource))]
    async fn get_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError> {
        self.fetch_page(resource, &params.pagination, &params.sort, &params.filter)
            .await
    }

    #[instrument(skip(self, params), fields(resource = %resource, id = %params.id))]
    async fn get_one(
        &self,
        resource: &Resource,
        params: GetOneParams,
    ) -> Result<Record, DataError> {
        let response = self
            .request(Method::GET, resource, Some(&params.id), &[], None)
            .await?;
        decode(response).await
    }

    #[instrument(skip(self, params), fields(resource = %resource, ids = params.ids.len()))]
    async fn get_many(
        &self,
        resource: &Resource,
        params: GetManyParams,
    ) -> Result<Vec<Record>, DataError> {
        let ids: Vec<Value> = params.ids.iter().map(Identifier::to_value).collect();
        let filter = json!({ ID_FIELD: ids }).to_string();
        let response = self
            .request(Method::GET, resource, None, &[("filter", filter)], None)
            .await?;
        decode(response).await
    }

    #[instrument(skip(self, params), fields(resource = %resource, target = %params.target))]
    async fn get_many_reference(
        &self,
        resource: &Resource,
        params: GetManyReferenceParams,
    ) -> Result<GetListResult, DataError> {
        let mut filter = params.filter;
        filter.insert(params.target, params.id.to_value());
        self.fetch_page(resource, &params.pagination, &params.sort, &filter)
            .await
    }

    #[instrument(skip(self, params), fields(resource = %resource))]
    async fn create(
        &self,
        resource: &Resource,
        params: CreateParams,
    ) -> Result<Record, DataError> {
        let response = self
            .request(Method::POST, resource, None, &[], Some(&params.data))
            .await?;
        let mut created: Record = decode(response).await?;
        if created.id().is_none()
            && let Some(id) = params.data.id()
        {
            created.set_id(id);
        }
        Ok(created)
    }

    #[instrument(skip(self, params), fields(resource = %resource, id = %params.id))]
    async fn update(
        &self,
        resource: &Resource,
        params: UpdateParams,
    ) -> Result<Record, DataError> {
        let response = self
            .request(Method::PUT, resource, Some(&params.id), &[], Some(&params.data))
            .await?;
        let mut updated: Record = decode(response).await?;
        if updated.id().is_none() {
            updated.set_id(params.id);
        }
        Ok(updated)
    }

    #[instrument(skip(self, params), fields(resource = %resource, ids = params.ids.len()))]
    async fn update_many(
        &self,
        resource: &Resource,
        params: UpdateManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        let data = &params.data;
        let calls = params.ids.iter().map(|id| async move {
            self.request(Method::PUT, resource, Some(id), &[], Some(data))
                .await
                .map(|_| id.clone())
        });
        try_join_all(calls).await
    }

    #[instrument(skip(self, params), fields(resource = %resource, id = %params.id))]
    async fn delete(
        &self,
        resource: &Resource,
        params: DeleteParams,
    ) -> Result<Record, DataError> {
        let response = self
            .request(Method::DELETE, resource, Some(&params.id), &[], None)
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| DataError::transport(err.to_string()))?;
        if bytes.is_empty() {
            return Ok(params
                .previous_data
                .unwrap_or_else(|| Record::with_id(params.id)));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| DataError::unexpected(format!("failed to parse body: {err}")))
    }

    #[instrument(skip(self, params), fields(resource = %resource, ids = params.ids.len()))]
    async fn delete_many(
        &self,
        resource: &Resource,
        params: DeleteManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        let calls = params.ids.iter().map(|id| async move {
            self.request(Method::DELETE, resource, Some(id), &[], None)
                .await
                .map(|_| id.clone())
        });
        try_join_all(calls).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, DataError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| DataError::transport(err.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| DataError::unexpected(format!("failed to parse body: {err}")))
}

/// `Content-Range: posts 0-9/42` → 42; falls back to `X-Total-Count`.
fn total_from_headers(headers: &HeaderMap) -> Option<u64> {
    let from_range = headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit('/').next())
        .and_then(|total| total.trim().parse().ok());
    from_range.or_else(|| {
        headers
            .get(TOTAL_COUNT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}

async fn error_from_response(
    resource: &Resource,
    id: Option<&Identifier>,
    response: Response,
) -> DataError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.clone());

    match status {
        401 | 403 => DataError::auth(status, message),
        404 => match id {
            Some(id) => DataError::not_found(resource, id),
            None => DataError::adapter(status, body),
        },
        400 | 422 => match parsed.as_ref().and_then(field_errors) {
            Some(errors) => DataError::field_errors(message, errors),
            None => DataError::adapter(status, body),
        },
        _ => DataError::adapter(status, body),
    }
}

fn field_errors(body: &Value) -> Option<BTreeMap<String, String>> {
    let errors = body.get("errors")?.as_object()?;
    Some(
        errors
            .iter()
            .map(|(field, message)| {
                let message = match message {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (field.clone(), message)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn url_appends_resource_and_id_segments() {
        let adapter =
            RestAdapter::new(Url::parse("https://api.example.com/v1/").expect("url")).expect("adapter");
        let url = adapter
            .url(&Resource::new("posts"), Some(&Identifier::from("a b")))
            .expect("url");
        assert_eq!(url.as_str(), "https://api.example.com/v1/posts/a%20b");
    }

    #[test]
    fn total_prefers_content_range() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("posts 0-9/42"));
        headers.insert(TOTAL_COUNT_HEADER, HeaderValue::from_static("7"));
        assert_eq!(total_from_headers(&headers), Some(42));

        headers.remove(CONTENT_RANGE);
        assert_eq!(total_from_headers(&headers), Some(7));
    }

    #[test]
    fn field_errors_stringify_non_string_messages() {
        let body = json!({"errors": {"title": "required", "views": 3}});
        let errors = field_errors(&body).expect("errors");
        assert_eq!(errors.get("title").map(String::as_str), Some("required"));
        assert_eq!(errors.get("views").map(String::as_str), Some("3"));
    }
}
