use std::collections::BTreeMap;

use thiserror::Error;

use crate::application::pagination::PaginationError;
use crate::config::LoadError;
use crate::domain::error::DomainError;
use crate::domain::types::{Identifier, Resource};
use crate::infra::error::InfraError;

/// Status reported for failures that never produced a backend response.
pub const TRANSPORT_STATUS: u16 = 0;

/// Failure kinds surfaced by adapters, the cache and the mutation pipeline.
///
/// `Clone` so that a single in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("record `{id}` not found in `{resource}`")]
    NotFound { resource: Resource, id: Identifier },
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        errors: BTreeMap<String, String>,
    },
    #[error("adapter failure (status {status}): {body}")]
    Adapter { status: u16, body: String },
    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },
    #[error("mutation was undone before it was sent")]
    Cancelled,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl DataError {
    pub fn not_found(resource: &Resource, id: &Identifier) -> Self {
        Self::NotFound {
            resource: resource.clone(),
            id: id.clone(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            errors: BTreeMap::new(),
        }
    }

    pub fn field_errors(message: impl Into<String>, errors: BTreeMap<String, String>) -> Self {
        Self::Validation {
            message: message.into(),
            errors,
        }
    }

    pub fn adapter(status: u16, body: impl Into<String>) -> Self {
        Self::Adapter {
            status,
            body: body.into(),
        }
    }

    pub fn transport(body: impl Into<String>) -> Self {
        Self::adapter(TRANSPORT_STATUS, body)
    }

    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        Self::Auth {
            status,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Whether the whole session should be considered untrustworthy.
    pub fn is_auth(&self) -> bool {
        matches!(self, DataError::Auth { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound { .. })
    }

    /// HTTP-style status for reporting; `None` for kinds without one.
    pub fn status(&self) -> Option<u16> {
        match self {
            DataError::NotFound { .. } => Some(404),
            DataError::Validation { .. } => Some(400),
            DataError::Adapter { status, .. } | DataError::Auth { status, .. } => Some(*status),
            DataError::Cancelled | DataError::Unexpected(_) => None,
        }
    }
}

impl From<DomainError> for DataError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Validation { message } => DataError::validation(message),
            DomainError::Invariant { message } => DataError::unexpected(message),
        }
    }
}

impl From<PaginationError> for DataError {
    fn from(error: PaginationError) -> Self {
        DataError::validation(error.to_string())
    }
}

/// Top-level error for the `folio` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_kind() {
        let resource = Resource::new("posts");
        assert_eq!(
            DataError::not_found(&resource, &Identifier::Int(1)).status(),
            Some(404)
        );
        assert_eq!(DataError::auth(401, "expired").status(), Some(401));
        assert_eq!(DataError::transport("connection reset").status(), Some(0));
        assert_eq!(DataError::Cancelled.status(), None);
    }

    #[test]
    fn domain_errors_map_to_data_errors() {
        let invariant: DataError = DomainError::invariant("missing id").into();
        assert!(matches!(invariant, DataError::Unexpected(_)));

        let validation: DataError = DomainError::validation("not an object").into();
        assert!(matches!(validation, DataError::Validation { .. }));
    }
}
