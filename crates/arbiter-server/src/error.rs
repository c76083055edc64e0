use std::fmt;
use std::time::Duration;

use arbiter_core::engine::EngineError;
use arbiter_core::schema::{SchemaVersion, ValidationError};
use arbiter_core::snapshot::SnapshotTokenError;
use arbiter_core::tuple::TenantId;
use arbiter_storage::StorageError;

/// Who asked what: attached to errors raised while evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant: TenantId,
    pub entity: String,
    pub permission: String,
    pub subject: String,
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tenant={} entity={} permission={} subject={}",
            self.tenant, self.entity, self.permission, self.subject
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("{source} ({context})")]
    Evaluation {
        context: RequestContext,
        #[source]
        source: EngineError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid snapshot token: {0}")]
    InvalidSnapToken(#[from] SnapshotTokenError),

    #[error("schema validation errors: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("invalid tuple: {0}")]
    InvalidTuple(ValidationError),

    #[error("invalid attribute: {0}")]
    InvalidAttribute(ValidationError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no schema has been written for tenant '{0}'")]
    SchemaNotFound(TenantId),

    #[error("schema version '{0}' not found")]
    SchemaVersionNotFound(SchemaVersion),

    #[error("request exceeded its {}ms deadline", .0.as_millis())]
    Timeout(Duration),
}

impl ApiError {
    pub(crate) fn in_context(source: EngineError, context: &RequestContext) -> Self {
        ApiError::Evaluation {
            context: context.clone(),
            source,
        }
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
