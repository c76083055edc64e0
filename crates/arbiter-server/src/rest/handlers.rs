use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};

use arbiter_core::engine::EngineError;
use arbiter_core::schema::SchemaVersion;
use arbiter_storage::{SnapshotSource, StorageError, StoreFactory};

use crate::error::ApiError;
use crate::service::{
    CheckInput, ExpandInput, LookupEntityInput, LookupSubjectInput, SubjectPermissionInput,
};

use super::AppState;
use super::types::*;

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::TypeNotFound(_)
        | EngineError::PermissionNotFound { .. }
        | EngineError::RelationNotFound { .. }
        | EngineError::RuleNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DepthExceeded(_)
        | EngineError::RuleEvaluation { .. }
        | EngineError::LookupLimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::EmptyDeleteFilter
        | StorageError::DuplicateTuple(_)
        | StorageError::SnapshotAhead { .. }
        | StorageError::Encoding(_) => StatusCode::BAD_REQUEST,
        StorageError::SnapshotUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::TransactionClosed(_) | StorageError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn status_for(err: &ApiError) -> StatusCode {
    match err {
        ApiError::Engine(e) | ApiError::Evaluation { source: e, .. } => engine_status(e),
        ApiError::Storage(e) => storage_status(e),
        ApiError::InvalidSnapToken(_)
        | ApiError::Validation(_)
        | ApiError::InvalidTuple(_)
        | ApiError::InvalidAttribute(_)
        | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ApiError::SchemaNotFound(_) | ApiError::SchemaVersionNotFound(_) => StatusCode::NOT_FOUND,
        ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Malformed bodies are client errors, whatever axum's rejection says.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))
}

pub async fn check<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> Result<Json<CheckResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let input = CheckInput {
        entity: req.entity,
        permission: req.permission,
        subject: req.subject,
        metadata: req.metadata.into_metadata()?,
    };

    let result = state.service.check(&tenant(&req.tenant_id), input).await?;
    Ok(Json(CheckResponse {
        decision: result.value,
        schema_version: result.schema_version,
        snap_token: result.snap_token,
    }))
}

pub async fn expand<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<ExpandRequest>, JsonRejection>,
) -> Result<Json<ExpandResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let input = ExpandInput {
        entity: req.entity,
        permission: req.permission,
        metadata: req.metadata.into_metadata()?,
    };

    let result = state.service.expand(&tenant(&req.tenant_id), input).await?;
    Ok(Json(ExpandResponse {
        tree: result.value,
        schema_version: result.schema_version,
        snap_token: result.snap_token,
    }))
}

pub async fn lookup_entity<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<LookupEntityRequest>, JsonRejection>,
) -> Result<Json<LookupEntityResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let input = LookupEntityInput {
        entity_type: req.entity_type,
        permission: req.permission,
        subject: req.subject,
        page_size: req.page_size,
        metadata: req.metadata.into_metadata()?,
    };

    let result = state
        .service
        .lookup_entity(&tenant(&req.tenant_id), input)
        .await?;
    Ok(Json(LookupEntityResponse {
        entity_ids: result.value,
        schema_version: result.schema_version,
        snap_token: result.snap_token,
    }))
}

pub async fn lookup_subject<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<LookupSubjectRequest>, JsonRejection>,
) -> Result<Json<LookupSubjectResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let input = LookupSubjectInput {
        entity: req.entity,
        permission: req.permission,
        subject_type: req.subject_type,
        page_size: req.page_size,
        metadata: req.metadata.into_metadata()?,
    };

    let result = state
        .service
        .lookup_subject(&tenant(&req.tenant_id), input)
        .await?;
    Ok(Json(LookupSubjectResponse {
        subject_ids: result.value,
        schema_version: result.schema_version,
        snap_token: result.snap_token,
    }))
}

pub async fn subject_permission<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<SubjectPermissionRequest>, JsonRejection>,
) -> Result<Json<SubjectPermissionResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let input = SubjectPermissionInput {
        entity: req.entity,
        subject: req.subject,
        metadata: req.metadata.into_metadata()?,
    };

    let result = state
        .service
        .subject_permission(&tenant(&req.tenant_id), input)
        .await?;
    Ok(Json(SubjectPermissionResponse {
        permissions: result.value,
        schema_version: result.schema_version,
        snap_token: result.snap_token,
    }))
}

pub async fn write_relationships<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<WriteRelationshipsRequest>, JsonRejection>,
) -> Result<Json<WriteResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let metadata = req.metadata.into_metadata()?;

    let snap_token = state
        .service
        .write_relationships(
            &tenant(&req.tenant_id),
            &req.writes,
            &req.deletes,
            metadata.schema_version.as_ref(),
        )
        .await?;
    Ok(Json(WriteResponse { snap_token }))
}

pub async fn read_relationships<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<ReadRelationshipsRequest>, JsonRejection>,
) -> Result<Json<ReadRelationshipsResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let metadata = req.metadata.into_metadata()?;

    let output = state
        .service
        .read_relationships(&tenant(&req.tenant_id), &req.filter, &metadata, req.limit)
        .await?;
    Ok(Json(ReadRelationshipsResponse {
        relationships: output.items,
        snap_token: output.snap_token,
    }))
}

pub async fn delete_relationships<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<DeleteRelationshipsRequest>, JsonRejection>,
) -> Result<Json<WriteResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;

    let snap_token = state
        .service
        .delete_relationships(&tenant(&req.tenant_id), &req.filters)
        .await?;
    Ok(Json(WriteResponse { snap_token }))
}

pub async fn write_attributes<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<WriteAttributesRequest>, JsonRejection>,
) -> Result<Json<WriteResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let metadata = req.metadata.into_metadata()?;

    let snap_token = state
        .service
        .write_attributes(
            &tenant(&req.tenant_id),
            &req.attributes,
            metadata.schema_version.as_ref(),
        )
        .await?;
    Ok(Json(WriteResponse { snap_token }))
}

pub async fn read_attributes<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<ReadAttributesRequest>, JsonRejection>,
) -> Result<Json<ReadAttributesResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;
    let metadata = req.metadata.into_metadata()?;

    let output = state
        .service
        .read_attributes(&tenant(&req.tenant_id), &req.filter, &metadata, req.limit)
        .await?;
    Ok(Json(ReadAttributesResponse {
        attributes: output.items,
        snap_token: output.snap_token,
    }))
}

pub async fn write_schema<F>(
    State(state): State<AppState<F>>,
    payload: Result<Json<WriteSchemaRequest>, JsonRejection>,
) -> Result<Json<WriteSchemaResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let req = body(payload)?;

    let schema_version = state
        .service
        .write_schema(&tenant(&req.tenant_id), req.schema)
        .await?;
    Ok(Json(WriteSchemaResponse { schema_version }))
}

pub async fn read_schema<F>(
    State(state): State<AppState<F>>,
    Query(query): Query<ReadSchemaQuery>,
) -> Result<Json<ReadSchemaResponse>, ApiError>
where
    F: StoreFactory + SnapshotSource,
{
    let version = query
        .version
        .filter(|v| !v.trim().is_empty())
        .map(SchemaVersion::new);

    let versioned = state
        .service
        .read_schema(&tenant(&query.tenant_id), version.as_ref())
        .await?;
    Ok(Json(ReadSchemaResponse {
        schema_version: versioned.version,
        schema: versioned.schema.as_ref().clone(),
    }))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

pub async fn metrics<F>(State(state): State<AppState<F>>) -> impl IntoResponse
where
    F: StoreFactory + SnapshotSource,
{
    let refreshes = state.service.snapshots().refresh_count();
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(refreshes),
    )
}
