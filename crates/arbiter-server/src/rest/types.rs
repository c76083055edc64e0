use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use arbiter_core::attribute::{Attribute, AttributeFilter};
use arbiter_core::engine::{Decision, ExpandTree};
use arbiter_core::schema::{Schema, SchemaVersion};
use arbiter_core::snapshot::SnapshotToken;
use arbiter_core::tuple::{EntityRef, SubjectRef, TenantId, Tuple, TupleFilter};

use crate::error::ApiError;
use crate::service::RequestMetadata;

#[derive(Debug, Default, Deserialize)]
pub struct MetadataBody {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub snap_token: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl MetadataBody {
    /// Empty strings count as unset so clients can send zero values.
    pub fn into_metadata(self) -> Result<RequestMetadata, ApiError> {
        let schema_version = self
            .schema_version
            .filter(|v| !v.trim().is_empty())
            .map(SchemaVersion::new);
        let snap_token = match self.snap_token.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<SnapshotToken>()?),
        };
        Ok(RequestMetadata {
            schema_version,
            snap_token,
            timeout: self.timeout_ms.map(Duration::from_millis),
        })
    }
}

pub fn tenant(raw: &str) -> TenantId {
    TenantId::resolve(raw)
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub entity: EntityRef,
    pub permission: String,
    pub subject: SubjectRef,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub decision: Decision,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct ExpandRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub entity: EntityRef,
    pub permission: String,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct ExpandResponse {
    pub tree: ExpandTree,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct LookupEntityRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct LookupEntityResponse {
    pub entity_ids: Vec<String>,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct LookupSubjectRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub entity: EntityRef,
    pub permission: String,
    pub subject_type: String,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct LookupSubjectResponse {
    pub subject_ids: Vec<String>,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct SubjectPermissionRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub entity: EntityRef,
    pub subject: SubjectRef,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct SubjectPermissionResponse {
    pub permissions: BTreeMap<String, Decision>,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct WriteRelationshipsRequest {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub writes: Vec<Tuple>,
    #[serde(default)]
    pub deletes: Vec<TupleFilter>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRelationshipsRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub filters: Vec<TupleFilter>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct ReadRelationshipsRequest {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub filter: TupleFilter,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct ReadRelationshipsResponse {
    pub relationships: Vec<Tuple>,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct WriteAttributesRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Deserialize)]
pub struct ReadAttributesRequest {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub filter: AttributeFilter,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub metadata: MetadataBody,
}

#[derive(Debug, Serialize)]
pub struct ReadAttributesResponse {
    pub attributes: Vec<Attribute>,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Deserialize)]
pub struct WriteSchemaRequest {
    #[serde(default)]
    pub tenant_id: String,
    pub schema: Schema,
}

#[derive(Debug, Serialize)]
pub struct WriteSchemaResponse {
    pub schema_version: SchemaVersion,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadSchemaQuery {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadSchemaResponse {
    pub schema_version: SchemaVersion,
    pub schema: Schema,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
