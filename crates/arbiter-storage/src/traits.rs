use std::future::Future;

use arbiter_core::attribute::{Attribute, AttributeFilter};
use arbiter_core::schema::{Schema, SchemaVersion, VersionedSchema};
use arbiter_core::snapshot::SnapshotToken;
use arbiter_core::tuple::{TenantId, Tuple, TupleFilter};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("delete filter must have at least one field set")]
    EmptyDeleteFilter,
    #[error("duplicate tuple: {0}")]
    DuplicateTuple(String),
    #[error("snapshot {requested} is ahead of current {current}")]
    SnapshotAhead { requested: SnapshotToken, current: SnapshotToken },
    #[error("transaction {0} is no longer open")]
    TransactionClosed(u64),
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("attribute encoding error: {0}")]
    Encoding(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

pub trait RelationshipStore: Send + Sync {
    /// Applies deletes then writes in one transaction and returns the
    /// token that first observes the change.
    fn write(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<&SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;
}

/// Entity attributes, upserted by name per entity.
pub trait AttributeStore: Send + Sync {
    fn write_attributes(
        &self,
        attributes: &[Attribute],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<&SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Attribute>, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    fn write_schema(
        &self,
        schema: Schema,
    ) -> impl Future<Output = Result<SchemaVersion, StorageError>> + Send;

    /// `None` selects HEAD, the most recently written version.
    fn read_schema(
        &self,
        version: Option<&SchemaVersion>,
    ) -> impl Future<Output = Result<Option<VersionedSchema>, StorageError>> + Send;
}

pub trait StoreFactory: Send + Sync {
    type Store: RelationshipStore + AttributeStore + SchemaStore + 'static;

    fn for_tenant(&self, tenant_id: &TenantId) -> Self::Store;
}

/// Source of "now" for the snapshot manager: the current token plus a feed
/// of tokens published after every commit.
pub trait SnapshotSource: Send + Sync + 'static {
    fn current_snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<SnapshotToken>;
}
