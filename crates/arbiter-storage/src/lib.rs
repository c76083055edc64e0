pub mod memory;
pub mod snapshot_manager;
pub mod traits;

pub use memory::{InMemoryStore, InMemoryStoreFactory, Transaction};
pub use snapshot_manager::{SnapshotManager, SnapshotManagerConfig};
pub use traits::{
    AttributeStore, RelationshipStore, SchemaStore, SnapshotSource, StorageError, StoreFactory,
};
