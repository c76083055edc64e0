use std::sync::Arc;

use arbiter_core::attribute::{Attribute, AttributeFilter};
use arbiter_core::engine::{AttributeReader, EngineError, TupleReader};
use arbiter_core::snapshot::SnapshotToken;
use arbiter_core::tuple::{Tuple, TupleFilter};
use arbiter_storage::{AttributeStore, RelationshipStore};

/// Exposes a tenant store to the engines at a fixed snapshot.
pub struct StoreAdapter<S> {
    store: Arc<S>,
}

impl<S> StoreAdapter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: RelationshipStore + AttributeStore> TupleReader for StoreAdapter<S> {
    async fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: &SnapshotToken,
    ) -> Result<Vec<Tuple>, EngineError> {
        self.store
            .read(filter, Some(snapshot), None)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

impl<S: RelationshipStore + AttributeStore> AttributeReader for StoreAdapter<S> {
    async fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: &SnapshotToken,
    ) -> Result<Vec<Attribute>, EngineError> {
        self.store
            .read_attributes(filter, Some(snapshot), None)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::tuple::{EntityRef, SubjectRef, TenantId};
    use arbiter_storage::{InMemoryStore, InMemoryStoreFactory, StoreFactory};

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStoreFactory::new().for_tenant(&TenantId::default()))
    }

    fn viewer(user: &str) -> Tuple {
        Tuple::new(
            EntityRef::new("document", "readme"),
            "viewer",
            SubjectRef::direct("user", user),
        )
    }

    #[tokio::test]
    async fn adapter_reads_tuples_at_snapshot() {
        let store = store();
        let token = store.write(&[viewer("alice")], &[]).await.unwrap();
        store.write(&[viewer("bob")], &[]).await.unwrap();

        let adapter = StoreAdapter::new(Arc::clone(&store));
        let tuples = adapter
            .read_tuples(&TupleFilter::default(), &token)
            .await
            .unwrap();

        assert_eq!(tuples, vec![viewer("alice")], "should only see tuples at snapshot");
    }

    #[tokio::test]
    async fn adapter_reads_attributes() {
        let store = store();
        let doc = EntityRef::new("document", "readme");
        let token = store
            .write_attributes(&[Attribute::new(doc.clone(), "public", true)])
            .await
            .unwrap();

        let adapter = StoreAdapter::new(Arc::clone(&store));
        let attrs = adapter
            .read_attributes(&AttributeFilter::for_entity(&doc), &token)
            .await
            .unwrap();

        assert_eq!(attrs, vec![Attribute::new(doc, "public", true)]);
    }

    #[tokio::test]
    async fn adapter_maps_storage_error_to_engine_error() {
        let adapter = StoreAdapter::new(store());

        let err = adapter
            .read_tuples(&TupleFilter::default(), &SnapshotToken::at(999))
            .await
            .unwrap_err();

        assert!(
            matches!(err, EngineError::Storage(ref msg) if msg.contains("ahead")),
            "expected Storage error with 'ahead', got: {err}"
        );
    }
}
