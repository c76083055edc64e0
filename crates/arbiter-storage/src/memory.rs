//! MVCC in-memory store.
//!
//! Every tenant shares one transaction clock, so a single [`SnapshotToken`]
//! describes "now" for the whole store. Rows carry the id of the
//! transaction that created them and, once deleted, the id of the
//! transaction that deleted them; a row is visible to a token when its
//! creator is visible and its deleter is not.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arbiter_core::attribute::{Attribute, AttributeFilter, AttributeValue};
use arbiter_core::schema::{Schema, SchemaVersion, VersionedSchema};
use arbiter_core::snapshot::SnapshotToken;
use arbiter_core::tuple::{EntityRef, TenantId, Tuple, TupleFilter};
use tokio::sync::broadcast;

use crate::traits::{
    AttributeStore, RelationshipStore, SchemaStore, SnapshotSource, StorageError, StoreFactory,
};

const ACTIVE_XID: u64 = u64::MAX;
const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Versioned<T> {
    value: T,
    created_xid: u64,
    deleted_xid: u64,
}

impl<T> Versioned<T> {
    fn new(value: T, xid: u64) -> Self {
        Self {
            value,
            created_xid: xid,
            deleted_xid: ACTIVE_XID,
        }
    }

    fn is_live(&self) -> bool {
        self.deleted_xid == ACTIVE_XID
    }

    fn visible_to(&self, snapshot: &SnapshotToken) -> bool {
        snapshot.is_visible(self.created_xid) && !snapshot.is_visible(self.deleted_xid)
    }
}

#[derive(Debug, Clone)]
struct StoredAttribute {
    entity: EntityRef,
    name: String,
    encoded: String,
}

impl StoredAttribute {
    fn encode(attribute: &Attribute) -> Result<Self, StorageError> {
        let json = attribute.value.to_json();
        AttributeValue::from_json(json.clone())
            .map_err(|e| StorageError::Encoding(format!("{}: {e}", attribute.name)))?;
        let encoded =
            serde_json::to_string(&json).map_err(|e| StorageError::Encoding(e.to_string()))?;
        Ok(Self {
            entity: attribute.entity.clone(),
            name: attribute.name.clone(),
            encoded,
        })
    }

    fn decode(&self) -> Result<Attribute, StorageError> {
        let json: serde_json::Value = serde_json::from_str(&self.encoded)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        let value = AttributeValue::from_json(json)
            .map_err(|e| StorageError::Encoding(format!("{}: {e}", self.name)))?;
        Ok(Attribute::new(self.entity.clone(), &self.name, value))
    }
}

#[derive(Debug, Default)]
struct TenantData {
    tuples: Vec<Versioned<Tuple>>,
    attributes: Vec<Versioned<StoredAttribute>>,
    schemas: Vec<VersionedSchema>,
}

#[derive(Debug)]
struct State {
    next_xid: u64,
    in_progress: BTreeSet<u64>,
    tenants: HashMap<TenantId, TenantData>,
}

impl State {
    fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        let xmax = self.next_xid;
        let xmin = self.in_progress.first().copied().unwrap_or(xmax);
        SnapshotToken::new(xmin, xmax, self.in_progress.iter().copied())
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    fn resolve(&self, requested: Option<&SnapshotToken>) -> Result<SnapshotToken, StorageError> {
        match requested {
            Some(token) if token.xmax() > self.next_xid => Err(StorageError::SnapshotAhead {
                requested: token.clone(),
                current: self.snapshot()?,
            }),
            Some(token) => Ok(token.clone()),
            None => self.snapshot(),
        }
    }

    fn tenant_mut(&mut self, tenant: &TenantId) -> &mut TenantData {
        self.tenants.entry(tenant.clone()).or_default()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    feed: broadcast::Sender<SnapshotToken>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(self: &Arc<Self>, tenant: &TenantId) -> Transaction {
        let mut state = self.lock();
        let xid = state.next_xid;
        state.next_xid += 1;
        state.in_progress.insert(xid);
        tracing::trace!(xid, tenant = %tenant, "transaction started");
        Transaction {
            xid,
            tenant: tenant.clone(),
            shared: Arc::clone(self),
            open: true,
        }
    }
}

/// Owns the transaction clock and change feed; hands out tenant-scoped stores.
#[derive(Debug, Clone)]
pub struct InMemoryStoreFactory {
    shared: Arc<Shared>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_xid: 1,
                    in_progress: BTreeSet::new(),
                    tenants: HashMap::new(),
                }),
                feed,
            }),
        }
    }
}

impl Default for InMemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> InMemoryStore {
        InMemoryStore {
            tenant: tenant_id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SnapshotSource for InMemoryStoreFactory {
    async fn current_snapshot(&self) -> Result<SnapshotToken, StorageError> {
        self.shared.lock().snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapshotToken> {
        self.shared.feed.subscribe()
    }
}

/// A view of the shared store restricted to one tenant.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    tenant: TenantId,
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    /// Opens a transaction. Its changes stay invisible to every token
    /// taken before it commits; dropping it uncommitted rolls it back.
    pub fn begin(&self) -> Transaction {
        self.shared.begin(&self.tenant)
    }
}

fn take_limited<T>(rows: impl Iterator<Item = T>, limit: Option<usize>) -> Vec<T> {
    match limit {
        Some(n) => rows.take(n).collect(),
        None => rows.collect(),
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        let mut tx = self.begin();
        tx.delete_tuples(deletes)?;
        tx.write_tuples(writes)?;
        tx.commit()
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<&SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.shared.lock();
        let snapshot = state.resolve(snapshot)?;
        let Some(data) = state.tenants.get(&self.tenant) else {
            return Ok(Vec::new());
        };

        let rows = data
            .tuples
            .iter()
            .filter(|row| row.visible_to(&snapshot) && filter.matches(&row.value))
            .map(|row| row.value.clone());
        Ok(take_limited(rows, limit))
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        self.shared.lock().snapshot()
    }
}

impl AttributeStore for InMemoryStore {
    async fn write_attributes(&self, attributes: &[Attribute]) -> Result<SnapshotToken, StorageError> {
        let mut tx = self.begin();
        tx.upsert_attributes(attributes)?;
        tx.commit()
    }

    async fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: Option<&SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Attribute>, StorageError> {
        let state = self.shared.lock();
        let snapshot = state.resolve(snapshot)?;
        let Some(data) = state.tenants.get(&self.tenant) else {
            return Ok(Vec::new());
        };

        let rows = data
            .attributes
            .iter()
            .filter(|row| {
                row.visible_to(&snapshot) && filter.matches(&row.value.entity, &row.value.name)
            })
            .map(|row| row.value.decode());
        take_limited(rows, limit).into_iter().collect()
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, schema: Schema) -> Result<SchemaVersion, StorageError> {
        let version = SchemaVersion::generate();
        let mut state = self.shared.lock();
        state.tenant_mut(&self.tenant).schemas.push(VersionedSchema {
            version: version.clone(),
            schema: Arc::new(schema),
        });
        tracing::debug!(tenant = %self.tenant, %version, "schema version stored");
        Ok(version)
    }

    async fn read_schema(
        &self,
        version: Option<&SchemaVersion>,
    ) -> Result<Option<VersionedSchema>, StorageError> {
        let state = self.shared.lock();
        let Some(data) = state.tenants.get(&self.tenant) else {
            return Ok(None);
        };
        let found = match version {
            None => data.schemas.last(),
            Some(wanted) => data.schemas.iter().find(|s| &s.version == wanted),
        };
        Ok(found.cloned())
    }
}

/// An open write transaction against one tenant.
#[derive(Debug)]
pub struct Transaction {
    xid: u64,
    tenant: TenantId,
    shared: Arc<Shared>,
    open: bool,
}

impl Transaction {
    pub fn xid(&self) -> u64 {
        self.xid
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed(self.xid))
        }
    }

    pub fn write_tuples(&mut self, writes: &[Tuple]) -> Result<(), StorageError> {
        self.ensure_open()?;
        for (i, w) in writes.iter().enumerate() {
            if writes[i + 1..].contains(w) {
                return Err(StorageError::DuplicateTuple(w.to_string()));
            }
        }

        let mut state = self.shared.lock();
        let data = state.tenant_mut(&self.tenant);
        if let Some(dup) = writes
            .iter()
            .find(|w| data.tuples.iter().any(|row| row.is_live() && &row.value == *w))
        {
            return Err(StorageError::DuplicateTuple(dup.to_string()));
        }
        data.tuples
            .extend(writes.iter().map(|w| Versioned::new(w.clone(), self.xid)));
        Ok(())
    }

    pub fn delete_tuples(&mut self, filters: &[TupleFilter]) -> Result<(), StorageError> {
        self.ensure_open()?;
        if filters.iter().any(TupleFilter::is_empty) {
            return Err(StorageError::EmptyDeleteFilter);
        }

        let mut state = self.shared.lock();
        let data = state.tenant_mut(&self.tenant);
        for row in &mut data.tuples {
            if row.is_live() && filters.iter().any(|f| f.matches(&row.value)) {
                row.deleted_xid = self.xid;
            }
        }
        Ok(())
    }

    /// Replaces any live value stored under the same entity and name.
    pub fn upsert_attributes(&mut self, attributes: &[Attribute]) -> Result<(), StorageError> {
        self.ensure_open()?;
        let encoded = attributes
            .iter()
            .map(StoredAttribute::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.shared.lock();
        let data = state.tenant_mut(&self.tenant);
        for attr in encoded {
            for row in &mut data.attributes {
                if row.is_live() && row.value.entity == attr.entity && row.value.name == attr.name {
                    row.deleted_xid = self.xid;
                }
            }
            data.attributes.push(Versioned::new(attr, self.xid));
        }
        Ok(())
    }

    /// Commits and publishes the first token that observes this transaction.
    pub fn commit(mut self) -> Result<SnapshotToken, StorageError> {
        self.ensure_open()?;
        self.open = false;

        let token = {
            let mut state = self.shared.lock();
            state.in_progress.remove(&self.xid);
            state.snapshot()?
        };

        // No subscribers is not an error for the writer.
        let _ = self.shared.feed.send(token.clone());
        tracing::debug!(xid = self.xid, tenant = %self.tenant, %token, "transaction committed");
        Ok(token)
    }

    pub fn rollback(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let xid = self.xid;
        let mut state = self.shared.lock();
        if let Some(data) = state.tenants.get_mut(&self.tenant) {
            data.tuples.retain(|row| row.created_xid != xid);
            data.attributes.retain(|row| row.created_xid != xid);
            for row in &mut data.tuples {
                if row.deleted_xid == xid {
                    row.deleted_xid = ACTIVE_XID;
                }
            }
            for row in &mut data.attributes {
                if row.deleted_xid == xid {
                    row.deleted_xid = ACTIVE_XID;
                }
            }
        }
        state.in_progress.remove(&xid);
        tracing::debug!(xid, tenant = %self.tenant, "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::schema::TypeDefinition;
    use arbiter_core::tuple::SubjectRef;

    fn viewer(doc: &str, user: &str) -> Tuple {
        Tuple::new(
            EntityRef::new("doc", doc),
            "viewer",
            SubjectRef::direct("user", user),
        )
    }

    fn store() -> InMemoryStore {
        InMemoryStoreFactory::new().for_tenant(&TenantId::default())
    }

    async fn read_all(store: &InMemoryStore, snapshot: Option<&SnapshotToken>) -> Vec<Tuple> {
        store
            .read(&TupleFilter::default(), snapshot, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_store_snapshot_sees_nothing() {
        let store = store();

        let token = store.snapshot().await.unwrap();

        assert_eq!(token, SnapshotToken::at(1));
        assert!(read_all(&store, Some(&token)).await.is_empty());
    }

    #[tokio::test]
    async fn write_returns_advancing_tokens() {
        let store = store();

        let t1 = store.write(&[viewer("1", "a")], &[]).await.unwrap();
        let t2 = store.write(&[viewer("2", "b")], &[]).await.unwrap();

        assert_eq!(t1.to_string(), "2:2:");
        assert_eq!(t2.to_string(), "3:3:");
        assert!(t2.includes(&t1));
    }

    #[tokio::test]
    async fn written_tuple_can_be_read_back() {
        let store = store();
        store.write(&[viewer("readme", "john")], &[]).await.unwrap();

        let results = read_all(&store, None).await;

        assert_eq!(results, vec![viewer("readme", "john")]);
    }

    #[tokio::test]
    async fn filter_and_limit_narrow_results() {
        let store = store();
        let editor = Tuple::new(
            EntityRef::new("doc", "2"),
            "editor",
            SubjectRef::direct("user", "b"),
        );
        store
            .write(&[viewer("1", "a"), viewer("3", "c"), editor.clone()], &[])
            .await
            .unwrap();

        let filter = TupleFilter {
            relation: Some("editor".to_string()),
            ..Default::default()
        };
        assert_eq!(store.read(&filter, None, None).await.unwrap(), vec![editor]);

        let limited = store
            .read(&TupleFilter::default(), None, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn old_snapshot_hides_later_writes_and_keeps_deleted_rows() {
        let store = store();
        let before = store.write(&[viewer("1", "a")], &[]).await.unwrap();
        let after = store
            .write(&[viewer("2", "b")], &[viewer("1", "a").to_filter()])
            .await
            .unwrap();

        assert_eq!(read_all(&store, Some(&before)).await, vec![viewer("1", "a")]);
        assert_eq!(read_all(&store, Some(&after)).await, vec![viewer("2", "b")]);
    }

    #[tokio::test]
    async fn duplicate_writes_are_rejected() {
        let store = store();

        let err = store
            .write(&[viewer("1", "a"), viewer("1", "a")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateTuple(_)));

        store.write(&[viewer("1", "a")], &[]).await.unwrap();
        let err = store.write(&[viewer("1", "a")], &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateTuple(_)));
        assert_eq!(read_all(&store, None).await.len(), 1, "failed write must roll back");
    }

    #[tokio::test]
    async fn delete_then_rewrite_in_one_call_is_allowed() {
        let store = store();
        store.write(&[viewer("1", "a")], &[]).await.unwrap();

        store
            .write(&[viewer("1", "a")], &[viewer("1", "a").to_filter()])
            .await
            .unwrap();

        assert_eq!(read_all(&store, None).await, vec![viewer("1", "a")]);
    }

    #[tokio::test]
    async fn empty_delete_filter_is_rejected() {
        let store = store();

        let err = store
            .write(&[], &[TupleFilter::default()])
            .await
            .unwrap_err();

        assert_eq!(err, StorageError::EmptyDeleteFilter);
    }

    #[tokio::test]
    async fn snapshot_ahead_of_store_is_rejected() {
        let store = store();

        let err = store
            .read(&TupleFilter::default(), Some(&SnapshotToken::at(99)), None)
            .await
            .unwrap_err();

        assert!(
            matches!(err, StorageError::SnapshotAhead { .. }),
            "expected SnapshotAhead, got: {err}"
        );
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let factory = InMemoryStoreFactory::new();
        let acme = factory.for_tenant(&TenantId::new("acme"));
        let globex = factory.for_tenant(&TenantId::new("globex"));

        acme.write(&[viewer("1", "a")], &[]).await.unwrap();
        acme.write_attributes(&[Attribute::new(EntityRef::new("doc", "1"), "public", true)])
            .await
            .unwrap();
        acme.write_schema(Schema::default()).await.unwrap();

        assert!(read_all(&globex, None).await.is_empty());
        assert!(
            globex
                .read_attributes(&AttributeFilter::default(), None, None)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(globex.read_schema(None).await.unwrap().is_none());
        assert_eq!(read_all(&acme, None).await.len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_invisible() {
        let store = store();
        let mut tx = store.begin();
        tx.write_tuples(&[viewer("1", "a")]).unwrap();

        let during = store.snapshot().await.unwrap();
        assert!(during.xip().contains(&tx.xid()));
        assert!(read_all(&store, Some(&during)).await.is_empty());

        let committed = tx.commit().unwrap();
        assert!(read_all(&store, Some(&during)).await.is_empty());
        assert_eq!(read_all(&store, Some(&committed)).await.len(), 1);
    }

    #[tokio::test]
    async fn later_commit_is_visible_while_earlier_transaction_runs() {
        let store = store();
        let mut slow = store.begin();
        slow.write_tuples(&[viewer("slow", "a")]).unwrap();

        let token = store.write(&[viewer("fast", "b")], &[]).await.unwrap();

        assert_eq!(token.xmin(), slow.xid());
        assert!(token.xip().contains(&slow.xid()));
        assert_eq!(read_all(&store, Some(&token)).await, vec![viewer("fast", "b")]);

        let done = slow.commit().unwrap();
        assert!(done.includes(&token));
        assert_eq!(read_all(&store, Some(&done)).await.len(), 2);
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_restores_deletes() {
        let store = store();
        store.write(&[viewer("1", "a")], &[]).await.unwrap();

        let mut tx = store.begin();
        tx.delete_tuples(&[viewer("1", "a").to_filter()]).unwrap();
        tx.write_tuples(&[viewer("2", "b")]).unwrap();
        tx.rollback();

        let after = store.snapshot().await.unwrap();
        assert!(after.xip().is_empty());
        assert_eq!(read_all(&store, Some(&after)).await, vec![viewer("1", "a")]);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = store();
        {
            let mut tx = store.begin();
            tx.write_tuples(&[viewer("1", "a")]).unwrap();
        }

        assert!(read_all(&store, None).await.is_empty());
        assert!(store.snapshot().await.unwrap().xip().is_empty());
    }

    #[tokio::test]
    async fn attributes_upsert_by_name() {
        let store = store();
        let doc = EntityRef::new("doc", "1");
        let first = store
            .write_attributes(&[Attribute::new(doc.clone(), "public", false)])
            .await
            .unwrap();
        store
            .write_attributes(&[Attribute::new(doc.clone(), "public", true)])
            .await
            .unwrap();

        let filter = AttributeFilter::for_entity(&doc);
        let now = store.read_attributes(&filter, None, None).await.unwrap();
        let then = store
            .read_attributes(&filter, Some(&first), None)
            .await
            .unwrap();

        assert_eq!(now, vec![Attribute::new(doc.clone(), "public", true)]);
        assert_eq!(then, vec![Attribute::new(doc, "public", false)]);
    }

    #[tokio::test]
    async fn attribute_values_survive_json_encoding() {
        let store = store();
        let doc = EntityRef::new("doc", "1");
        let tags = AttributeValue::List(vec!["a".into(), 2.5.into()]);
        let meta = AttributeValue::from_json(serde_json::json!({"owner": "x", "level": 3}))
            .unwrap();
        store
            .write_attributes(&[
                Attribute::new(doc.clone(), "tags", tags.clone()),
                Attribute::new(doc.clone(), "meta", meta.clone()),
            ])
            .await
            .unwrap();

        let mut read = store
            .read_attributes(&AttributeFilter::for_entity(&doc), None, None)
            .await
            .unwrap();
        read.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(read[0].value, meta);
        assert_eq!(read[1].value, tags);
    }

    #[tokio::test]
    async fn non_finite_numbers_are_rejected() {
        let store = store();

        let err = store
            .write_attributes(&[Attribute::new(
                EntityRef::new("doc", "1"),
                "score",
                f64::NAN,
            )])
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Encoding(_)), "got: {err}");
    }

    #[tokio::test]
    async fn schema_head_is_latest_version() {
        let store = store();
        let v1 = store.write_schema(Schema::default()).await.unwrap();
        let v2 = store
            .write_schema(Schema {
                types: vec![TypeDefinition::new("user")],
                rules: vec![],
            })
            .await
            .unwrap();

        let head = store.read_schema(None).await.unwrap().unwrap();
        let pinned = store.read_schema(Some(&v1)).await.unwrap().unwrap();

        assert_eq!(head.version, v2);
        assert_eq!(head.schema.types.len(), 1);
        assert!(pinned.schema.types.is_empty());
        assert!(
            store
                .read_schema(Some(&SchemaVersion::new("missing")))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn commits_are_published_on_the_feed() {
        let factory = InMemoryStoreFactory::new();
        let mut feed = factory.subscribe();
        let store = factory.for_tenant(&TenantId::default());

        let token = store.write(&[viewer("1", "a")], &[]).await.unwrap();

        assert_eq!(feed.recv().await.unwrap(), token);
        assert_eq!(factory.current_snapshot().await.unwrap(), token);
    }
}
