use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arbiter_core::attribute::{Attribute, AttributeFilter};
use arbiter_core::engine::{
    CheckEngine, CheckRequest, Decision, EngineConfig, Evaluator, ExpandEngine, ExpandRequest,
    ExpandTree, LookupEngine, LookupEntityRequest, LookupSubjectRequest, SubjectPermissionRequest,
};
use arbiter_core::rule::{ComparisonEvaluator, RuleEvaluator};
use arbiter_core::schema::{
    Schema, SchemaLimits, SchemaVersion, VersionedSchema, validate_attribute, validate_schema,
    validate_tuple,
};
use arbiter_core::snapshot::SnapshotToken;
use arbiter_core::tuple::{EntityRef, SubjectRef, TenantId, Tuple, TupleFilter};
use arbiter_storage::{
    AttributeStore, RelationshipStore, SchemaStore, SnapshotManager, SnapshotSource, StorageError,
    StoreFactory,
};

use crate::adapter::StoreAdapter;
use crate::error::{ApiError, RequestContext};
use crate::metrics::Metrics;

/// Per-request pins and limits. Unset fields fall back to HEAD schema,
/// the current snapshot and the configured default deadline.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub schema_version: Option<SchemaVersion>,
    pub snap_token: Option<SnapshotToken>,
    pub timeout: Option<Duration>,
}

/// A result together with the schema version and snapshot it was computed at.
#[derive(Debug, Clone)]
pub struct Evaluated<T> {
    pub value: T,
    pub schema_version: SchemaVersion,
    pub snap_token: SnapshotToken,
}

#[derive(Debug, Clone)]
pub struct ReadOutput<T> {
    pub items: Vec<T>,
    pub snap_token: SnapshotToken,
}

#[derive(Debug)]
pub struct CheckInput {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub metadata: RequestMetadata,
}

#[derive(Debug)]
pub struct ExpandInput {
    pub entity: EntityRef,
    pub permission: String,
    pub metadata: RequestMetadata,
}

#[derive(Debug)]
pub struct LookupEntityInput {
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    pub page_size: Option<usize>,
    pub metadata: RequestMetadata,
}

#[derive(Debug)]
pub struct LookupSubjectInput {
    pub entity: EntityRef,
    pub permission: String,
    pub subject_type: String,
    pub page_size: Option<usize>,
    pub metadata: RequestMetadata,
}

#[derive(Debug)]
pub struct SubjectPermissionInput {
    pub entity: EntityRef,
    pub subject: SubjectRef,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub default: Duration,
    pub max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(5),
            max: Duration::from_secs(30),
        }
    }
}

/// Schema, snapshot and store fixed for the lifetime of one request.
struct Scope<S> {
    store: Arc<S>,
    schema: VersionedSchema,
    snapshot: SnapshotToken,
}

impl<S: RelationshipStore + AttributeStore> Scope<S> {
    fn evaluator(
        &self,
        rules: &Arc<dyn RuleEvaluator>,
        config: &EngineConfig,
    ) -> Evaluator<StoreAdapter<S>> {
        Evaluator::new(
            Arc::new(StoreAdapter::new(Arc::clone(&self.store))),
            Arc::clone(&self.schema.schema),
            Arc::clone(rules),
            config.clone(),
        )
    }

    fn finish<T>(self, value: T) -> Evaluated<T> {
        Evaluated {
            value,
            schema_version: self.schema.version,
            snap_token: self.snapshot,
        }
    }
}

pub struct AuthzService<F: StoreFactory + SnapshotSource> {
    factory: Arc<F>,
    snapshots: Arc<SnapshotManager<F>>,
    rules: Arc<dyn RuleEvaluator>,
    engine_config: EngineConfig,
    schema_limits: SchemaLimits,
    timeouts: Timeouts,
    metrics: Option<Arc<Metrics>>,
}

impl<F: StoreFactory + SnapshotSource> AuthzService<F> {
    pub fn new(
        factory: Arc<F>,
        snapshots: Arc<SnapshotManager<F>>,
        engine_config: EngineConfig,
        schema_limits: SchemaLimits,
    ) -> Self {
        Self {
            factory,
            snapshots,
            rules: Arc::new(ComparisonEvaluator::new()),
            engine_config,
            schema_limits,
            timeouts: Timeouts::default(),
            metrics: None,
        }
    }

    pub fn with_rule_evaluator(mut self, rules: Arc<dyn RuleEvaluator>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn snapshots(&self) -> &SnapshotManager<F> {
        &self.snapshots
    }

    pub async fn check(
        &self,
        tenant_id: &TenantId,
        input: CheckInput,
    ) -> Result<Evaluated<Decision>, ApiError> {
        let context = RequestContext {
            tenant: tenant_id.clone(),
            entity: input.entity.to_string(),
            permission: input.permission.clone(),
            subject: input.subject.to_string(),
        };

        let evaluated = self
            .within_deadline(&input.metadata, async {
                let scope = self.scope(tenant_id, &input.metadata).await?;
                let engine =
                    CheckEngine::from_evaluator(scope.evaluator(&self.rules, &self.engine_config));
                let request = CheckRequest {
                    entity: input.entity.clone(),
                    permission: input.permission.clone(),
                    subject: input.subject.clone(),
                    snapshot: scope.snapshot.clone(),
                };
                let decision = engine
                    .check(&request)
                    .await
                    .map_err(|e| ApiError::in_context(e, &context))?;
                Ok(scope.finish(decision))
            })
            .await?;

        if let Some(ref metrics) = self.metrics {
            metrics.record_decision(evaluated.value);
        }
        Ok(evaluated)
    }

    pub async fn expand(
        &self,
        tenant_id: &TenantId,
        input: ExpandInput,
    ) -> Result<Evaluated<ExpandTree>, ApiError> {
        let context = RequestContext {
            tenant: tenant_id.clone(),
            entity: input.entity.to_string(),
            permission: input.permission.clone(),
            subject: "*".to_string(),
        };

        self.within_deadline(&input.metadata, async {
            let scope = self.scope(tenant_id, &input.metadata).await?;
            let engine = ExpandEngine::new(
                Arc::new(StoreAdapter::new(Arc::clone(&scope.store))),
                Arc::clone(&scope.schema.schema),
                self.engine_config.clone(),
            );
            let request = ExpandRequest {
                entity: input.entity.clone(),
                permission: input.permission.clone(),
                snapshot: scope.snapshot.clone(),
            };
            let tree = engine
                .expand(&request)
                .await
                .map_err(|e| ApiError::in_context(e, &context))?;
            Ok(scope.finish(tree))
        })
        .await
    }

    pub async fn lookup_entity(
        &self,
        tenant_id: &TenantId,
        input: LookupEntityInput,
    ) -> Result<Evaluated<Vec<String>>, ApiError> {
        let context = RequestContext {
            tenant: tenant_id.clone(),
            entity: format!("{}:*", input.entity_type),
            permission: input.permission.clone(),
            subject: input.subject.to_string(),
        };

        self.within_deadline(&input.metadata, async {
            let scope = self.scope(tenant_id, &input.metadata).await?;
            let engine =
                LookupEngine::from_evaluator(scope.evaluator(&self.rules, &self.engine_config));
            let request = LookupEntityRequest {
                entity_type: input.entity_type.clone(),
                permission: input.permission.clone(),
                subject: input.subject.clone(),
                page_size: input.page_size,
                snapshot: scope.snapshot.clone(),
            };
            let ids = engine
                .lookup_entity(&request)
                .await
                .map_err(|e| ApiError::in_context(e, &context))?;
            Ok(scope.finish(ids))
        })
        .await
    }

    pub async fn lookup_subject(
        &self,
        tenant_id: &TenantId,
        input: LookupSubjectInput,
    ) -> Result<Evaluated<Vec<String>>, ApiError> {
        let context = RequestContext {
            tenant: tenant_id.clone(),
            entity: input.entity.to_string(),
            permission: input.permission.clone(),
            subject: format!("{}:*", input.subject_type),
        };

        self.within_deadline(&input.metadata, async {
            let scope = self.scope(tenant_id, &input.metadata).await?;
            let engine =
                LookupEngine::from_evaluator(scope.evaluator(&self.rules, &self.engine_config));
            let request = LookupSubjectRequest {
                entity: input.entity.clone(),
                permission: input.permission.clone(),
                subject_type: input.subject_type.clone(),
                page_size: input.page_size,
                snapshot: scope.snapshot.clone(),
            };
            let ids = engine
                .lookup_subject(&request)
                .await
                .map_err(|e| ApiError::in_context(e, &context))?;
            Ok(scope.finish(ids))
        })
        .await
    }

    pub async fn subject_permission(
        &self,
        tenant_id: &TenantId,
        input: SubjectPermissionInput,
    ) -> Result<Evaluated<BTreeMap<String, Decision>>, ApiError> {
        let context = RequestContext {
            tenant: tenant_id.clone(),
            entity: input.entity.to_string(),
            permission: "*".to_string(),
            subject: input.subject.to_string(),
        };

        self.within_deadline(&input.metadata, async {
            let scope = self.scope(tenant_id, &input.metadata).await?;
            let engine =
                CheckEngine::from_evaluator(scope.evaluator(&self.rules, &self.engine_config));
            let request = SubjectPermissionRequest {
                entity: input.entity.clone(),
                subject: input.subject.clone(),
                snapshot: scope.snapshot.clone(),
            };
            let permissions = engine
                .subject_permissions(&request)
                .await
                .map_err(|e| ApiError::in_context(e, &context))?;
            Ok(scope.finish(permissions))
        })
        .await
    }

    pub async fn write_schema(
        &self,
        tenant_id: &TenantId,
        schema: Schema,
    ) -> Result<SchemaVersion, ApiError> {
        validate_schema(&schema, &self.schema_limits).map_err(ApiError::Validation)?;

        let store = self.factory.for_tenant(tenant_id);
        let version = store.write_schema(schema).await?;
        tracing::info!(tenant = %tenant_id, %version, "schema written");
        Ok(version)
    }

    pub async fn read_schema(
        &self,
        tenant_id: &TenantId,
        version: Option<&SchemaVersion>,
    ) -> Result<VersionedSchema, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        self.resolve_schema(&store, tenant_id, version).await
    }

    /// Validates every tuple against the schema, then applies deletes and
    /// writes atomically.
    pub async fn write_relationships(
        &self,
        tenant_id: &TenantId,
        writes: &[Tuple],
        deletes: &[TupleFilter],
        schema_version: Option<&SchemaVersion>,
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        if !writes.is_empty() {
            let schema = self.resolve_schema(&store, tenant_id, schema_version).await?;
            for tuple in writes {
                validate_tuple(&schema.schema, tuple).map_err(ApiError::InvalidTuple)?;
            }
        }

        let token = store.write(writes, deletes).await?;
        tracing::debug!(
            tenant = %tenant_id,
            writes = writes.len(),
            deletes = deletes.len(),
            %token,
            "relationships written"
        );
        Ok(self.snapshots.advance(token))
    }

    pub async fn delete_relationships(
        &self,
        tenant_id: &TenantId,
        filters: &[TupleFilter],
    ) -> Result<SnapshotToken, ApiError> {
        if filters.is_empty() {
            return Err(ApiError::InvalidRequest(
                "at least one delete filter is required".to_string(),
            ));
        }
        self.write_relationships(tenant_id, &[], filters, None).await
    }

    pub async fn read_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
        metadata: &RequestMetadata,
        limit: Option<usize>,
    ) -> Result<ReadOutput<Tuple>, ApiError> {
        self.within_deadline(metadata, async {
            let store = self.factory.for_tenant(tenant_id);
            let snapshot = self.resolve_snapshot(&store, metadata).await?;
            let items = store.read(filter, Some(&snapshot), limit).await?;
            Ok(ReadOutput {
                items,
                snap_token: snapshot,
            })
        })
        .await
    }

    pub async fn write_attributes(
        &self,
        tenant_id: &TenantId,
        attributes: &[Attribute],
        schema_version: Option<&SchemaVersion>,
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let schema = self.resolve_schema(&store, tenant_id, schema_version).await?;
        for attribute in attributes {
            validate_attribute(&schema.schema, attribute).map_err(ApiError::InvalidAttribute)?;
        }

        let token = store.write_attributes(attributes).await?;
        tracing::debug!(
            tenant = %tenant_id,
            attributes = attributes.len(),
            %token,
            "attributes written"
        );
        Ok(self.snapshots.advance(token))
    }

    pub async fn read_attributes(
        &self,
        tenant_id: &TenantId,
        filter: &AttributeFilter,
        metadata: &RequestMetadata,
        limit: Option<usize>,
    ) -> Result<ReadOutput<Attribute>, ApiError> {
        self.within_deadline(metadata, async {
            let store = self.factory.for_tenant(tenant_id);
            let snapshot = self.resolve_snapshot(&store, metadata).await?;
            let items = store
                .read_attributes(filter, Some(&snapshot), limit)
                .await?;
            Ok(ReadOutput {
                items,
                snap_token: snapshot,
            })
        })
        .await
    }

    async fn scope(
        &self,
        tenant_id: &TenantId,
        metadata: &RequestMetadata,
    ) -> Result<Scope<F::Store>, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let schema = self
            .resolve_schema(&store, tenant_id, metadata.schema_version.as_ref())
            .await?;
        let snapshot = self.resolve_snapshot(&store, metadata).await?;
        Ok(Scope {
            store: Arc::new(store),
            schema,
            snapshot,
        })
    }

    async fn resolve_schema(
        &self,
        store: &F::Store,
        tenant_id: &TenantId,
        version: Option<&SchemaVersion>,
    ) -> Result<VersionedSchema, ApiError> {
        match (store.read_schema(version).await?, version) {
            (Some(schema), _) => Ok(schema),
            (None, Some(version)) => Err(ApiError::SchemaVersionNotFound(version.clone())),
            (None, None) => Err(ApiError::SchemaNotFound(tenant_id.clone())),
        }
    }

    /// A pinned token is used as is once it is known not to be ahead of the
    /// store; otherwise the snapshot manager supplies "now".
    async fn resolve_snapshot(
        &self,
        store: &F::Store,
        metadata: &RequestMetadata,
    ) -> Result<SnapshotToken, ApiError> {
        let Some(ref pinned) = metadata.snap_token else {
            return Ok(self.snapshots.current_token().await?);
        };

        let current = store.snapshot().await?;
        if pinned.xmax() > current.xmax() {
            return Err(StorageError::SnapshotAhead {
                requested: pinned.clone(),
                current,
            }
            .into());
        }
        Ok(pinned.clone())
    }

    fn deadline(&self, metadata: &RequestMetadata) -> Duration {
        metadata
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.timeouts.default)
            .min(self.timeouts.max)
    }

    async fn within_deadline<T>(
        &self,
        metadata: &RequestMetadata,
        operation: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        let deadline = self.deadline(metadata);
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "request deadline exceeded"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_timeout();
                }
                Err(ApiError::Timeout(deadline))
            }
        }
    }
}
