use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::attribute::{AttributeFilter, AttributeValue};
use crate::rule::{RuleContext, RuleEvaluator};
use crate::schema::{PermissionExpr, Schema};
use crate::snapshot::SnapshotToken;
use crate::tuple::{EntityRef, SubjectRef, Tuple, TupleFilter};

use super::{Decision, EngineConfig, EngineError, StoreReader};

pub(crate) type EngineFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// The (entity, name) pairs on the active recursion path plus its depth.
///
/// Each branch owns its copy, so siblings evaluated concurrently never see
/// each other's nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraversalPath {
    depth: usize,
    visited: HashSet<(String, String, String)>,
}

impl TraversalPath {
    /// Returns the extended path, or `None` when the node is already on it.
    pub(crate) fn enter(
        &self,
        entity: &EntityRef,
        name: &str,
        max_depth: usize,
    ) -> Result<Option<TraversalPath>, EngineError> {
        let key = (
            entity.entity_type.clone(),
            entity.entity_id.clone(),
            name.to_string(),
        );
        if self.visited.contains(&key) {
            return Ok(None);
        }

        let depth = self.depth + 1;
        if depth > max_depth {
            return Err(EngineError::DepthExceeded(max_depth));
        }

        let mut visited = self.visited.clone();
        visited.insert(key);
        Ok(Some(TraversalPath { depth, visited }))
    }
}

/// ALLOWED if any branch allows; otherwise the error of the lowest-index
/// failing branch; otherwise DENIED.
///
/// Returning early drops the stream, which cancels branches still in flight.
pub(crate) async fn any_allowed(
    branches: Vec<EngineFuture<'_, Decision>>,
    limit: usize,
) -> Result<Decision, EngineError> {
    let mut results = indexed(branches).buffer_unordered(limit.max(1));
    let mut first_error = None;
    while let Some((index, result)) = results.next().await {
        match result {
            Ok(Decision::Allowed) => return Ok(Decision::Allowed),
            Ok(Decision::Denied) => {}
            Err(e) => keep_lowest(&mut first_error, index, e),
        }
    }
    first_error.map_or(Ok(Decision::Denied), |(_, e)| Err(e))
}

/// DENIED if any branch denies; otherwise the error of the lowest-index
/// failing branch; otherwise ALLOWED.
pub(crate) async fn all_allowed(
    branches: Vec<EngineFuture<'_, Decision>>,
    limit: usize,
) -> Result<Decision, EngineError> {
    let mut results = indexed(branches).buffer_unordered(limit.max(1));
    let mut first_error = None;
    while let Some((index, result)) = results.next().await {
        match result {
            Ok(Decision::Denied) => return Ok(Decision::Denied),
            Ok(Decision::Allowed) => {}
            Err(e) => keep_lowest(&mut first_error, index, e),
        }
    }
    first_error.map_or(Ok(Decision::Allowed), |(_, e)| Err(e))
}

type IndexedBranch<'a> =
    Pin<Box<dyn Future<Output = (usize, Result<Decision, EngineError>)> + Send + 'a>>;

/// Tags each branch with its position so errors can be ranked by it.
fn indexed<'a>(
    branches: Vec<EngineFuture<'a, Decision>>,
) -> stream::Iter<std::vec::IntoIter<IndexedBranch<'a>>> {
    let tagged: Vec<IndexedBranch<'a>> = branches
        .into_iter()
        .enumerate()
        .map(|(index, branch)| -> IndexedBranch<'a> {
            Box::pin(async move { (index, branch.await) })
        })
        .collect();
    stream::iter(tagged)
}

fn keep_lowest(slot: &mut Option<(usize, EngineError)>, index: usize, error: EngineError) {
    if slot.as_ref().is_none_or(|(kept, _)| index < *kept) {
        *slot = Some((index, error));
    }
}

/// Targets of an indirect relation whose type defines `name`; others are skipped.
pub(crate) fn indirect_targets(schema: &Schema, tuples: &[Tuple], name: &str) -> BTreeSet<EntityRef> {
    tuples
        .iter()
        .map(|t| t.subject.entity())
        .filter(|target| {
            let defined = schema.get_type(&target.entity_type).is_some_and(|td| {
                td.get_permission(name).is_some() || td.get_relation(name).is_some()
            });
            if !defined {
                tracing::debug!(entity = %target, name, "indirect target lacks name, skipped");
            }
            defined
        })
        .collect()
}

struct EvalContext<'a> {
    subject: &'a SubjectRef,
    snapshot: &'a SnapshotToken,
}

/// Resolves one (entity, relation-or-permission, subject) triple against a
/// fixed schema and snapshot.
pub struct Evaluator<R: StoreReader> {
    reader: Arc<R>,
    schema: Arc<Schema>,
    rules: Arc<dyn RuleEvaluator>,
    config: EngineConfig,
}

impl<R: StoreReader> Clone for Evaluator<R> {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            schema: Arc::clone(&self.schema),
            rules: Arc::clone(&self.rules),
            config: self.config.clone(),
        }
    }
}

impl<R: StoreReader> Evaluator<R> {
    pub fn new(
        reader: Arc<R>,
        schema: Arc<Schema>,
        rules: Arc<dyn RuleEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reader,
            schema,
            rules,
            config,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn reader(&self) -> &R {
        &self.reader
    }

    pub async fn evaluate(
        &self,
        entity: &EntityRef,
        name: &str,
        subject: &SubjectRef,
        snapshot: &SnapshotToken,
    ) -> Result<Decision, EngineError> {
        let ctx = EvalContext { subject, snapshot };
        self.resolve(entity, name, &ctx, &TraversalPath::default())
            .await
    }

    fn resolve<'a>(
        &'a self,
        entity: &'a EntityRef,
        name: &'a str,
        ctx: &'a EvalContext<'a>,
        path: &'a TraversalPath,
    ) -> EngineFuture<'a, Decision> {
        Box::pin(async move {
            let Some(path) = path.enter(entity, name, self.config.max_depth)? else {
                tracing::warn!(
                    entity = %entity,
                    name,
                    subject = %ctx.subject,
                    "evaluation cycle"
                );
                return Ok(Decision::Denied);
            };

            let type_def = self
                .schema
                .get_type(&entity.entity_type)
                .ok_or_else(|| EngineError::TypeNotFound(entity.entity_type.clone()))?;

            if let Some(perm_def) = type_def.get_permission(name) {
                return self
                    .eval_expr(&perm_def.expression, entity, ctx, &path)
                    .await;
            }

            if type_def.get_relation(name).is_some() {
                return self.eval_relation(entity, name, ctx, &path).await;
            }

            Err(EngineError::RelationNotFound {
                type_name: entity.entity_type.clone(),
                relation: name.to_string(),
            })
        })
    }

    fn eval_expr<'a>(
        &'a self,
        expr: &'a PermissionExpr,
        entity: &'a EntityRef,
        ctx: &'a EvalContext<'a>,
        path: &'a TraversalPath,
    ) -> EngineFuture<'a, Decision> {
        Box::pin(async move {
            let limit = self.config.max_concurrent_branches;
            match expr {
                PermissionExpr::Leaf(name) => self.resolve(entity, name, ctx, path).await,
                PermissionExpr::Rule(rule) => self.eval_rule(rule, entity, ctx).await,
                PermissionExpr::Union(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.eval_expr(child, entity, ctx, path))
                        .collect();
                    any_allowed(branches, limit).await
                }
                PermissionExpr::Intersection(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.eval_expr(child, entity, ctx, path))
                        .collect();
                    all_allowed(branches, limit).await
                }
                PermissionExpr::Exclusion(include, exclude) => {
                    let (included, excluded) = futures::try_join!(
                        self.eval_expr(include, entity, ctx, path),
                        self.eval_expr(exclude, entity, ctx, path),
                    )?;
                    Ok(Decision::from(
                        included.is_allowed() && !excluded.is_allowed(),
                    ))
                }
                PermissionExpr::Indirect(relation, permission) => {
                    self.eval_indirect(relation, permission, entity, ctx, path)
                        .await
                }
            }
        })
    }

    async fn eval_relation(
        &self,
        entity: &EntityRef,
        relation: &str,
        ctx: &EvalContext<'_>,
        path: &TraversalPath,
    ) -> Result<Decision, EngineError> {
        let filter = TupleFilter::for_relation(entity, relation);
        let tuples = self.reader.read_tuples(&filter, ctx.snapshot).await?;

        if tuples.iter().any(|t| &t.subject == ctx.subject) {
            return Ok(Decision::Allowed);
        }

        let subject_sets: Vec<(EntityRef, &str)> = tuples
            .iter()
            .filter_map(|t| {
                t.subject
                    .subject_relation
                    .as_deref()
                    .map(|rel| (t.subject.entity(), rel))
            })
            .collect();

        let branches = subject_sets
            .iter()
            .map(|(target, rel)| self.resolve(target, rel, ctx, path))
            .collect();
        any_allowed(branches, self.config.max_concurrent_branches).await
    }

    async fn eval_indirect(
        &self,
        relation: &str,
        permission: &str,
        entity: &EntityRef,
        ctx: &EvalContext<'_>,
        path: &TraversalPath,
    ) -> Result<Decision, EngineError> {
        let filter = TupleFilter::for_relation(entity, relation);
        let tuples = self.reader.read_tuples(&filter, ctx.snapshot).await?;

        let targets = indirect_targets(&self.schema, &tuples, permission);
        let branches = targets
            .iter()
            .map(|target| self.resolve(target, permission, ctx, path))
            .collect();
        any_allowed(branches, self.config.max_concurrent_branches).await
    }

    async fn eval_rule(
        &self,
        rule: &str,
        entity: &EntityRef,
        ctx: &EvalContext<'_>,
    ) -> Result<Decision, EngineError> {
        let rule_def = self
            .schema
            .get_rule(rule)
            .ok_or_else(|| EngineError::RuleNotFound(rule.to_string()))?;

        let subject = ctx.subject.entity();
        let (resource_attrs, subject_attrs) = futures::try_join!(
            self.load_attributes(entity, ctx.snapshot, rule),
            self.load_attributes(&subject, ctx.snapshot, rule),
        )?;

        let context = RuleContext::for_check(entity, resource_attrs, &subject, subject_attrs);
        let value = self
            .rules
            .evaluate(&rule_def.expression, &context)
            .await
            .map_err(|e| EngineError::RuleEvaluation {
                rule: rule.to_string(),
                detail: e.to_string(),
            })?;

        value
            .as_bool()
            .map(Decision::from)
            .ok_or_else(|| EngineError::RuleEvaluation {
                rule: rule.to_string(),
                detail: format!("expected a boolean result, got {}", value.kind()),
            })
    }

    async fn load_attributes(
        &self,
        entity: &EntityRef,
        snapshot: &SnapshotToken,
        rule: &str,
    ) -> Result<BTreeMap<String, AttributeValue>, EngineError> {
        let attributes = self
            .reader
            .read_attributes(&AttributeFilter::for_entity(entity), snapshot)
            .await?;
        let type_def = self.schema.get_type(&entity.entity_type);

        let mut values = BTreeMap::new();
        for attr in attributes {
            if let Some(decl) = type_def.and_then(|td| td.get_attribute(&attr.name))
                && decl.kind != attr.value.kind()
            {
                return Err(EngineError::RuleEvaluation {
                    rule: rule.to_string(),
                    detail: format!(
                        "attribute '{}' of {entity} is {}, declared {}",
                        attr.name,
                        attr.value.kind(),
                        decl.kind
                    ),
                });
            }
            values.insert(attr.name, attr.value);
        }
        Ok(values)
    }
}
