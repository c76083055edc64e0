//! Reverse queries: which entities a subject reaches, which subjects reach
//! an entity.
//!
//! Both directions first collect candidates by walking the tuple graph, then
//! keep only the candidates a regular check allows. Rules cannot be walked,
//! so when the permission can reach one every known entity of the requested
//! type becomes a candidate.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::attribute::AttributeFilter;
use crate::rule::RuleEvaluator;
use crate::schema::Schema;
use crate::snapshot::SnapshotToken;
use crate::tuple::{EntityRef, SubjectRef, Tuple, TupleFilter};

use super::{EngineConfig, EngineError, Evaluator, StoreReader};

#[derive(Debug, Clone)]
pub struct LookupEntityRequest {
    pub entity_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    pub page_size: Option<usize>,
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Clone)]
pub struct LookupSubjectRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject_type: String,
    pub page_size: Option<usize>,
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// From a subject towards the entities that name it.
    Backward,
    /// From an entity towards the subjects it names.
    Forward,
}

impl Direction {
    fn edges_of(self, node: &EntityRef) -> TupleFilter {
        match self {
            Direction::Backward => TupleFilter {
                subject_type: Some(node.entity_type.clone()),
                subject_id: Some(node.entity_id.clone()),
                ..Default::default()
            },
            Direction::Forward => TupleFilter::for_entity(node),
        }
    }

    fn follow(self, tuple: Tuple) -> EntityRef {
        match self {
            Direction::Backward => tuple.entity,
            Direction::Forward => tuple.subject.entity(),
        }
    }
}

pub struct LookupEngine<R: StoreReader> {
    evaluator: Evaluator<R>,
}

impl<R: StoreReader> LookupEngine<R> {
    pub fn new(
        reader: Arc<R>,
        schema: Arc<Schema>,
        rules: Arc<dyn RuleEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self::from_evaluator(Evaluator::new(reader, schema, rules, config))
    }

    pub fn from_evaluator(evaluator: Evaluator<R>) -> Self {
        Self { evaluator }
    }

    pub async fn lookup_entity(
        &self,
        request: &LookupEntityRequest,
    ) -> Result<Vec<String>, EngineError> {
        self.require_name(&request.entity_type, &request.permission)?;

        let reached = self
            .traverse(&request.subject.entity(), Direction::Backward, &request.snapshot)
            .await?;
        let mut candidates: BTreeSet<String> = reached
            .into_iter()
            .filter(|e| e.entity_type == request.entity_type)
            .map(|e| e.entity_id)
            .collect();

        if self
            .evaluator
            .schema()
            .reaches_rule(&request.entity_type, &request.permission)
        {
            candidates.extend(self.known_ids(&request.entity_type, &request.snapshot).await?);
        }
        self.check_candidate_count(candidates.len())?;

        let checks: Vec<(String, EntityRef, SubjectRef)> = candidates
            .into_iter()
            .map(|id| {
                let entity = EntityRef::new(&request.entity_type, &id);
                (id, entity, request.subject.clone())
            })
            .collect();

        let ids = self
            .allowed_ids(&checks, &request.permission, &request.snapshot)
            .await?;
        tracing::debug!(
            entity_type = %request.entity_type,
            permission = %request.permission,
            subject = %request.subject,
            candidates = checks.len(),
            allowed = ids.len(),
            "lookup entity resolved"
        );
        Ok(paginate(ids, request.page_size))
    }

    pub async fn lookup_subject(
        &self,
        request: &LookupSubjectRequest,
    ) -> Result<Vec<String>, EngineError> {
        self.require_name(&request.entity.entity_type, &request.permission)?;

        let reached = self
            .traverse(&request.entity, Direction::Forward, &request.snapshot)
            .await?;
        let mut candidates: BTreeSet<String> = reached
            .into_iter()
            .filter(|e| e.entity_type == request.subject_type)
            .map(|e| e.entity_id)
            .collect();

        if self
            .evaluator
            .schema()
            .reaches_rule(&request.entity.entity_type, &request.permission)
        {
            candidates.extend(self.known_ids(&request.subject_type, &request.snapshot).await?);
        }
        self.check_candidate_count(candidates.len())?;

        let checks: Vec<(String, EntityRef, SubjectRef)> = candidates
            .into_iter()
            .map(|id| {
                let subject = SubjectRef::direct(&request.subject_type, &id);
                (id, request.entity.clone(), subject)
            })
            .collect();

        let ids = self
            .allowed_ids(&checks, &request.permission, &request.snapshot)
            .await?;
        tracing::debug!(
            entity = %request.entity,
            permission = %request.permission,
            subject_type = %request.subject_type,
            candidates = checks.len(),
            allowed = ids.len(),
            "lookup subject resolved"
        );
        Ok(paginate(ids, request.page_size))
    }

    fn require_name(&self, type_name: &str, name: &str) -> Result<(), EngineError> {
        let type_def = self
            .evaluator
            .schema()
            .get_type(type_name)
            .ok_or_else(|| EngineError::TypeNotFound(type_name.to_string()))?;
        if type_def.get_permission(name).is_none() && type_def.get_relation(name).is_none() {
            return Err(EngineError::PermissionNotFound {
                type_name: type_name.to_string(),
                permission: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_candidate_count(&self, count: usize) -> Result<(), EngineError> {
        let limit = self.evaluator.config().max_lookup_candidates;
        if count > limit {
            return Err(EngineError::LookupLimitExceeded(limit));
        }
        Ok(())
    }

    /// Breadth-first walk over tuples, one concurrent batch of reads per level.
    async fn traverse(
        &self,
        start: &EntityRef,
        direction: Direction,
        snapshot: &SnapshotToken,
    ) -> Result<HashSet<EntityRef>, EngineError> {
        let config = self.evaluator.config();
        let reader = self.evaluator.reader();

        let mut seen = HashSet::from([start.clone()]);
        let mut frontier = vec![start.clone()];

        while !frontier.is_empty() {
            let filters: Vec<TupleFilter> =
                frontier.drain(..).map(|node| direction.edges_of(&node)).collect();

            let reads: Vec<_> = filters
                .iter()
                .map(|filter| reader.read_tuples(filter, snapshot))
                .collect();
            let batches: Vec<Vec<Tuple>> = stream::iter(reads)
                .buffer_unordered(config.max_concurrent_branches.max(1))
                .try_collect()
                .await?;

            for tuple in batches.into_iter().flatten() {
                let next = direction.follow(tuple);
                if seen.insert(next.clone()) {
                    if seen.len() > config.max_lookup_candidates {
                        return Err(EngineError::LookupLimitExceeded(
                            config.max_lookup_candidates,
                        ));
                    }
                    frontier.push(next);
                }
            }
        }

        Ok(seen)
    }

    /// Ids of every `entity_type` entity that appears in a tuple or carries
    /// an attribute.
    async fn known_ids(
        &self,
        entity_type: &str,
        snapshot: &SnapshotToken,
    ) -> Result<BTreeSet<String>, EngineError> {
        let reader = self.evaluator.reader();
        let as_entity = TupleFilter {
            entity_type: Some(entity_type.to_string()),
            ..Default::default()
        };
        let as_subject = TupleFilter {
            subject_type: Some(entity_type.to_string()),
            ..Default::default()
        };
        let with_attributes = AttributeFilter::for_type(entity_type);

        let (entities, subjects, attributes) = futures::try_join!(
            reader.read_tuples(&as_entity, snapshot),
            reader.read_tuples(&as_subject, snapshot),
            reader.read_attributes(&with_attributes, snapshot),
        )?;

        let mut ids = BTreeSet::new();
        ids.extend(entities.into_iter().map(|t| t.entity.entity_id));
        ids.extend(subjects.into_iter().map(|t| t.subject.subject_id));
        ids.extend(attributes.into_iter().map(|a| a.entity.entity_id));
        Ok(ids)
    }

    async fn allowed_ids(
        &self,
        checks: &[(String, EntityRef, SubjectRef)],
        name: &str,
        snapshot: &SnapshotToken,
    ) -> Result<Vec<String>, EngineError> {
        let evaluator = &self.evaluator;
        let pending: Vec<_> = checks
            .iter()
            .map(|(id, entity, subject)| async move {
                let decision = evaluator.evaluate(entity, name, subject, snapshot).await?;
                Ok::<_, EngineError>(decision.is_allowed().then(|| id.clone()))
            })
            .collect();
        let results: Vec<Option<String>> = stream::iter(pending)
            .buffer_unordered(evaluator.config().max_concurrent_branches.max(1))
            .try_collect()
            .await?;

        let mut ids: Vec<String> = results.into_iter().flatten().collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// A page size of zero means "no limit".
fn paginate(mut ids: Vec<String>, page_size: Option<usize>) -> Vec<String> {
    if let Some(size) = page_size.filter(|&size| size > 0) {
        ids.truncate(size);
    }
    ids
}
