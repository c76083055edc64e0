use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::rule::RuleEvaluator;
use crate::schema::Schema;
use crate::snapshot::SnapshotToken;
use crate::tuple::{EntityRef, SubjectRef};

use super::{Decision, EngineConfig, EngineError, Evaluator, StoreReader};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Clone)]
pub struct SubjectPermissionRequest {
    pub entity: EntityRef,
    pub subject: SubjectRef,
    pub snapshot: SnapshotToken,
}

pub struct CheckEngine<R: StoreReader> {
    evaluator: Evaluator<R>,
}

impl<R: StoreReader> CheckEngine<R> {
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

    pub async fn check(&self, request: &CheckRequest) -> Result<Decision, EngineError> {
        let type_def = self
            .evaluator
            .schema()
            .get_type(&request.entity.entity_type)
            .ok_or_else(|| EngineError::TypeNotFound(request.entity.entity_type.clone()))?;

        if type_def.get_permission(&request.permission).is_none()
            && type_def.get_relation(&request.permission).is_none()
        {
            return Err(EngineError::PermissionNotFound {
                type_name: request.entity.entity_type.clone(),
                permission: request.permission.clone(),
            });
        }

        let decision = self
            .evaluator
            .evaluate(
                &request.entity,
                &request.permission,
                &request.subject,
                &request.snapshot,
            )
            .await?;

        tracing::debug!(
            entity = %request.entity,
            permission = %request.permission,
            subject = %request.subject,
            %decision,
            "check resolved"
        );
        Ok(decision)
    }

    /// Evaluates every permission of the entity's type for one subject.
    pub async fn subject_permissions(
        &self,
        request: &SubjectPermissionRequest,
    ) -> Result<BTreeMap<String, Decision>, EngineError> {
        let type_def = self
            .evaluator
            .schema()
            .get_type(&request.entity.entity_type)
            .ok_or_else(|| EngineError::TypeNotFound(request.entity.entity_type.clone()))?;

        let evaluator = &self.evaluator;
        let pending: Vec<_> = type_def
            .permissions
            .iter()
            .map(|perm| async move {
                let decision = evaluator
                    .evaluate(
                        &request.entity,
                        &perm.name,
                        &request.subject,
                        &request.snapshot,
                    )
                    .await?;
                Ok::<_, EngineError>((perm.name.clone(), decision))
            })
            .collect();
        stream::iter(pending)
            .buffer_unordered(evaluator.config().max_concurrent_branches.max(1))
            .try_collect()
            .await
    }
}
