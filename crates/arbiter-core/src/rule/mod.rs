//! Boolean rules over entity and subject attributes.
//!
//! The engine never interprets rule text itself. It builds a [`RuleContext`]
//! and hands the expression to whatever [`RuleEvaluator`] was injected.

mod comparison;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::attribute::{AttributeValue, ValueKind};
use crate::tuple::EntityRef;

pub use comparison::ComparisonEvaluator;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("syntax error in rule expression: {0}")]
    Syntax(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("operator '{op}' cannot compare {left} with {right}")]
    TypeMismatch {
        op: String,
        left: ValueKind,
        right: ValueKind,
    },
    #[error("expected a boolean operand, got {0}")]
    NotBoolean(ValueKind),
    #[error("{0}")]
    Evaluator(String),
}

/// Variables visible to a rule: `resource` and `subject`, each a map of the
/// entity's stored attributes plus its `id` and `type`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleContext {
    variables: BTreeMap<String, AttributeValue>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_check(
        resource: &EntityRef,
        resource_attributes: BTreeMap<String, AttributeValue>,
        subject: &EntityRef,
        subject_attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.insert("resource", entity_value(resource, resource_attributes));
        ctx.insert("subject", entity_value(subject, subject_attributes));
        ctx
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.variables.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.variables.get(name)
    }

    /// Resolves a dotted path such as `resource.owner.team`.
    pub fn lookup(&self, path: &str) -> Option<&AttributeValue> {
        let mut segments = path.split('.');
        let mut current = self.variables.get(segments.next()?)?;
        for segment in segments {
            match current {
                AttributeValue::Map(fields) => current = fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn variables(&self) -> &BTreeMap<String, AttributeValue> {
        &self.variables
    }
}

fn entity_value(
    entity: &EntityRef,
    mut attributes: BTreeMap<String, AttributeValue>,
) -> AttributeValue {
    attributes.insert("id".to_string(), AttributeValue::from(entity.entity_id.as_str()));
    attributes.insert(
        "type".to_string(),
        AttributeValue::from(entity.entity_type.as_str()),
    );
    AttributeValue::Map(attributes)
}

/// Evaluates rule expression text against a context.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        expression: &str,
        context: &RuleContext,
    ) -> Result<AttributeValue, RuleError>;
}

#[async_trait]
impl<F> RuleEvaluator for F
where
    F: Fn(&str, &RuleContext) -> Result<AttributeValue, RuleError> + Send + Sync,
{
    async fn evaluate(
        &self,
        expression: &str,
        context: &RuleContext,
    ) -> Result<AttributeValue, RuleError> {
        self(expression, context)
    }
}
