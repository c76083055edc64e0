mod check;
mod evaluator;
mod expand;
mod lookup;

pub use check::{CheckEngine, CheckRequest, SubjectPermissionRequest};
pub use evaluator::Evaluator;
pub use expand::{ExpandEngine, ExpandRequest, ExpandTree, ExpandedSubject};
pub use lookup::{LookupEngine, LookupEntityRequest, LookupSubjectRequest};

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::attribute::{Attribute, AttributeFilter};
use crate::snapshot::SnapshotToken;
use crate::tuple::{Tuple, TupleFilter};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("permission '{permission}' not found on type '{type_name}'")]
    PermissionNotFound {
        type_name: String,
        permission: String,
    },

    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("max depth exceeded: {0}")]
    DepthExceeded(usize),

    #[error("rule '{rule}' failed: {detail}")]
    RuleEvaluation { rule: String, detail: String },

    #[error("lookup exceeded {0} candidates")]
    LookupLimitExceeded(usize),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => f.write_str("ALLOWED"),
            Decision::Denied => f.write_str("DENIED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    /// Subjects materialized per expand leaf, members included.
    pub max_expand_subjects: usize,
    /// Entities a lookup may visit or check before giving up.
    pub max_lookup_candidates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_concurrent_branches: 10,
            max_expand_subjects: 100,
            max_lookup_candidates: 10_000,
        }
    }
}

pub trait TupleReader: Send + Sync {
    fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: &SnapshotToken,
    ) -> impl Future<Output = Result<Vec<Tuple>, EngineError>> + Send;
}

pub trait AttributeReader: Send + Sync {
    fn read_attributes(
        &self,
        filter: &AttributeFilter,
        snapshot: &SnapshotToken,
    ) -> impl Future<Output = Result<Vec<Attribute>, EngineError>> + Send;
}

/// Everything the engines read: tuples and attributes at one snapshot.
pub trait StoreReader: TupleReader + AttributeReader {}

impl<T: TupleReader + AttributeReader> StoreReader for T {}
