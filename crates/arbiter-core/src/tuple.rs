use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Maps an empty tenant id from a request onto the default tenant.
    pub fn resolve(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::default()
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "id")]
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn as_subject(&self) -> SubjectRef {
        SubjectRef::direct(&self.entity_type, &self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    #[serde(rename = "type")]
    pub subject_type: String,
    #[serde(rename = "id")]
    pub subject_id: String,
    #[serde(
        rename = "relation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub subject_relation: Option<String>,
}

impl SubjectRef {
    pub fn direct(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: None,
        }
    }

    pub fn subject_set(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: Some(relation.into()),
        }
    }

    pub fn is_subject_set(&self) -> bool {
        self.subject_relation.is_some()
    }

    /// The entity this subject names, dropping any subject relation.
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)?;
        if let Some(ref rel) = self.subject_relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl Tuple {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }

    /// Rejects tuples with empty key components.
    pub fn check_fields(&self) -> Result<(), TupleError> {
        let fields = [
            ("entity.type", self.entity.entity_type.as_str()),
            ("entity.id", self.entity.entity_id.as_str()),
            ("relation", self.relation.as_str()),
            ("subject.type", self.subject.subject_type.as_str()),
            ("subject.id", self.subject.subject_id.as_str()),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(TupleError::EmptyField(field));
            }
        }
        if let Some(ref rel) = self.subject.subject_relation
            && rel.trim().is_empty()
        {
            return Err(TupleError::EmptyField("subject.relation"));
        }
        Ok(())
    }

    /// An exact-match filter selecting only this tuple.
    pub fn to_filter(&self) -> TupleFilter {
        TupleFilter {
            entity_type: Some(self.entity.entity_type.clone()),
            entity_id: Some(self.entity.entity_id.clone()),
            relation: Some(self.relation.clone()),
            subject_type: Some(self.subject.subject_type.clone()),
            subject_id: Some(self.subject.subject_id.clone()),
            subject_relation: Some(self.subject.subject_relation.clone()),
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TupleError {
    #[error("tuple field '{0}' must not be empty")]
    EmptyField(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleFilter {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub subject_type: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    /// `Some(None)` selects only tuples without a subject relation.
    #[serde(default)]
    pub subject_relation: Option<Option<String>>,
}

impl TupleFilter {
    pub fn for_relation(entity: &EntityRef, relation: &str) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(relation.to_string()),
            ..Default::default()
        }
    }

    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            ..Default::default()
        }
    }

    pub fn for_subject(subject: &SubjectRef) -> Self {
        Self {
            subject_type: Some(subject.subject_type.clone()),
            subject_id: Some(subject.subject_id.clone()),
            subject_relation: Some(subject.subject_relation.clone()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &tuple.entity.entity_type
        {
            return false;
        }
        if let Some(ref ei) = self.entity_id
            && ei != &tuple.entity.entity_id
        {
            return false;
        }
        if let Some(ref r) = self.relation
            && r != &tuple.relation
        {
            return false;
        }
        if let Some(ref st) = self.subject_type
            && st != &tuple.subject.subject_type
        {
            return false;
        }
        if let Some(ref si) = self.subject_id
            && si != &tuple.subject.subject_id
        {
            return false;
        }
        if let Some(ref sr) = self.subject_relation
            && sr != &tuple.subject.subject_relation
        {
            return false;
        }
        true
    }
}
