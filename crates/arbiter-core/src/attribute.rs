use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tuple::EntityRef;

/// Dynamically typed attribute data, stored JSON-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Number,
    String,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute values cannot be null")]
    Null,
    #[error("number {0} is not representable as an attribute value")]
    UnrepresentableNumber(String),
}

impl AttributeValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            AttributeValue::Bool(_) => ValueKind::Boolean,
            AttributeValue::Number(_) => ValueKind::Number,
            AttributeValue::String(_) => ValueKind::String,
            AttributeValue::List(_) => ValueKind::List,
            AttributeValue::Map(_) => ValueKind::Map,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, AttributeError> {
        match value {
            serde_json::Value::Null => Err(AttributeError::Null),
            serde_json::Value::Bool(b) => Ok(AttributeValue::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(AttributeValue::Number)
                .ok_or_else(|| AttributeError::UnrepresentableNumber(n.to_string())),
            serde_json::Value::String(s) => Ok(AttributeValue::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(AttributeValue::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(AttributeValue::List),
            serde_json::Value::Object(fields) => fields
                .into_iter()
                .map(|(k, v)| AttributeValue::from_json(v).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(AttributeValue::Map),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
            AttributeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttributeValue::to_json).collect())
            }
            AttributeValue::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        AttributeValue::List(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub entity: EntityRef,
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(entity: EntityRef, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            entity,
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}={}", self.entity, self.name, self.value.to_json())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilter {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl AttributeFilter {
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            name: None,
        }
    }

    pub fn for_type(entity_type: &str) -> Self {
        Self {
            entity_type: Some(entity_type.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, entity: &EntityRef, name: &str) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &entity.entity_type
        {
            return false;
        }
        if let Some(ref ei) = self.entity_id
            && ei != &entity.entity_id
        {
            return false;
        }
        if let Some(ref n) = self.name
            && n != name
        {
            return false;
        }
        true
    }
}
