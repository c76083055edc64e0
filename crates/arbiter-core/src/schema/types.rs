use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attribute::ValueKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub types: Vec<TypeDefinition>,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

impl Schema {
    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn get_rule(&self, name: &str) -> Option<&RuleDef> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Whether evaluating `name` on `type_name` can reach a rule leaf.
    ///
    /// Follows permission leaves, subject-set relations, and indirect targets
    /// through the relation's declared subject types. A relation declaring no
    /// subject types accepts any subject, so every type is considered.
    pub fn reaches_rule(&self, type_name: &str, name: &str) -> bool {
        let mut seen = HashSet::new();
        self.reaches_rule_inner(type_name, name, &mut seen)
    }

    fn reaches_rule_inner(
        &self,
        type_name: &str,
        name: &str,
        seen: &mut HashSet<(String, String)>,
    ) -> bool {
        if !seen.insert((type_name.to_string(), name.to_string())) {
            return false;
        }
        let Some(type_def) = self.get_type(type_name) else {
            return false;
        };

        if let Some(perm) = type_def.get_permission(name) {
            return self.expr_reaches_rule(type_def, &perm.expression, seen);
        }

        if let Some(rel) = type_def.get_relation(name) {
            if rel.subject_types.is_empty() {
                return self.types.iter().any(|t| {
                    t.relations
                        .iter()
                        .map(|r| r.name.as_str())
                        .chain(t.permissions.iter().map(|p| p.name.as_str()))
                        .any(|n| self.reaches_rule_inner(&t.name, n, seen))
                });
            }
            return rel.subject_types.iter().any(|st| match st.relation {
                Some(ref sub_rel) => self.reaches_rule_inner(&st.type_name, sub_rel, seen),
                None => false,
            });
        }

        false
    }

    fn expr_reaches_rule(
        &self,
        type_def: &TypeDefinition,
        expr: &PermissionExpr,
        seen: &mut HashSet<(String, String)>,
    ) -> bool {
        match expr {
            PermissionExpr::Rule(_) => true,
            PermissionExpr::Leaf(name) => self.reaches_rule_inner(&type_def.name, name, seen),
            PermissionExpr::Union(children) | PermissionExpr::Intersection(children) => children
                .iter()
                .any(|child| self.expr_reaches_rule(type_def, child, seen)),
            PermissionExpr::Exclusion(include, _) => {
                // Only the include side can grant access.
                self.expr_reaches_rule(type_def, include, seen)
            }
            PermissionExpr::Indirect(relation, permission) => match type_def.get_relation(relation)
            {
                Some(rel) if rel.subject_types.is_empty() => self
                    .types
                    .iter()
                    .any(|t| self.reaches_rule_inner(&t.name, permission, seen)),
                Some(rel) => rel
                    .subject_types
                    .iter()
                    .any(|st| self.reaches_rule_inner(&st.type_name, permission, seen)),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    #[serde(default)]
    pub permissions: Vec<PermissionDef>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_relation(mut self, name: impl Into<String>, subject_types: &[&str]) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            subject_types: subject_types.iter().map(|s| SubjectTypeRef::parse(s)).collect(),
        });
        self
    }

    pub fn with_permission(mut self, name: impl Into<String>, expression: PermissionExpr) -> Self {
        self.permissions.push(PermissionDef {
            name: name.into(),
            expression,
        });
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.iter().find(|p| p.name == name)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    #[serde(default)]
    pub subject_types: Vec<SubjectTypeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTypeRef {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

impl SubjectTypeRef {
    /// Reads `type` or `type#relation`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('#') {
            Some((type_name, relation)) => Self {
                type_name: type_name.to_string(),
                relation: Some(relation.to_string()),
            },
            None => Self {
                type_name: spec.to_string(),
                relation: None,
            },
        }
    }
}

impl fmt::Display for SubjectTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref rel) => write!(f, "{}#{rel}", self.type_name),
            None => f.write_str(&self.type_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub expression: PermissionExpr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionExpr {
    /// A relation or permission on the same entity.
    Leaf(String),
    /// A named ABAC rule.
    Rule(String),
    Union(Vec<PermissionExpr>),
    Intersection(Vec<PermissionExpr>),
    Exclusion(Box<PermissionExpr>, Box<PermissionExpr>),
    /// `relation.permission`: follow `relation` and evaluate `permission` there.
    Indirect(String, String),
}

impl PermissionExpr {
    pub fn leaf(name: impl Into<String>) -> Self {
        PermissionExpr::Leaf(name.into())
    }

    pub fn rule(name: impl Into<String>) -> Self {
        PermissionExpr::Rule(name.into())
    }

    pub fn union_of(names: &[&str]) -> Self {
        PermissionExpr::Union(names.iter().map(|n| PermissionExpr::leaf(*n)).collect())
    }

    pub fn intersection_of(names: &[&str]) -> Self {
        PermissionExpr::Intersection(names.iter().map(|n| PermissionExpr::leaf(*n)).collect())
    }

    pub fn exclusion(include: PermissionExpr, exclude: PermissionExpr) -> Self {
        PermissionExpr::Exclusion(Box::new(include), Box::new(exclude))
    }

    pub fn indirect(relation: impl Into<String>, permission: impl Into<String>) -> Self {
        PermissionExpr::Indirect(relation.into(), permission.into())
    }
}

impl fmt::Display for PermissionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(
            f: &mut fmt::Formatter<'_>,
            children: &[PermissionExpr],
            op: &str,
        ) -> fmt::Result {
            f.write_str("(")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{child}")?;
            }
            f.write_str(")")
        }

        match self {
            PermissionExpr::Leaf(name) => f.write_str(name),
            PermissionExpr::Rule(name) => write!(f, "rule:{name}"),
            PermissionExpr::Union(children) => join(f, children, "or"),
            PermissionExpr::Intersection(children) => join(f, children, "and"),
            PermissionExpr::Exclusion(include, exclude) => {
                write!(f, "({include} not {exclude})")
            }
            PermissionExpr::Indirect(relation, permission) => {
                write!(f, "{relation}.{permission}")
            }
        }
    }
}

/// Sortable schema version id; lexical order follows creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedSchema {
    pub version: SchemaVersion,
    pub schema: Arc<Schema>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_schema() -> Schema {
        Schema {
            types: vec![
                TypeDefinition::new("user"),
                TypeDefinition::new("group").with_relation("member", &["user", "group#member"]),
                TypeDefinition::new("folder")
                    .with_relation("viewer", &["user"])
                    .with_attribute("public", ValueKind::Boolean)
                    .with_permission(
                        "view",
                        PermissionExpr::Union(vec![
                            PermissionExpr::leaf("viewer"),
                            PermissionExpr::rule("is_public"),
                        ]),
                    ),
                TypeDefinition::new("document")
                    .with_relation("parent", &["folder"])
                    .with_relation("member", &["group#member"])
                    .with_permission("view", PermissionExpr::indirect("parent", "view"))
                    .with_permission("read", PermissionExpr::leaf("member")),
            ],
            rules: vec![RuleDef {
                name: "is_public".to_string(),
                expression: "resource.public == true".to_string(),
            }],
        }
    }

    #[test]
    fn subject_type_ref_parses_subject_sets() {
        assert_eq!(
            SubjectTypeRef::parse("group#member"),
            SubjectTypeRef {
                type_name: "group".to_string(),
                relation: Some("member".to_string()),
            }
        );
        assert_eq!(SubjectTypeRef::parse("user").relation, None);
        assert_eq!(SubjectTypeRef::parse("group#member").to_string(), "group#member");
    }

    #[test]
    fn reaches_rule_follows_indirect_relations() {
        let schema = drive_schema();

        assert!(schema.reaches_rule("folder", "view"));
        assert!(schema.reaches_rule("document", "view"));
        assert!(!schema.reaches_rule("document", "read"));
        assert!(!schema.reaches_rule("group", "member"));
    }

    #[test]
    fn reaches_rule_treats_unconstrained_relations_as_open() {
        let mut schema = drive_schema();
        schema.types.push(
            TypeDefinition::new("note")
                .with_relation("parent", &[])
                .with_relation("tagged", &[])
                .with_permission("view", PermissionExpr::indirect("parent", "view")),
        );

        assert!(schema.reaches_rule("note", "view"));
        assert!(schema.reaches_rule("note", "tagged"));
    }

    #[test]
    fn reaches_rule_ignores_exclusion_subtrahend() {
        let mut schema = drive_schema();
        schema.types.push(
            TypeDefinition::new("report")
                .with_relation("viewer", &["user"])
                .with_permission(
                    "view",
                    PermissionExpr::exclusion(
                        PermissionExpr::leaf("viewer"),
                        PermissionExpr::rule("is_public"),
                    ),
                ),
        );

        assert!(!schema.reaches_rule("report", "view"));
    }

    #[test]
    fn expression_display_is_readable() {
        let expr = PermissionExpr::Union(vec![
            PermissionExpr::leaf("owner"),
            PermissionExpr::indirect("parent", "view"),
        ]);
        assert_eq!(expr.to_string(), "(owner or parent.view)");
    }

    #[test]
    fn expression_serializes_as_tagged_variants() {
        let expr = PermissionExpr::exclusion(
            PermissionExpr::leaf("viewer"),
            PermissionExpr::indirect("parent", "banned"),
        );
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"exclusion": [{"leaf": "viewer"}, {"indirect": ["parent", "banned"]}]})
        );
        let back: PermissionExpr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn generated_versions_sort_by_creation() {
        let first = SchemaVersion::generate();
        let second = SchemaVersion::generate();
        assert!(first < second, "{first} should sort before {second}");
    }
}
