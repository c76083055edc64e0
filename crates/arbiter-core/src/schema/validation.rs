use std::collections::HashSet;

use crate::attribute::{Attribute, ValueKind};
use crate::tuple::{Tuple, TupleError};

use super::types::{PermissionExpr, Schema, TypeDefinition};

/// Attribute names the rule context reserves for the entity's own identity.
pub const RESERVED_ATTRIBUTE_NAMES: [&str; 2] = ["id", "type"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLimits {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_types: 50,
            max_relations_per_type: 30,
            max_permissions_per_type: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("too many types: {count} exceeds limit of {limit}")]
    TooManyTypes { count: usize, limit: usize },
    #[error("too many relations in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyRelations {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("too many permissions in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyPermissions {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("type '{0}' is defined more than once")]
    DuplicateType(String),
    #[error("name '{name}' is defined more than once in type '{type_name}'")]
    DuplicateName { type_name: String, name: String },
    #[error("rule '{0}' is defined more than once")]
    DuplicateRule(String),
    #[error("'{name}' in type '{type_name}' is neither a relation nor a permission")]
    UnknownReference { type_name: String, name: String },
    #[error("indirect '{relation}.{permission}' in type '{type_name}' uses an unknown relation")]
    UnknownIndirectRelation {
        type_name: String,
        relation: String,
        permission: String,
    },
    #[error("rule '{rule}' referenced in type '{type_name}' is not defined")]
    UnknownRule { type_name: String, rule: String },
    #[error("relation '{type_name}#{relation}' allows unknown subject type '{subject_type}'")]
    UnknownSubjectType {
        type_name: String,
        relation: String,
        subject_type: String,
    },
    #[error("attribute name '{name}' on type '{type_name}' is reserved")]
    ReservedAttribute { type_name: String, name: String },
    #[error("invalid tuple: {0}")]
    InvalidTuple(#[from] TupleError),
    #[error("type not found: {0}")]
    TypeNotFound(String),
    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },
    #[error("subject '{subject}' is not allowed on relation '{type_name}#{relation}'")]
    SubjectTypeNotAllowed {
        type_name: String,
        relation: String,
        subject: String,
    },
    #[error("attribute name must not be empty")]
    EmptyAttributeName,
    #[error("attribute '{name}' on type '{type_name}' expects {expected}, got {actual}")]
    AttributeKindMismatch {
        type_name: String,
        name: String,
        expected: ValueKind,
        actual: ValueKind,
    },
}

/// Checks limits and every name a schema refers to.
///
/// All problems are collected rather than stopping at the first one.
pub fn validate_schema(schema: &Schema, limits: &SchemaLimits) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if schema.types.len() > limits.max_types {
        errors.push(ValidationError::TooManyTypes {
            count: schema.types.len(),
            limit: limits.max_types,
        });
    }

    let mut type_names = HashSet::new();
    for type_def in &schema.types {
        if !type_names.insert(type_def.name.as_str()) {
            errors.push(ValidationError::DuplicateType(type_def.name.clone()));
        }
    }

    let mut rule_names = HashSet::new();
    for rule in &schema.rules {
        if !rule_names.insert(rule.name.as_str()) {
            errors.push(ValidationError::DuplicateRule(rule.name.clone()));
        }
    }

    for type_def in &schema.types {
        check_type_limits(type_def, limits, &mut errors);
        check_type_names(type_def, &mut errors);

        for relation in &type_def.relations {
            for st in &relation.subject_types {
                let known = match schema.get_type(&st.type_name) {
                    None => false,
                    Some(target) => match st.relation {
                        Some(ref rel) => {
                            target.get_relation(rel).is_some()
                                || target.get_permission(rel).is_some()
                        }
                        None => true,
                    },
                };
                if !known {
                    errors.push(ValidationError::UnknownSubjectType {
                        type_name: type_def.name.clone(),
                        relation: relation.name.clone(),
                        subject_type: st.to_string(),
                    });
                }
            }
        }

        for permission in &type_def.permissions {
            check_expr(schema, type_def, &permission.expression, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_type_limits(
    type_def: &TypeDefinition,
    limits: &SchemaLimits,
    errors: &mut Vec<ValidationError>,
) {
    if type_def.relations.len() > limits.max_relations_per_type {
        errors.push(ValidationError::TooManyRelations {
            type_name: type_def.name.clone(),
            count: type_def.relations.len(),
            limit: limits.max_relations_per_type,
        });
    }
    if type_def.permissions.len() > limits.max_permissions_per_type {
        errors.push(ValidationError::TooManyPermissions {
            type_name: type_def.name.clone(),
            count: type_def.permissions.len(),
            limit: limits.max_permissions_per_type,
        });
    }
}

fn check_type_names(type_def: &TypeDefinition, errors: &mut Vec<ValidationError>) {
    // Relations and permissions share one namespace per type.
    let mut names = HashSet::new();
    let relation_names = type_def.relations.iter().map(|r| r.name.as_str());
    let permission_names = type_def.permissions.iter().map(|p| p.name.as_str());
    for name in relation_names.chain(permission_names) {
        if !names.insert(name) {
            errors.push(ValidationError::DuplicateName {
                type_name: type_def.name.clone(),
                name: name.to_string(),
            });
        }
    }

    let mut attribute_names = HashSet::new();
    for attr in &type_def.attributes {
        if RESERVED_ATTRIBUTE_NAMES.contains(&attr.name.as_str()) {
            errors.push(ValidationError::ReservedAttribute {
                type_name: type_def.name.clone(),
                name: attr.name.clone(),
            });
        }
        if !attribute_names.insert(attr.name.as_str()) {
            errors.push(ValidationError::DuplicateName {
                type_name: type_def.name.clone(),
                name: attr.name.clone(),
            });
        }
    }
}

fn check_expr(
    schema: &Schema,
    type_def: &TypeDefinition,
    expr: &PermissionExpr,
    errors: &mut Vec<ValidationError>,
) {
    match expr {
        PermissionExpr::Leaf(name) => {
            if type_def.get_relation(name).is_none() && type_def.get_permission(name).is_none() {
                errors.push(ValidationError::UnknownReference {
                    type_name: type_def.name.clone(),
                    name: name.clone(),
                });
            }
        }
        PermissionExpr::Rule(rule) => {
            if schema.get_rule(rule).is_none() {
                errors.push(ValidationError::UnknownRule {
                    type_name: type_def.name.clone(),
                    rule: rule.clone(),
                });
            }
        }
        PermissionExpr::Union(children) | PermissionExpr::Intersection(children) => {
            for child in children {
                check_expr(schema, type_def, child, errors);
            }
        }
        PermissionExpr::Exclusion(include, exclude) => {
            check_expr(schema, type_def, include, errors);
            check_expr(schema, type_def, exclude, errors);
        }
        PermissionExpr::Indirect(relation, permission) => {
            if type_def.get_relation(relation).is_none() {
                errors.push(ValidationError::UnknownIndirectRelation {
                    type_name: type_def.name.clone(),
                    relation: relation.clone(),
                    permission: permission.clone(),
                });
            }
        }
    }
}

/// Checks a tuple against the relation's allowed subject types.
pub fn validate_tuple(schema: &Schema, tuple: &Tuple) -> Result<(), ValidationError> {
    tuple.check_fields()?;

    let type_def = schema
        .get_type(&tuple.entity.entity_type)
        .ok_or_else(|| ValidationError::TypeNotFound(tuple.entity.entity_type.clone()))?;

    let relation = type_def.get_relation(&tuple.relation).ok_or_else(|| {
        ValidationError::RelationNotFound {
            type_name: type_def.name.clone(),
            relation: tuple.relation.clone(),
        }
    })?;

    // An empty subject type list leaves the relation unconstrained.
    if relation.subject_types.is_empty() {
        return Ok(());
    }

    let allowed = relation.subject_types.iter().any(|st| {
        st.type_name == tuple.subject.subject_type && st.relation == tuple.subject.subject_relation
    });
    if !allowed {
        return Err(ValidationError::SubjectTypeNotAllowed {
            type_name: type_def.name.clone(),
            relation: relation.name.clone(),
            subject: tuple.subject.to_string(),
        });
    }

    Ok(())
}

/// Checks an attribute write. Undeclared names are accepted; declared ones
/// must carry the declared kind.
pub fn validate_attribute(schema: &Schema, attribute: &Attribute) -> Result<(), ValidationError> {
    if attribute.name.trim().is_empty() {
        return Err(ValidationError::EmptyAttributeName);
    }

    let type_name = &attribute.entity.entity_type;
    let type_def = schema
        .get_type(type_name)
        .ok_or_else(|| ValidationError::TypeNotFound(type_name.clone()))?;

    if RESERVED_ATTRIBUTE_NAMES.contains(&attribute.name.as_str()) {
        return Err(ValidationError::ReservedAttribute {
            type_name: type_name.clone(),
            name: attribute.name.clone(),
        });
    }

    if let Some(decl) = type_def.get_attribute(&attribute.name)
        && decl.kind != attribute.value.kind()
    {
        return Err(ValidationError::AttributeKindMismatch {
            type_name: type_name.clone(),
            name: attribute.name.clone(),
            expected: decl.kind,
            actual: attribute.value.kind(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::RuleDef;
    use crate::tuple::{EntityRef, SubjectRef};

    fn limits_with(max_types: usize, max_rels: usize, max_perms: usize) -> SchemaLimits {
        SchemaLimits {
            max_types,
            max_relations_per_type: max_rels,
            max_permissions_per_type: max_perms,
        }
    }

    fn drive_schema() -> Schema {
        Schema {
            types: vec![
                TypeDefinition::new("user"),
                TypeDefinition::new("group").with_relation("member", &["user", "group#member"]),
                TypeDefinition::new("document")
                    .with_relation("owner", &["user"])
                    .with_relation("viewer", &["user", "group#member"])
                    .with_attribute("public", ValueKind::Boolean)
                    .with_permission(
                        "view",
                        PermissionExpr::Union(vec![
                            PermissionExpr::leaf("owner"),
                            PermissionExpr::leaf("viewer"),
                            PermissionExpr::rule("is_public"),
                        ]),
                    ),
            ],
            rules: vec![RuleDef {
                name: "is_public".to_string(),
                expression: "resource.public == true".to_string(),
            }],
        }
    }

    #[test]
    fn well_formed_schema_passes() {
        assert!(validate_schema(&drive_schema(), &SchemaLimits::default()).is_ok());
    }

    #[test]
    fn exceeding_max_types_rejected() {
        let errors = validate_schema(&drive_schema(), &limits_with(2, 30, 30)).unwrap_err();

        assert_eq!(errors, vec![ValidationError::TooManyTypes { count: 3, limit: 2 }]);
    }

    #[test]
    fn exceeding_max_relations_rejected() {
        let errors = validate_schema(&drive_schema(), &limits_with(50, 1, 30)).unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ValidationError::TooManyRelations {
                type_name,
                count: 2,
                limit: 1
            } if type_name == "document"
        ));
    }

    #[test]
    fn exceeding_max_permissions_rejected() {
        let errors = validate_schema(&drive_schema(), &limits_with(50, 30, 0)).unwrap_err();

        assert!(matches!(
            &errors[0],
            ValidationError::TooManyPermissions { type_name, .. } if type_name == "document"
        ));
    }

    #[test]
    fn unresolved_names_are_all_reported() {
        let schema = Schema {
            types: vec![
                TypeDefinition::new("document")
                    .with_relation("viewer", &["robot"])
                    .with_permission(
                        "view",
                        PermissionExpr::Union(vec![
                            PermissionExpr::leaf("editor"),
                            PermissionExpr::indirect("parent", "view"),
                            PermissionExpr::rule("is_public"),
                        ]),
                    ),
            ],
            rules: vec![],
        };

        let errors = validate_schema(&schema, &SchemaLimits::default()).unwrap_err();

        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownSubjectType { subject_type, .. } if subject_type == "robot")));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownReference { name, .. } if name == "editor")));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownIndirectRelation { relation, .. } if relation == "parent")));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownRule { rule, .. } if rule == "is_public")));
    }

    #[test]
    fn subject_set_must_name_existing_relation() {
        let schema = Schema {
            types: vec![
                TypeDefinition::new("group"),
                TypeDefinition::new("document").with_relation("viewer", &["group#member"]),
            ],
            rules: vec![],
        };

        let errors = validate_schema(&schema, &SchemaLimits::default()).unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::UnknownSubjectType { subject_type, .. } if subject_type == "group#member"
        ));
    }

    #[test]
    fn duplicates_and_reserved_attributes_rejected() {
        let schema = Schema {
            types: vec![
                TypeDefinition::new("user").with_attribute("id", ValueKind::String),
                TypeDefinition::new("user"),
                TypeDefinition::new("doc")
                    .with_relation("viewer", &["user"])
                    .with_permission("viewer", PermissionExpr::leaf("viewer")),
            ],
            rules: vec![],
        };

        let errors = validate_schema(&schema, &SchemaLimits::default()).unwrap_err();

        assert!(errors.contains(&ValidationError::DuplicateType("user".to_string())));
        assert!(errors.contains(&ValidationError::ReservedAttribute {
            type_name: "user".to_string(),
            name: "id".to_string(),
        }));
        assert!(errors.contains(&ValidationError::DuplicateName {
            type_name: "doc".to_string(),
            name: "viewer".to_string(),
        }));
    }

    #[test]
    fn tuple_with_allowed_subject_passes() {
        let schema = drive_schema();
        let direct = Tuple::new(
            EntityRef::new("document", "1"),
            "viewer",
            SubjectRef::direct("user", "alice"),
        );
        let set = Tuple::new(
            EntityRef::new("document", "1"),
            "viewer",
            SubjectRef::subject_set("group", "eng", "member"),
        );

        assert_eq!(validate_tuple(&schema, &direct), Ok(()));
        assert_eq!(validate_tuple(&schema, &set), Ok(()));
    }

    #[test]
    fn tuple_with_disallowed_subject_rejected() {
        let schema = drive_schema();
        let tuple = Tuple::new(
            EntityRef::new("document", "1"),
            "owner",
            SubjectRef::subject_set("group", "eng", "member"),
        );

        assert!(matches!(
            validate_tuple(&schema, &tuple),
            Err(ValidationError::SubjectTypeNotAllowed { .. })
        ));
    }

    #[test]
    fn tuple_on_permission_name_rejected() {
        let schema = drive_schema();
        let tuple = Tuple::new(
            EntityRef::new("document", "1"),
            "view",
            SubjectRef::direct("user", "alice"),
        );

        assert_eq!(
            validate_tuple(&schema, &tuple),
            Err(ValidationError::RelationNotFound {
                type_name: "document".to_string(),
                relation: "view".to_string(),
            })
        );
    }

    #[test]
    fn tuple_with_empty_field_rejected() {
        let tuple = Tuple::new(EntityRef::new("document", ""), "viewer", SubjectRef::direct("user", "alice"));

        assert_eq!(
            validate_tuple(&drive_schema(), &tuple),
            Err(ValidationError::InvalidTuple(TupleError::EmptyField("entity.id")))
        );
    }

    #[test]
    fn attribute_kind_must_match_declaration() {
        let schema = drive_schema();
        let doc = EntityRef::new("document", "1");

        assert_eq!(
            validate_attribute(&schema, &Attribute::new(doc.clone(), "public", true)),
            Ok(())
        );
        assert_eq!(
            validate_attribute(&schema, &Attribute::new(doc.clone(), "public", "yes")),
            Err(ValidationError::AttributeKindMismatch {
                type_name: "document".to_string(),
                name: "public".to_string(),
                expected: ValueKind::Boolean,
                actual: ValueKind::String,
            })
        );
        assert_eq!(
            validate_attribute(&schema, &Attribute::new(doc, "department", "eng")),
            Ok(())
        );
    }

    #[test]
    fn attribute_on_unknown_type_or_reserved_name_rejected() {
        let schema = drive_schema();

        assert_eq!(
            validate_attribute(&schema, &Attribute::new(EntityRef::new("robot", "1"), "x", 1i64)),
            Err(ValidationError::TypeNotFound("robot".to_string()))
        );
        assert!(matches!(
            validate_attribute(&schema, &Attribute::new(EntityRef::new("user", "a"), "type", "x")),
            Err(ValidationError::ReservedAttribute { .. })
        ));
    }
}
