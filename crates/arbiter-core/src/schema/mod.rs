pub mod types;
pub mod validation;

pub use types::{
    AttributeDef, PermissionDef, PermissionExpr, RelationDef, RuleDef, Schema, SchemaVersion,
    SubjectTypeRef, TypeDefinition, VersionedSchema,
};
pub use validation::{
    SchemaLimits, ValidationError, validate_attribute, validate_schema, validate_tuple,
};
