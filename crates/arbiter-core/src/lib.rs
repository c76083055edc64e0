pub mod attribute;
pub mod engine;
pub mod rule;
pub mod schema;
pub mod snapshot;
pub mod tuple;
