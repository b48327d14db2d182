//! PostgreSQL connectivity, schema, row models and queries.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, DbPool};
pub use schema::init_schema;
