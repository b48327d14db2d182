//! Configuration for the flowmesh engine.
//!
//! Loaded from environment variables with `envy`, the same way for the
//! application (`FLOWMESH_*`) and the database (`POSTGRES_*`).

mod app;
mod database;

pub use app::{AppConfig, DispatchMode, StorageKind};
pub use database::DatabaseConfig;
