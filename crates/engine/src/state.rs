//! Shared application state handed to every Axum handler.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::dispatch::DispatchGateway;
use crate::engine::WorkflowRunner;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<WorkflowRunner>,

    pub config: Arc<AppConfig>,

    /// Present when the instance store is PostgreSQL-backed.
    pub db: Option<DbPool>,

    /// Whether the queue is NATS rather than in-process.
    pub nats: bool,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(runner: Arc<WorkflowRunner>, config: AppConfig, db: Option<DbPool>, nats: bool) -> Self {
        Self {
            runner,
            config: Arc::new(config),
            db,
            nats,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn gateway(&self) -> &DispatchGateway {
        self.runner.gateway()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
