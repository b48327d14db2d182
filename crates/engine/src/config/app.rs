//! Application configuration for the flowmesh engine.

use std::time::Duration;

use serde::Deserialize;

/// How the dispatch gateway hands work to functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Publish a work request on the work channel; executors pull it.
    Queue,
    /// POST the input directly to the function's service URL.
    Push,
}

/// Which instance repository backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Postgres,
    Memory,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOWMESH_`:
/// - `FLOWMESH_HOST` / `FLOWMESH_PORT`: HTTP bind address (default `0.0.0.0:8090`)
/// - `FLOWMESH_NATS_URL`: NATS server; without it the engine runs on an in-process queue
/// - `FLOWMESH_DISPATCH_MODE`: `queue` (default) or `push`
/// - `FLOWMESH_STORAGE`: `postgres` (default) or `memory`
/// - `FLOWMESH_FUNCTION_CATALOG_URL` / `FLOWMESH_WORKFLOW_CATALOG_URL`: collaborator services
/// - `FLOWMESH_RETENTION_KEEP_DAYS` / `FLOWMESH_RETENTION_MAX_COUNT`: retention sweep
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// JetStream stream holding the work, result and deployment subjects
    #[serde(default = "default_stream")]
    pub nats_stream: String,

    /// Durable consumer name used by the engine
    #[serde(default = "default_consumer")]
    pub nats_consumer: String,

    #[serde(default = "default_work_subject")]
    pub work_subject: String,

    #[serde(default = "default_result_subject")]
    pub result_subject: String,

    #[serde(default = "default_deployment_subject")]
    pub deployment_subject: String,

    #[serde(default = "default_notification_subject")]
    pub notification_subject: String,

    /// Messages handled concurrently by the consumer loop
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,

    #[serde(default = "default_dispatch_mode")]
    pub dispatch_mode: DispatchMode,

    #[serde(default = "default_storage")]
    pub storage: StorageKind,

    /// URL functions post their results to in push mode
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    #[serde(default = "default_function_catalog_url")]
    pub function_catalog_url: String,

    #[serde(default = "default_workflow_catalog_url")]
    pub workflow_catalog_url: String,

    /// Timeout for outbound HTTP calls in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Ceiling on waiting for lazily deployed functions, in seconds
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_secs: u64,

    /// Interval between deployment state polls, in seconds
    #[serde(default = "default_deployment_poll")]
    pub deployment_poll_secs: u64,

    /// Deployment watchers allowed to run at the same time
    #[serde(default = "default_max_deployment_watchers")]
    pub max_deployment_watchers: usize,

    /// Top-level runs younger than this are always kept
    #[serde(default = "default_retention_keep_days")]
    pub retention_keep_days: i64,

    /// Minimum number of top-level runs that survive a sweep
    #[serde(default = "default_retention_max_count")]
    pub retention_max_count: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "flowmesh-engine".to_string()
}

fn default_stream() -> String {
    "flowmesh_runs".to_string()
}

fn default_consumer() -> String {
    "flowmesh-engine".to_string()
}

fn default_work_subject() -> String {
    "flowmesh.work".to_string()
}

fn default_result_subject() -> String {
    "flowmesh.results".to_string()
}

fn default_deployment_subject() -> String {
    "flowmesh.deployments".to_string()
}

fn default_notification_subject() -> String {
    "flowmesh.notifications".to_string()
}

fn default_max_concurrent_messages() -> usize {
    16
}

fn default_dispatch_mode() -> DispatchMode {
    DispatchMode::Queue
}

fn default_storage() -> StorageKind {
    StorageKind::Postgres
}

fn default_callback_url() -> String {
    "http://localhost:8090/api/callback".to_string()
}

fn default_function_catalog_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_workflow_catalog_url() -> String {
    "http://localhost:8082".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_deployment_timeout() -> u64 {
    600
}

fn default_deployment_poll() -> u64 {
    5
}

fn default_max_deployment_watchers() -> usize {
    8
}

fn default_retention_keep_days() -> i64 {
    7
}

fn default_retention_max_count() -> usize {
    30
}

impl AppConfig {
    /// Load configuration from environment variables prefixed with `FLOWMESH_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOWMESH_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    pub fn deployment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deployment_poll_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            nats_url: None,
            nats_stream: default_stream(),
            nats_consumer: default_consumer(),
            work_subject: default_work_subject(),
            result_subject: default_result_subject(),
            deployment_subject: default_deployment_subject(),
            notification_subject: default_notification_subject(),
            max_concurrent_messages: default_max_concurrent_messages(),
            dispatch_mode: default_dispatch_mode(),
            storage: default_storage(),
            callback_url: default_callback_url(),
            function_catalog_url: default_function_catalog_url(),
            workflow_catalog_url: default_workflow_catalog_url(),
            http_timeout_secs: default_http_timeout(),
            deployment_timeout_secs: default_deployment_timeout(),
            deployment_poll_secs: default_deployment_poll(),
            max_deployment_watchers: default_max_deployment_watchers(),
            retention_keep_days: default_retention_keep_days(),
            retention_max_count: default_retention_max_count(),
        }
    }
}
