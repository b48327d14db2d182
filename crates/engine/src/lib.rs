//! flowmesh engine library
//!
//! Executes workflow runs that are driven entirely by messages: a run
//! advances when a step result, a deployment outcome or an operator
//! action arrives, never by a thread waiting on it.
//!
//! ## Architecture
//!
//! Run and step state lives in the instance store (PostgreSQL or
//! in-memory). Work goes out through the dispatch gateway, either as a
//! work request on the queue or as an HTTP push to the function itself.
//! Results come back on the result channel and are fed to the workflow
//! runner, which decides what runs next.
//!
//! ## Modules
//!
//! - [`catalog`]: workflow and function catalog clients
//! - [`config`]: configuration loading from environment variables
//! - [`db`]: PostgreSQL pool, schema and queries
//! - [`definition`]: workflow and step definitions
//! - [`dispatch`]: dispatch gateway and wire messages
//! - [`engine`]: runner, expression evaluator and deployment watcher
//! - [`expression`]: bracketed-reference expression compiler
//! - [`handlers`]: HTTP route handlers
//! - [`queue`]: queue abstraction over NATS JetStream and memory
//! - [`store`]: instance repository and store service
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowmesh_engine::{
//!     catalog::{MemoryFunctionCatalog, MemoryWorkflowCatalog},
//!     config::{AppConfig, DispatchMode},
//!     dispatch::DispatchGateway,
//!     engine::{RunnerSettings, WorkflowRunner},
//!     queue::MemoryQueue,
//!     store::{InstanceStore, MemoryInstanceRepository},
//! };
//!
//! let queue = Arc::new(MemoryQueue::new());
//! let store = InstanceStore::new(Arc::new(MemoryInstanceRepository::new()), queue.clone());
//! let gateway = DispatchGateway::new(queue.clone(), DispatchMode::Queue, "http://engine/api/callback", timeout);
//! let runner = WorkflowRunner::new(
//!     store,
//!     gateway,
//!     Arc::new(MemoryFunctionCatalog::new()),
//!     Arc::new(MemoryWorkflowCatalog::new()),
//!     queue,
//!     RunnerSettings::default(),
//! );
//! ```

pub mod catalog;
pub mod config;
pub mod db;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod expression;
pub mod handlers;
pub mod queue;
pub mod result_ext;
pub mod state;
pub mod store;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
