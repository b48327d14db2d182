//! Result extensions for logging failures with caller context.
//!
//! Housekeeping paths (retention sweeps, fire-and-forget notifications)
//! must never fail a run, so they log through `swallow` and move on.

use std::fmt::Display;
use tracing::{error, warn};

/// Extension trait for logging errors with context.
pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant and
    /// hand the result back unchanged.
    ///
    /// ```ignore
    /// use flowmesh_engine::result_ext::ResultExt;
    ///
    /// let result: Result<i32, &str> = Err("broker unavailable");
    /// let _ = result.log("publishing run notification");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Log the error at warn level and discard it.
    fn swallow<S: ToString>(self, context: S) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "flowmesh_engine",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn swallow<S: ToString>(self, context: S) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let caller_location = std::panic::Location::caller();
                warn!(
                    target: "flowmesh_engine",
                    error = %e,
                    file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                    context = %context.to_string(),
                    "Ignoring failed best-effort operation"
                );
                None
            }
        }
    }
}
