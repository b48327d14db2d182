//! Row types for the instance tables.

pub mod instance;

pub use instance::*;
