//! Sync Executor
//!
//! Plans create/update/delete operations from a diff and executes them in
//! dependency order against the cluster.

mod executor;
mod plan;

pub use executor::*;
pub use plan::*;
