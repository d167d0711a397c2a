//! Prometheus metrics for the GitOps Sync Operator
//!
//! This module exposes metrics for monitoring operator health, application
//! cycles and sync operations.

mod prometheus;

pub use prometheus::*;
