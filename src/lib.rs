//! GitOps Sync Operator
//!
//! This operator reads desired state from git, compares it with the live
//! state of the cluster and drives the cluster toward it. Applications are
//! declared with the `Application` Custom Resource Definition.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod model;
pub mod reconcilers;
pub mod registry;
pub mod server;
pub mod sync;

pub use error::{Error, Result};
