//! Controllers for the GitOps Sync Operator
//!
//! The Application controller watches the CRD and feeds the registry; the
//! supervisor runs one worker and one drift watcher per registered
//! application.

mod application_controller;
pub mod drift_watcher;
pub mod supervisor;
pub mod worker;

pub use application_controller::{run as run_application_controller, FINALIZER_NAME};

use std::sync::Arc;

use kube::Client;

use crate::reconcilers::application::ApplicationReconciler;
use crate::registry::RegistryHandle;

/// Shared context for the Application controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Registry of running applications
    pub registry: RegistryHandle,
    /// Used for cascade deletes
    pub reconciler: Arc<ApplicationReconciler>,
    /// Field manager for status patches
    pub field_manager: String,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        registry: RegistryHandle,
        reconciler: Arc<ApplicationReconciler>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            registry,
            reconciler,
            field_manager: field_manager.into(),
        }
    }
}
