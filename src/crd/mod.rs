//! Custom Resource Definitions for the GitOps Sync Operator

mod application;

pub use application::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&Application::crd()).unwrap()]
}
