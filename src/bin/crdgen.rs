//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the Application
//! resource defined by the gitops-sync-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use gitops_sync_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
