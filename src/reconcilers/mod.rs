//! Reconcilers for the GitOps Sync Operator
//!
//! This module contains the business logic behind the controllers.
//! Reconcilers are responsible for:
//! - Validating Application specs
//! - Running reconciliation cycles and cascade deletes
//! - Projecting application status

pub mod application;
