//! Diff Engine
//!
//! Compares desired manifests against live cluster objects. Normalization
//! strips server-populated data and applies kind-specific rules from the
//! [`CapabilityTable`] so that defaults injected by the API server never show
//! up as drift.

mod engine;
mod health;
mod normalize;

pub use engine::*;
pub use health::*;
pub use normalize::*;

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::crd::SyncStatus;
use crate::model::{DesiredResource, LiveResource, ResourceKey};

/// Classification of one desired/live pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DiffStatus {
    InSync,
    OutOfSync,
    Missing,
    Orphaned,
}

impl DiffStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DiffStatus::InSync => "InSync",
            DiffStatus::OutOfSync => "OutOfSync",
            DiffStatus::Missing => "Missing",
            DiffStatus::Orphaned => "Orphaned",
        }
    }
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One segment of a field path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    /// List element matched by its `name` field
    Named(String),
}

/// Location of a field inside an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) {
        self.0.pop();
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                PathSegment::Named(name) => write!(f, "[name={}]", name)?,
            }
        }
        Ok(())
    }
}

/// How a single field differs
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldChange {
    /// Present on both sides with different values
    Changed { desired: Value, live: Value },
    /// Declared but absent from the live object
    Added { desired: Value },
    /// Present live, previously declared, no longer desired
    Removed { live: Value },
}

/// Field-level difference
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldDelta {
    pub path: String,
    pub change: FieldChange,
}

/// Comparison result for one resource key
#[derive(Clone, Debug)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub status: DiffStatus,
    pub desired: Option<DesiredResource>,
    pub live: Option<LiveResource>,
    pub deltas: Vec<FieldDelta>,
}

impl ResourceDiff {
    /// apiVersion used to address the resource, preferring the desired one
    pub fn api_version(&self) -> &str {
        self.desired
            .as_ref()
            .map(|d| d.api_version.as_str())
            .or_else(|| self.live.as_ref().map(|l| l.api_version.as_str()))
            .unwrap_or_default()
    }

    /// Whether the pair needs action; orphans count only when prune is on
    pub fn is_drift(&self, prune: bool) -> bool {
        match self.status {
            DiffStatus::InSync => false,
            DiffStatus::OutOfSync | DiffStatus::Missing => true,
            DiffStatus::Orphaned => prune,
        }
    }
}

/// Aggregate sync status; any non-InSync pair (orphans included) is OutOfSync
pub fn aggregate_sync_status(diffs: &[ResourceDiff]) -> SyncStatus {
    if diffs.iter().all(|d| d.status == DiffStatus::InSync) {
        SyncStatus::Synced
    } else {
        SyncStatus::OutOfSync
    }
}
