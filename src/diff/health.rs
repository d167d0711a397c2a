//! Health checks for built-in kinds

use serde_json::Value;

use crate::crd::HealthStatus;

/// Kind-specific health evaluation of a live object
pub trait HealthEvaluable: Send + Sync {
    fn evaluate(&self, live: &Value) -> HealthStatus;
}

fn int(value: &Value, pointer: &str) -> Option<i64> {
    value.pointer(pointer).and_then(Value::as_i64)
}

fn string<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Status of the condition `type_`, if present
fn condition<'a>(live: &'a Value, type_: &str) -> Option<(&'a str, Option<&'a str>)> {
    live.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .map(|c| {
            (
                c.get("status").and_then(Value::as_str).unwrap_or("Unknown"),
                c.get("reason").and_then(Value::as_str),
            )
        })
}

/// The controller has not yet observed the latest spec
fn generation_pending(live: &Value) -> bool {
    match (
        int(live, "/metadata/generation"),
        int(live, "/status/observedGeneration"),
    ) {
        (Some(generation), Some(observed)) => observed < generation,
        (Some(_), None) => true,
        _ => false,
    }
}

pub struct DeploymentHealth;

impl HealthEvaluable for DeploymentHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if live.get("status").is_none() || generation_pending(live) {
            return HealthStatus::Progressing;
        }
        if let Some(("False", Some("ProgressDeadlineExceeded"))) = condition(live, "Progressing") {
            return HealthStatus::Degraded;
        }
        let desired = int(live, "/spec/replicas").unwrap_or(1);
        let updated = int(live, "/status/updatedReplicas").unwrap_or(0);
        let total = int(live, "/status/replicas").unwrap_or(0);
        let available = int(live, "/status/availableReplicas").unwrap_or(0);
        if updated < desired || total > updated || available < updated {
            HealthStatus::Progressing
        } else {
            HealthStatus::Healthy
        }
    }
}

pub struct StatefulSetHealth;

impl HealthEvaluable for StatefulSetHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if live.get("status").is_none() || generation_pending(live) {
            return HealthStatus::Progressing;
        }
        let desired = int(live, "/spec/replicas").unwrap_or(1);
        let ready = int(live, "/status/readyReplicas").unwrap_or(0);
        let rolling = string(live, "/spec/updateStrategy/type").unwrap_or("RollingUpdate")
            == "RollingUpdate";
        let updated = int(live, "/status/updatedReplicas").unwrap_or(0);
        let partition = int(live, "/spec/updateStrategy/rollingUpdate/partition").unwrap_or(0);
        if ready < desired || (rolling && partition == 0 && updated < desired) {
            HealthStatus::Progressing
        } else {
            HealthStatus::Healthy
        }
    }
}

pub struct DaemonSetHealth;

impl HealthEvaluable for DaemonSetHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if live.get("status").is_none() || generation_pending(live) {
            return HealthStatus::Progressing;
        }
        let desired = int(live, "/status/desiredNumberScheduled").unwrap_or(0);
        let updated = int(live, "/status/updatedNumberScheduled").unwrap_or(0);
        let available = int(live, "/status/numberAvailable").unwrap_or(0);
        if updated < desired || available < desired {
            HealthStatus::Progressing
        } else {
            HealthStatus::Healthy
        }
    }
}

pub struct JobHealth;

impl HealthEvaluable for JobHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if let Some(("True", _)) = condition(live, "Failed") {
            return HealthStatus::Degraded;
        }
        match condition(live, "Complete") {
            Some(("True", _)) => HealthStatus::Healthy,
            _ => HealthStatus::Progressing,
        }
    }
}

pub struct PodHealth;

const BAD_WAIT_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

impl HealthEvaluable for PodHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        let statuses = live
            .pointer("/status/containerStatuses")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let stuck = statuses.iter().any(|s| {
            s.pointer("/state/waiting/reason")
                .and_then(Value::as_str)
                .map(|r| BAD_WAIT_REASONS.contains(&r))
                .unwrap_or(false)
        });
        if stuck {
            return HealthStatus::Degraded;
        }
        match string(live, "/status/phase") {
            Some("Succeeded") => HealthStatus::Healthy,
            Some("Failed") => HealthStatus::Degraded,
            Some("Pending") => HealthStatus::Progressing,
            Some("Running") => {
                let all_ready = statuses
                    .iter()
                    .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false));
                if all_ready {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Progressing
                }
            }
            _ => HealthStatus::Unknown,
        }
    }
}

pub struct ServiceHealth;

impl HealthEvaluable for ServiceHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if string(live, "/spec/type") != Some("LoadBalancer") {
            return HealthStatus::Healthy;
        }
        if has_load_balancer_ingress(live) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Progressing
        }
    }
}

pub struct IngressHealth;

impl HealthEvaluable for IngressHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        if has_load_balancer_ingress(live) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Progressing
        }
    }
}

fn has_load_balancer_ingress(live: &Value) -> bool {
    live.pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false)
}

pub struct PvcHealth;

impl HealthEvaluable for PvcHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        match string(live, "/status/phase") {
            Some("Bound") => HealthStatus::Healthy,
            Some("Pending") => HealthStatus::Progressing,
            Some("Lost") => HealthStatus::Degraded,
            _ => HealthStatus::Unknown,
        }
    }
}

pub struct NamespaceHealth;

impl HealthEvaluable for NamespaceHealth {
    fn evaluate(&self, live: &Value) -> HealthStatus {
        match string(live, "/status/phase") {
            None | Some("Active") => HealthStatus::Healthy,
            Some("Terminating") => HealthStatus::Progressing,
            Some(_) => HealthStatus::Unknown,
        }
    }
}
