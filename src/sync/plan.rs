//! Sync planning: turns diffs into ordered steps of operations

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde_json::Value;

use crate::diff::{CapabilityTable, DiffStatus, ResourceDiff};
use crate::model::{
    OpOutcome, OperationRecord, ResourceKey, SyncAction, DEPENDS_ON_ANNOTATION,
    SYNC_WAVE_ANNOTATION,
};

/// Highest kind tier; unknown kinds land here
pub const MAX_TIER: u8 = 11;

/// Apply order of a kind; lower tiers are created first and deleted last
pub fn kind_tier(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" | "PersistentVolume"
        | "StorageClass" => 5,
        "StatefulSet" => 6,
        "Deployment" | "DaemonSet" | "ReplicaSet" | "Pod" => 7,
        "Job" | "CronJob" => 8,
        "Service" => 9,
        "Ingress" => 10,
        _ => MAX_TIER,
    }
}

fn phase_rank(action: SyncAction) -> u8 {
    match action {
        SyncAction::Create => 0,
        SyncAction::Update => 1,
        SyncAction::Delete => 2,
    }
}

/// One planned operation
#[derive(Clone, Debug, PartialEq)]
pub struct SyncOperation {
    pub key: ResourceKey,
    pub api_version: String,
    pub action: SyncAction,
    /// Desired object for creates and updates
    pub object: Option<Value>,
    pub wave: i32,
    pub tier: u8,
    /// Extra steps inserted after the wave/tier position to honor dependencies
    pub depth: usize,
    /// Operations in this plan that must succeed first
    pub depends_on: Vec<ResourceKey>,
}

/// Ordered steps; operations in one step are independent of each other
#[derive(Clone, Debug, Default)]
pub struct SyncPlan {
    pub steps: Vec<Vec<SyncOperation>>,
    /// Operations refused at planning time (dependency cycles)
    pub rejected: Vec<OperationRecord>,
    /// Informational notes such as blocked prunes
    pub warnings: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.rejected.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = &SyncOperation> {
        self.steps.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.operations().count() + self.rejected.len()
    }
}

/// Planning switches
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanOptions {
    /// Delete orphaned resources
    pub prune: bool,
    /// Hold back prunes for this cycle, e.g. while some manifests are invalid
    pub prune_suspended: bool,
}

fn annotation<'a>(object: &'a Value, name: &str) -> Option<&'a str> {
    object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(name))
        .and_then(Value::as_str)
}

/// Build the ordered plan for a set of diffs
pub fn plan(diffs: &[ResourceDiff], options: PlanOptions, capabilities: &CapabilityTable) -> SyncPlan {
    let mut warnings = Vec::new();
    let mut ops: Vec<SyncOperation> = Vec::new();
    let mut declared: Vec<Vec<ResourceKey>> = Vec::new();

    // Scope as resolved for the diffed resources themselves
    let cluster_kinds: BTreeSet<&str> = diffs
        .iter()
        .filter(|d| d.key.namespace.is_none())
        .map(|d| d.key.kind.as_str())
        .collect();
    let cluster_scoped =
        |kind: &str| cluster_kinds.contains(kind) || capabilities.is_cluster_scoped(kind);

    for diff in diffs {
        let action = match diff.status {
            DiffStatus::InSync => continue,
            DiffStatus::Missing => SyncAction::Create,
            DiffStatus::OutOfSync => SyncAction::Update,
            DiffStatus::Orphaned if !options.prune => {
                warnings.push(format!(
                    "PruneBlocked: {} is no longer declared; enable prune to delete it",
                    diff.key
                ));
                continue;
            }
            DiffStatus::Orphaned if options.prune_suspended => {
                warnings.push(format!(
                    "PruneBlocked: {} kept while some manifests are invalid",
                    diff.key
                ));
                continue;
            }
            DiffStatus::Orphaned => SyncAction::Delete,
        };

        let source = match action {
            SyncAction::Delete => diff.live.as_ref().map(|l| &l.object),
            _ => diff.desired.as_ref().map(|d| &d.object),
        };
        let Some(source) = source else {
            continue;
        };

        let wave = annotation(source, SYNC_WAVE_ANNOTATION)
            .and_then(|w| w.trim().parse().ok())
            .unwrap_or(0);

        let mut deps = Vec::new();
        if let Some(refs) = annotation(source, DEPENDS_ON_ANNOTATION) {
            for reference in refs.split(',').filter(|r| !r.trim().is_empty()) {
                let dep = ResourceKey::parse_ref(
                    reference,
                    diff.key.namespace.as_deref(),
                    &cluster_scoped,
                );
                match dep {
                    Some(dep) => deps.push(dep),
                    None => warnings.push(format!(
                        "Ignoring invalid dependency '{}' on {}",
                        reference.trim(),
                        diff.key
                    )),
                }
            }
        }
        if let Some(ns) = &diff.key.namespace {
            deps.push(ResourceKey::cluster("Namespace", ns.clone()));
        }

        ops.push(SyncOperation {
            key: diff.key.clone(),
            api_version: diff.api_version().to_string(),
            action,
            object: match action {
                SyncAction::Delete => None,
                _ => Some(source.clone()),
            },
            wave,
            tier: kind_tier(&diff.key.kind),
            depth: 0,
            depends_on: Vec::new(),
        });
        declared.push(deps);
    }

    let (steps, rejected) = order(ops, &declared);
    SyncPlan {
        steps,
        rejected,
        warnings,
    }
}

/// Position of an operation before dependencies are considered
fn base_order(op: &SyncOperation) -> (u8, i32, u8) {
    let tier = match op.action {
        SyncAction::Delete => MAX_TIER - op.tier,
        _ => op.tier,
    };
    (phase_rank(op.action), op.wave, tier)
}

/// Assign every operation a level and group by level.
///
/// Base levels are spaced `n + 1` apart; a dependency chain is at most
/// `n - 1` long, so a bumped level stays below the next base level.
fn order(
    mut ops: Vec<SyncOperation>,
    declared: &[Vec<ResourceKey>],
) -> (Vec<Vec<SyncOperation>>, Vec<OperationRecord>) {
    let n = ops.len();
    let index: HashMap<ResourceKey, usize> =
        ops.iter().enumerate().map(|(i, op)| (op.key.clone(), i)).collect();

    // preds[i]: operations that must finish before i
    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (i, deps) in declared.iter().enumerate() {
        for dep in deps {
            let Some(&j) = index.get(dep) else {
                continue;
            };
            if i == j {
                continue;
            }
            match (ops[i].action, ops[j].action) {
                (SyncAction::Delete, SyncAction::Delete) => {
                    preds[j].insert(i);
                }
                (SyncAction::Delete, _) | (_, SyncAction::Delete) => {}
                _ => {
                    preds[i].insert(j);
                }
            }
        }
    }
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ps) in preds.iter().enumerate() {
        for &p in ps {
            succs[p].push(i);
        }
    }

    let ranks: BTreeSet<(u8, i32, u8)> = ops.iter().map(base_order).collect();
    let rank_of: BTreeMap<(u8, i32, u8), usize> =
        ranks.into_iter().enumerate().map(|(r, o)| (o, r)).collect();
    let base: Vec<usize> = ops
        .iter()
        .map(|op| rank_of[&base_order(op)] * (n + 1))
        .collect();

    let mut indegree: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut level = base.clone();
    let mut done = vec![false; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    while let Some(i) = queue.pop_front() {
        done[i] = true;
        level[i] = preds[i]
            .iter()
            .map(|&p| level[p] + 1)
            .fold(base[i], usize::max);
        for &s in &succs[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                queue.push_back(s);
            }
        }
    }

    let keys: Vec<ResourceKey> = ops.iter().map(|op| op.key.clone()).collect();
    for (i, op) in ops.iter_mut().enumerate() {
        op.depends_on = preds[i].iter().map(|&p| keys[p].clone()).collect();
        op.depth = level[i].saturating_sub(base[i]);
    }

    let mut rejected = Vec::new();
    let stuck: BTreeSet<usize> = (0..n).filter(|&i| !done[i]).collect();
    let on_cycle: BTreeSet<usize> = stuck
        .iter()
        .copied()
        .filter(|&i| reaches(i, i, &succs, &stuck))
        .collect();
    if !on_cycle.is_empty() {
        let members: Vec<String> = on_cycle.iter().map(|&i| ops[i].key.to_string()).collect();
        let members = members.join(", ");
        for &i in &stuck {
            let record = if on_cycle.contains(&i) {
                let mut r = OperationRecord::skipped(
                    ops[i].key.clone(),
                    ops[i].action,
                    format!("dependency cycle between {}", members),
                );
                r.outcome = OpOutcome::Failed;
                r
            } else {
                OperationRecord::skipped(
                    ops[i].key.clone(),
                    ops[i].action,
                    "depends on an operation in a dependency cycle",
                )
            };
            rejected.push(record);
        }
        rejected.sort_by(|a, b| a.key.cmp(&b.key));
    }

    let mut grouped: BTreeMap<usize, Vec<SyncOperation>> = BTreeMap::new();
    for (i, op) in ops.into_iter().enumerate() {
        if done[i] {
            grouped.entry(level[i]).or_default().push(op);
        }
    }
    let steps = grouped
        .into_values()
        .map(|mut step| {
            step.sort_by(|a, b| a.key.cmp(&b.key));
            step
        })
        .collect();
    (steps, rejected)
}

/// Whether `to` is reachable from `from` through at least one edge inside `within`
fn reaches(from: usize, to: usize, succs: &[Vec<usize>], within: &BTreeSet<usize>) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = succs[from].clone();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if within.contains(&node) && seen.insert(node) {
            stack.extend(succs[node].iter().copied());
        }
    }
    false
}
