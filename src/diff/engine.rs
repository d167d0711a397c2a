//! Desired/live comparison

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use super::normalize::{last_applied, strip_for_compare, CapabilityTable, Normalizable};
use super::{DiffStatus, FieldChange, FieldDelta, FieldPath, PathSegment, ResourceDiff};
use crate::model::{DesiredResource, LiveResource, ResourceKey};

/// Computes structural differences between desired and live resources
#[derive(Clone)]
pub struct DiffEngine {
    capabilities: Arc<CapabilityTable>,
}

impl DiffEngine {
    pub fn new(capabilities: Arc<CapabilityTable>) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Classify every key present on either side, sorted by key
    pub fn compute(&self, desired: &[DesiredResource], live: &[LiveResource]) -> Vec<ResourceDiff> {
        let desired_by_key: BTreeMap<&ResourceKey, &DesiredResource> =
            desired.iter().map(|d| (&d.key, d)).collect();
        let live_by_key: BTreeMap<&ResourceKey, &LiveResource> =
            live.iter().map(|l| (&l.key, l)).collect();

        let keys: BTreeSet<&ResourceKey> = desired_by_key
            .keys()
            .chain(live_by_key.keys())
            .copied()
            .collect();

        keys.into_iter()
            .map(|key| {
                let d = desired_by_key.get(key).copied();
                let l = live_by_key.get(key).copied();
                self.diff_one(key, d, l)
            })
            .collect()
    }

    fn diff_one(
        &self,
        key: &ResourceKey,
        desired: Option<&DesiredResource>,
        live: Option<&LiveResource>,
    ) -> ResourceDiff {
        let (status, deltas) = match (desired, live) {
            (Some(_), None) => (DiffStatus::Missing, Vec::new()),
            (None, Some(_)) => (DiffStatus::Orphaned, Vec::new()),
            (Some(d), Some(l)) => {
                let deltas = self.compare(d, l);
                if deltas.is_empty() {
                    (DiffStatus::InSync, deltas)
                } else {
                    (DiffStatus::OutOfSync, deltas)
                }
            }
            (None, None) => (DiffStatus::InSync, Vec::new()),
        };
        ResourceDiff {
            key: key.clone(),
            status,
            desired: desired.cloned(),
            live: live.cloned(),
            deltas,
        }
    }

    /// Field-level comparison of one desired object against its live counterpart
    pub fn compare(&self, desired: &DesiredResource, live: &LiveResource) -> Vec<FieldDelta> {
        let rules = self.capabilities.normalizer(&desired.key.kind);

        let mut desired_obj = strip_for_compare(desired.object.clone());
        if let Some(rules) = rules {
            rules.normalize_desired(&mut desired_obj);
        }
        let live_obj = strip_for_compare(live.object.clone());
        let previous = last_applied(&live.object).map(|mut prev| {
            if let Some(rules) = rules {
                rules.normalize_desired(&mut prev);
            }
            strip_for_compare(prev)
        });

        let mut walker = Walker {
            rules,
            three_way: previous.is_some(),
            deltas: Vec::new(),
        };
        let mut path = FieldPath::new();
        walker.walk(&mut path, &desired_obj, &live_obj, previous.as_ref());
        walker.deltas
    }
}

struct Walker<'a> {
    rules: Option<&'a dyn Normalizable>,
    /// The live object records what was last applied
    three_way: bool,
    deltas: Vec<FieldDelta>,
}

impl Walker<'_> {
    fn ignored(&self, path: &FieldPath) -> bool {
        self.rules.map(|r| r.is_ignored(path)).unwrap_or(false)
    }

    fn push(&mut self, path: &FieldPath, change: FieldChange) {
        self.deltas.push(FieldDelta {
            path: path.to_string(),
            change,
        });
    }

    fn walk(&mut self, path: &mut FieldPath, desired: &Value, live: &Value, previous: Option<&Value>) {
        if self.ignored(path) || values_equal(desired, live) {
            return;
        }
        match (desired, live) {
            (Value::Object(d), Value::Object(l)) => {
                for (k, dv) in d {
                    path.push(PathSegment::Key(k.clone()));
                    let prev = previous.and_then(|p| p.get(k));
                    match l.get(k) {
                        Some(lv) => self.walk(path, dv, lv, prev),
                        None => self.desired_only(path, dv),
                    }
                    path.pop();
                }
                for (k, lv) in l.iter().filter(|(k, _)| !d.contains_key(*k)) {
                    path.push(PathSegment::Key(k.clone()));
                    let declared_before = previous.and_then(|p| p.get(k)).is_some();
                    self.live_only(path, lv, declared_before);
                    path.pop();
                }
            }
            (Value::Array(d), Value::Array(l)) => match (named_items(d), named_items(l)) {
                (Some(d_named), Some(l_named)) => {
                    let prev_named = previous
                        .and_then(Value::as_array)
                        .and_then(|p| named_items(p));
                    for (name, dv) in &d_named {
                        path.push(PathSegment::Named(name.to_string()));
                        let prev = prev_named.as_ref().and_then(|p| p.get(name).copied());
                        match l_named.get(name) {
                            Some(lv) => self.walk(path, dv, lv, prev),
                            None => self.desired_only(path, dv),
                        }
                        path.pop();
                    }
                    for (name, lv) in l_named.iter().filter(|(n, _)| !d_named.contains_key(*n)) {
                        path.push(PathSegment::Named(name.to_string()));
                        let declared_before = prev_named
                            .as_ref()
                            .map(|p| p.contains_key(name))
                            .unwrap_or(false);
                        self.live_only(path, lv, declared_before);
                        path.pop();
                    }
                }
                _ if d.len() == l.len() => {
                    for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                        path.push(PathSegment::Index(i));
                        let prev = previous.and_then(|p| p.get(i));
                        self.walk(path, dv, lv, prev);
                        path.pop();
                    }
                }
                _ => self.push(
                    path,
                    FieldChange::Changed {
                        desired: desired.clone(),
                        live: live.clone(),
                    },
                ),
            },
            _ => self.push(
                path,
                FieldChange::Changed {
                    desired: desired.clone(),
                    live: live.clone(),
                },
            ),
        }
    }

    fn desired_only(&mut self, path: &FieldPath, desired: &Value) {
        if self.ignored(path) || is_empty_value(desired) {
            return;
        }
        self.push(
            path,
            FieldChange::Added {
                desired: desired.clone(),
            },
        );
    }

    fn live_only(&mut self, path: &mut FieldPath, live: &Value, declared_before: bool) {
        if self.ignored(path) || is_empty_value(live) {
            return;
        }
        if let Some(rules) = self.rules {
            if rules.accepts_live_only(path, live) {
                return;
            }
        }
        if self.three_way && !declared_before {
            return;
        }
        // Rules may accept individual fields of an undeclared parent
        if let Value::Object(fields) = live {
            for (k, v) in fields {
                path.push(PathSegment::Key(k.clone()));
                self.live_only(path, v, declared_before);
                path.pop();
            }
            return;
        }
        self.push(path, FieldChange::Removed { live: live.clone() });
    }
}

/// Index list items by their `name` field when every item has one
fn named_items(items: &[Value]) -> Option<BTreeMap<&str, &Value>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| item.get("name").and_then(Value::as_str).map(|n| (n, item)))
        .collect()
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Semantic equality: numbers compare by value, empty containers equal null
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Object(x), Value::Object(y)) => {
            let keys: BTreeSet<&String> = x.keys().chain(y.keys()).collect();
            keys.into_iter().all(|k| match (x.get(k), y.get(k)) {
                (Some(xv), Some(yv)) => values_equal(xv, yv),
                (Some(v), None) | (None, Some(v)) => is_empty_value(v),
                (None, None) => true,
            })
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ if is_empty_value(a) && is_empty_value(b) => true,
        _ => a == b,
    }
}
