//! Desired vs. observed rule-group diffs, per ruler namespace.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{RuleGroup, RuleGroupsByNamespace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleGroupDiff {
    Add { desired: RuleGroup },
    Remove { actual: RuleGroup },
    Update { desired: RuleGroup, actual: RuleGroup },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    Add,
    Remove,
    Update,
}

impl DiffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffKind::Add => "add",
            DiffKind::Remove => "remove",
            DiffKind::Update => "update",
        }
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl RuleGroupDiff {
    pub fn kind(&self) -> DiffKind {
        match self {
            RuleGroupDiff::Add { .. } => DiffKind::Add,
            RuleGroupDiff::Remove { .. } => DiffKind::Remove,
            RuleGroupDiff::Update { .. } => DiffKind::Update,
        }
    }

    pub fn group_name(&self) -> &str {
        match self {
            RuleGroupDiff::Add { desired } | RuleGroupDiff::Update { desired, .. } => &desired.name,
            RuleGroupDiff::Remove { actual } => &actual.name,
        }
    }
}

pub type RuleGroupDiffsByNamespace = BTreeMap<String, Vec<RuleGroupDiff>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn of<'a>(diffs: impl IntoIterator<Item = &'a RuleGroupDiff>) -> Self {
        let mut s = Self::default();
        for d in diffs {
            match d.kind() {
                DiffKind::Add => s.adds += 1,
                DiffKind::Update => s.updates += 1,
                DiffKind::Remove => s.removes += 1,
            }
        }
        s
    }

    pub fn total(&self) -> usize { self.adds + self.updates + self.removes }
}

/// Compare desired against observed state. Namespaces without changes are
/// left out; diffs within a namespace are ordered by group name.
pub fn diff_rule_state(desired: &RuleGroupsByNamespace, actual: &RuleGroupsByNamespace) -> RuleGroupDiffsByNamespace {
    let empty: Vec<RuleGroup> = Vec::new();
    let namespaces: BTreeSet<&String> = desired.keys().chain(actual.keys()).collect();
    let mut out = RuleGroupDiffsByNamespace::new();
    for ns in namespaces {
        let d = desired.get(ns).unwrap_or(&empty);
        let a = actual.get(ns).unwrap_or(&empty);
        let sub = diff_namespace(d, a);
        if !sub.is_empty() {
            out.insert(ns.clone(), sub);
        }
    }
    out
}

fn diff_namespace(desired: &[RuleGroup], actual: &[RuleGroup]) -> Vec<RuleGroupDiff> {
    fn by_name(groups: &[RuleGroup]) -> BTreeMap<&str, &RuleGroup> {
        groups.iter().map(|g| (g.name.as_str(), g)).collect()
    }
    let want = by_name(desired);
    let have = by_name(actual);
    let names: BTreeSet<&str> = want.keys().chain(have.keys()).copied().collect();

    let mut out = Vec::new();
    for name in names {
        match (want.get(name), have.get(name)) {
            (Some(d), None) => out.push(RuleGroupDiff::Add { desired: (*d).clone() }),
            (None, Some(a)) => out.push(RuleGroupDiff::Remove { actual: (*a).clone() }),
            (Some(d), Some(a)) if d != a => {
                out.push(RuleGroupDiff::Update { desired: (*d).clone(), actual: (*a).clone() })
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Rule;

    fn group(name: &str, exprs: &[&str]) -> RuleGroup {
        RuleGroup {
            name: name.into(),
            rules: exprs.iter().enumerate().map(|(i, e)| Rule::alerting(&format!("A{i}"), e)).collect(),
            ..RuleGroup::default()
        }
    }

    fn state(entries: &[(&str, Vec<RuleGroup>)]) -> RuleGroupsByNamespace {
        entries.iter().map(|(ns, gs)| (ns.to_string(), gs.clone())).collect()
    }

    #[test]
    fn add_update_and_unchanged_in_one_namespace() {
        let g1 = group("g1", &["up == 0"]);
        let g2 = group("g2", &["rate(x[5m]) > 1"]);
        let g2_old = group("g2", &["rate(x[5m]) > 2"]);
        let desired = state(&[("ns-a", vec![g2.clone(), g1.clone()])]);
        let actual = state(&[("ns-a", vec![g2_old.clone()])]);

        let diffs = diff_rule_state(&desired, &actual);
        assert_eq!(diffs.len(), 1);
        assert_eq!(
            diffs["ns-a"],
            vec![
                RuleGroupDiff::Add { desired: g1 },
                RuleGroupDiff::Update { desired: g2, actual: g2_old },
            ]
        );
    }

    #[test]
    fn every_group_gets_at_most_one_entry() {
        let keep = group("keep", &["a"]);
        let desired = state(&[
            ("both", vec![keep.clone(), group("new", &["b"]), group("changed", &["c2"])]),
            ("desired-only", vec![group("x", &["x"])]),
        ]);
        let actual = state(&[
            ("both", vec![group("changed", &["c1"]), keep, group("gone", &["d"])]),
            ("actual-only", vec![group("y", &["y"]), group("z", &["z"])]),
        ]);
        let diffs = diff_rule_state(&desired, &actual);

        let kinds = |ns: &str| diffs[ns].iter().map(|d| (d.group_name(), d.kind())).collect::<Vec<_>>();
        assert_eq!(
            kinds("both"),
            vec![
                ("changed", DiffKind::Update),
                ("gone", DiffKind::Remove),
                ("new", DiffKind::Add),
            ]
        );
        assert_eq!(kinds("desired-only"), vec![("x", DiffKind::Add)]);
        assert_eq!(kinds("actual-only"), vec![("y", DiffKind::Remove), ("z", DiffKind::Remove)]);
        assert_eq!(DiffSummary::of(diffs.values().flatten()), DiffSummary { adds: 2, updates: 1, removes: 3 });
    }

    #[test]
    fn rule_order_matters_but_group_order_does_not() {
        let a = group("g", &["one", "two"]);
        let b = group("g", &["two", "one"]);
        let h = group("h", &["h"]);
        let same = diff_rule_state(&state(&[("ns", vec![a.clone(), h.clone()])]), &state(&[("ns", vec![h, a.clone()])]));
        assert!(same.is_empty());

        let reordered = diff_rule_state(&state(&[("ns", vec![a])]), &state(&[("ns", vec![b])]));
        assert_eq!(reordered["ns"][0].kind(), DiffKind::Update);
    }

    #[test]
    fn empty_namespaces_produce_no_diff() {
        let desired = state(&[("ns", vec![])]);
        let actual = state(&[("ns", vec![]), ("other", vec![])]);
        assert!(diff_rule_state(&desired, &actual).is_empty());
        assert!(diff_rule_state(&RuleGroupsByNamespace::new(), &RuleGroupsByNamespace::new()).is_empty());
    }

    #[test]
    fn diff_against_applied_state_is_empty() {
        let desired = state(&[("ns-a", vec![group("g1", &["a"]), group("g2", &["b"])])]);
        let mut actual = state(&[("ns-a", vec![group("g2", &["old"])]), ("ns-b", vec![group("g", &["c"])])]);
        for (ns, diffs) in diff_rule_state(&desired, &actual) {
            let groups = actual.entry(ns.clone()).or_default();
            for d in diffs {
                match d {
                    RuleGroupDiff::Add { desired } | RuleGroupDiff::Update { desired, .. } => {
                        groups.retain(|g| g.name != desired.name);
                        groups.push(desired);
                    }
                    RuleGroupDiff::Remove { actual } => groups.retain(|g| g.name != actual.name),
                }
            }
        }
        assert!(diff_rule_state(&desired, &actual).is_empty());
    }
}
