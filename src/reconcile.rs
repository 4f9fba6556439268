//! Reconciliation engine
//!
//! Given a member's role set before and after a change, plus the community's
//! two rule tables, computes the role mutations that restore consistency.
//! The engine is a pure function: no I/O, no shared state.
//!
//! Steps run in a fixed order:
//!
//! 1. diff: added = after − before, removed = before − after
//! 2. family, kid added: add its parent if not held
//! 3. family, kid removed: remove its parent unless another held kid still
//!    points at it
//! 4. family, parent removed: remove every held kid of that parent
//! 5. exclusive: for each added trigger, remove every held conflict
//!
//! Checks run against the projected membership (the after-set with earlier
//! intents applied). A role receives at most one intent per event.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rules::{ExclusiveTable, FamilyTable, RoleId, RoleSet};

/// How far family rules propagate within one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Only the roles changed by the event itself are considered
    #[default]
    SingleHop,
    /// Roles changed by derived intents are fed back through the rules
    /// until nothing new is produced
    Recursive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    #[serde(default)]
    pub chain_mode: ChainMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Add,
    Remove,
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationAction::Add => f.write_str("ADD"),
            MutationAction::Remove => f.write_str("REMOVE"),
        }
    }
}

/// Why an intent was produced; rendered as the audit reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum IntentReason {
    KidAdded { kid: RoleId, parent: RoleId },
    KidRemoved { kid: RoleId, parent: RoleId },
    ParentRemoved { parent: RoleId, kid: RoleId },
    Exclusive { trigger: RoleId, conflict: RoleId },
}

impl fmt::Display for IntentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentReason::KidAdded { kid, parent } => {
                write!(f, "Family logic: Kid {kid} added, adding Parent {parent}")
            }
            IntentReason::KidRemoved { kid, parent } => {
                write!(f, "Family logic: Kid {kid} removed, removing Parent {parent}")
            }
            IntentReason::ParentRemoved { parent, kid } => {
                write!(f, "Family logic: Parent {parent} removed, removing Kid {kid}")
            }
            IntentReason::Exclusive { trigger, conflict } => write!(
                f,
                "Exclusive logic: Trigger {trigger} added, removing conflicting role {conflict}"
            ),
        }
    }
}

/// One role mutation to apply to the member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub action: MutationAction,
    pub role: RoleId,
    pub reason: IntentReason,
}

impl MutationIntent {
    pub fn add(role: RoleId, reason: IntentReason) -> Self {
        Self {
            action: MutationAction::Add,
            role,
            reason,
        }
    }

    pub fn remove(role: RoleId, reason: IntentReason) -> Self {
        Self {
            action: MutationAction::Remove,
            role,
            reason,
        }
    }
}

impl fmt::Display for MutationIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.action, self.role)
    }
}

/// Compute the ordered mutation intents for one membership change
pub fn reconcile(
    before: &RoleSet,
    after: &RoleSet,
    exclusive: &ExclusiveTable,
    family: &FamilyTable,
    options: ReconcileOptions,
) -> Vec<MutationIntent> {
    if before == after || (exclusive.is_empty() && family.is_empty()) {
        return Vec::new();
    }

    let mut planner = Planner {
        exclusive,
        family,
        held: after.clone(),
        touched: BTreeSet::new(),
        intents: Vec::new(),
    };

    let mut added: RoleSet = after.difference(before).cloned().collect();
    let mut removed: RoleSet = before.difference(after).cloned().collect();

    loop {
        let first_new = planner.intents.len();
        planner.round(&added, &removed);

        if options.chain_mode == ChainMode::SingleHop || planner.intents.len() == first_new {
            break;
        }

        added.clear();
        removed.clear();
        for intent in &planner.intents[first_new..] {
            match intent.action {
                MutationAction::Add => added.insert(intent.role.clone()),
                MutationAction::Remove => removed.insert(intent.role.clone()),
            };
        }
    }

    planner.intents
}

struct Planner<'a> {
    exclusive: &'a ExclusiveTable,
    family: &'a FamilyTable,
    /// Projected membership with intents so far applied
    held: RoleSet,
    /// Roles that already have an intent in this event
    touched: BTreeSet<RoleId>,
    intents: Vec<MutationIntent>,
}

impl Planner<'_> {
    fn round(&mut self, added: &RoleSet, removed: &RoleSet) {
        self.kids_added(added);
        self.kids_removed(removed);
        self.parents_removed(removed);
        self.exclusive_added(added);
    }

    fn kids_added(&mut self, added: &RoleSet) {
        for kid in added {
            let Some(parent) = self.family.parent_of(kid) else {
                continue;
            };
            if !self.held.contains(parent) {
                self.emit(MutationIntent::add(
                    parent.clone(),
                    IntentReason::KidAdded {
                        kid: kid.clone(),
                        parent: parent.clone(),
                    },
                ));
            }
        }
    }

    fn kids_removed(&mut self, removed: &RoleSet) {
        for kid in removed {
            let Some(parent) = self.family.parent_of(kid) else {
                continue;
            };
            if !self.held.contains(parent) {
                continue;
            }

            let sibling_held = self
                .family
                .kids_of(parent)
                .any(|other| other != kid && self.held.contains(other));
            if sibling_held {
                debug!(%kid, %parent, "Parent kept, another kid still held");
                continue;
            }

            self.emit(MutationIntent::remove(
                parent.clone(),
                IntentReason::KidRemoved {
                    kid: kid.clone(),
                    parent: parent.clone(),
                },
            ));
        }
    }

    fn parents_removed(&mut self, removed: &RoleSet) {
        for parent in removed {
            let held_kids: Vec<&RoleId> = self
                .family
                .kids_of(parent)
                .filter(|kid| self.held.contains(*kid))
                .collect();

            for kid in held_kids {
                self.emit(MutationIntent::remove(
                    kid.clone(),
                    IntentReason::ParentRemoved {
                        parent: parent.clone(),
                        kid: kid.clone(),
                    },
                ));
            }
        }
    }

    fn exclusive_added(&mut self, added: &RoleSet) {
        for trigger in added {
            for conflict in self.exclusive.conflicts(trigger) {
                if self.held.contains(conflict) {
                    self.emit(MutationIntent::remove(
                        conflict.clone(),
                        IntentReason::Exclusive {
                            trigger: trigger.clone(),
                            conflict: conflict.clone(),
                        },
                    ));
                }
            }
        }
    }

    fn emit(&mut self, intent: MutationIntent) {
        if !self.touched.insert(intent.role.clone()) {
            debug!(%intent, "Role already has an intent in this event, skipping");
            return;
        }
        match intent.action {
            MutationAction::Add => self.held.insert(intent.role.clone()),
            MutationAction::Remove => self.held.remove(&intent.role),
        };
        self.intents.push(intent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str) -> RoleId {
        RoleId::from(id)
    }

    fn set(ids: &[&str]) -> RoleSet {
        ids.iter().map(|id| r(id)).collect()
    }

    fn family(links: &[(&str, &str)]) -> FamilyTable {
        let mut table = FamilyTable::new();
        for (kid, parent) in links {
            table.set(r(kid), r(parent)).unwrap();
        }
        table
    }

    fn exclusive(pairs: &[(&str, &str)]) -> ExclusiveTable {
        let mut table = ExclusiveTable::new();
        for (trigger, conflict) in pairs {
            table.insert(r(trigger), r(conflict)).unwrap();
        }
        table
    }

    fn actions(intents: &[MutationIntent]) -> Vec<(MutationAction, String)> {
        intents
            .iter()
            .map(|i| (i.action, i.role.to_string()))
            .collect()
    }

    fn single_hop() -> ReconcileOptions {
        ReconcileOptions::default()
    }

    fn recursive() -> ReconcileOptions {
        ReconcileOptions {
            chain_mode: ChainMode::Recursive,
        }
    }

    #[test]
    fn test_no_change_yields_nothing() {
        let e = exclusive(&[("a", "b")]);
        let f = family(&[("k", "p")]);
        let s = set(&["a", "b", "k"]);
        assert!(reconcile(&s, &s, &e, &f, single_hop()).is_empty());
        assert!(reconcile(&s, &s, &e, &f, recursive()).is_empty());
    }

    #[test]
    fn test_empty_tables_yield_nothing() {
        let before = set(&["a"]);
        let after = set(&["b", "k"]);
        let intents = reconcile(
            &before,
            &after,
            &ExclusiveTable::new(),
            &FamilyTable::new(),
            single_hop(),
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn test_kid_added_adds_parent() {
        let f = family(&[("k", "p")]);
        let intents = reconcile(&set(&[]), &set(&["k"]), &ExclusiveTable::new(), &f, single_hop());
        assert_eq!(actions(&intents), vec![(MutationAction::Add, "p".into())]);
        assert_eq!(
            intents[0].reason.to_string(),
            "Family logic: Kid k added, adding Parent p"
        );
    }

    #[test]
    fn test_kid_added_parent_already_held() {
        let f = family(&[("k", "p")]);
        let intents = reconcile(
            &set(&["p"]),
            &set(&["k", "p"]),
            &ExclusiveTable::new(),
            &f,
            single_hop(),
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn test_shared_parent_guard() {
        let f = family(&[("k1", "p"), ("k2", "p")]);
        let e = ExclusiveTable::new();

        let first = reconcile(&set(&["k1", "k2", "p"]), &set(&["k2", "p"]), &e, &f, single_hop());
        assert!(first.is_empty());

        let second = reconcile(&set(&["k2", "p"]), &set(&["p"]), &e, &f, single_hop());
        assert_eq!(actions(&second), vec![(MutationAction::Remove, "p".into())]);
    }

    #[test]
    fn test_two_kids_removed_together_remove_parent_once() {
        let f = family(&[("k1", "p"), ("k2", "p")]);
        let intents = reconcile(
            &set(&["k1", "k2", "p"]),
            &set(&["p"]),
            &ExclusiveTable::new(),
            &f,
            single_hop(),
        );
        assert_eq!(actions(&intents), vec![(MutationAction::Remove, "p".into())]);
    }

    #[test]
    fn test_direct_parent_removal_cascades() {
        let f = family(&[("k1", "p")]);
        let intents = reconcile(&set(&["k1", "p"]), &set(&["k1"]), &ExclusiveTable::new(), &f, single_hop());
        assert_eq!(actions(&intents), vec![(MutationAction::Remove, "k1".into())]);
        assert_eq!(
            intents[0].reason.to_string(),
            "Family logic: Parent p removed, removing Kid k1"
        );
    }

    #[test]
    fn test_kid_and_parent_removed_together() {
        let f = family(&[("k1", "p")]);
        let intents = reconcile(&set(&["k1", "p"]), &set(&[]), &ExclusiveTable::new(), &f, single_hop());
        assert!(intents.is_empty());
    }

    #[test]
    fn test_exclusive_is_directional() {
        let e = exclusive(&[("a", "b")]);
        let f = FamilyTable::new();

        let forward = reconcile(&set(&["b"]), &set(&["a", "b"]), &e, &f, single_hop());
        assert_eq!(actions(&forward), vec![(MutationAction::Remove, "b".into())]);

        let reverse = reconcile(&set(&["a"]), &set(&["a", "b"]), &e, &f, single_hop());
        assert!(reverse.is_empty());
    }

    #[test]
    fn test_exclusive_skips_conflicts_not_held() {
        let e = exclusive(&[("a", "b"), ("a", "c")]);
        let intents = reconcile(&set(&["c"]), &set(&["a", "c"]), &e, &FamilyTable::new(), single_hop());
        assert_eq!(actions(&intents), vec![(MutationAction::Remove, "c".into())]);
    }

    #[test]
    fn test_exclusive_follows_conflict_insertion_order() {
        let e = exclusive(&[("a", "z"), ("a", "b")]);
        let intents = reconcile(
            &set(&["b", "z"]),
            &set(&["a", "b", "z"]),
            &e,
            &FamilyTable::new(),
            single_hop(),
        );
        assert_eq!(
            actions(&intents),
            vec![
                (MutationAction::Remove, "z".into()),
                (MutationAction::Remove, "b".into()),
            ]
        );
    }

    #[test]
    fn test_role_that_is_kid_and_trigger() {
        let e = exclusive(&[("k", "x")]);
        let f = family(&[("k", "p")]);
        let intents = reconcile(&set(&["x"]), &set(&["k", "x"]), &e, &f, single_hop());
        assert_eq!(
            actions(&intents),
            vec![
                (MutationAction::Add, "p".into()),
                (MutationAction::Remove, "x".into()),
            ]
        );
    }

    #[test]
    fn test_family_runs_before_exclusive() {
        // Adding k brings in p; trigger k also excludes p. Family wins, the
        // exclusive removal is not emitted for the same role.
        let e = exclusive(&[("k", "p")]);
        let f = family(&[("k", "p")]);
        let intents = reconcile(&set(&[]), &set(&["k"]), &e, &f, single_hop());
        assert_eq!(actions(&intents), vec![(MutationAction::Add, "p".into())]);
    }

    #[test]
    fn test_single_hop_does_not_walk_chain() {
        let f = family(&[("k", "p"), ("p", "g")]);
        let intents = reconcile(&set(&[]), &set(&["k"]), &ExclusiveTable::new(), &f, single_hop());
        assert_eq!(actions(&intents), vec![(MutationAction::Add, "p".into())]);
    }

    #[test]
    fn test_recursive_walks_chain_up() {
        let f = family(&[("k", "p"), ("p", "g")]);
        let intents = reconcile(&set(&[]), &set(&["k"]), &ExclusiveTable::new(), &f, recursive());
        assert_eq!(
            actions(&intents),
            vec![
                (MutationAction::Add, "p".into()),
                (MutationAction::Add, "g".into()),
            ]
        );
    }

    #[test]
    fn test_recursive_cascades_down() {
        let f = family(&[("k", "p"), ("p", "g")]);
        let intents = reconcile(
            &set(&["k", "p", "g"]),
            &set(&["k", "p"]),
            &ExclusiveTable::new(),
            &f,
            recursive(),
        );
        assert_eq!(
            actions(&intents),
            vec![
                (MutationAction::Remove, "p".into()),
                (MutationAction::Remove, "k".into()),
            ]
        );
    }

    #[test]
    fn test_recursive_applies_exclusive_to_derived_adds() {
        let e = exclusive(&[("p", "x")]);
        let f = family(&[("k", "p")]);

        let hop = reconcile(&set(&["x"]), &set(&["k", "x"]), &e, &f, single_hop());
        assert_eq!(actions(&hop), vec![(MutationAction::Add, "p".into())]);

        let deep = reconcile(&set(&["x"]), &set(&["k", "x"]), &e, &f, recursive());
        assert_eq!(
            actions(&deep),
            vec![
                (MutationAction::Add, "p".into()),
                (MutationAction::Remove, "x".into()),
            ]
        );
    }

    #[test]
    fn test_recursive_terminates_on_mutual_exclusion() {
        let e = exclusive(&[("a", "b"), ("b", "a")]);
        let f = family(&[("k", "b")]);
        let intents = reconcile(&set(&["a"]), &set(&["a", "k"]), &e, &f, recursive());
        // k brings b, b excludes a; removing a triggers nothing further
        assert_eq!(
            actions(&intents),
            vec![
                (MutationAction::Add, "b".into()),
                (MutationAction::Remove, "a".into()),
            ]
        );
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let e = exclusive(&[("a", "b")]);
        let f = family(&[("k", "p")]);
        let before = set(&["b"]);
        let after = set(&["a", "b", "k"]);
        let _ = reconcile(&before, &after, &e, &f, recursive());
        assert_eq!(before, set(&["b"]));
        assert_eq!(after, set(&["a", "b", "k"]));
    }
}
