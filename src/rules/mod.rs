//! Rule model - identifiers and the two relationship tables
//!
//! - **Exclusive**: trigger role → ordered set of conflict roles
//! - **Family**: kid role → exactly one parent role
//!
//! Both tables enforce their invariants on every mutation and when they are
//! deserialized, so a table value that exists is always well-formed.

pub mod legacy;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype!(
    /// Isolation scope (a chat server). Every table and every event belongs to one.
    CommunityId
);
id_newtype!(
    /// Opaque, community-scoped role token. Existence is never checked here.
    RoleId
);
id_newtype!(
    /// Member of a community
    MemberId
);

/// Ids name directories on disk and segments of platform URLs, so only
/// 1-64 characters of `[A-Za-z0-9_-]` are accepted.
fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(RuleError::validation(format!("{kind} id must be 1-64 characters")));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RuleError::validation(format!(
            "{kind} id '{}' contains unsupported characters",
            id.escape_debug()
        )));
    }
    Ok(())
}

impl CommunityId {
    pub fn validate(&self) -> Result<()> {
        validate_id("community", &self.0)
    }
}

impl RoleId {
    pub fn validate(&self) -> Result<()> {
        validate_id("role", &self.0)
    }
}

impl MemberId {
    pub fn validate(&self) -> Result<()> {
        validate_id("member", &self.0)
    }
}

/// Unordered snapshot of the roles a member holds at one instant
pub type RoleSet = BTreeSet<RoleId>;

/// The two kinds of role relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Exclusive,
    Family,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Exclusive => "exclusive",
            RuleKind::Family => "family",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exclusive" => Ok(RuleKind::Exclusive),
            "family" => Ok(RuleKind::Family),
            other => Err(RuleError::validation(format!("unknown rule kind '{other}'"))),
        }
    }
}

// =============================================================================
// Exclusive table
// =============================================================================

/// trigger → conflicts. A trigger never maps to an empty set; conflict sets
/// keep insertion order and hold no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<RoleId, Vec<RoleId>>",
    into = "BTreeMap<RoleId, Vec<RoleId>>"
)]
pub struct ExclusiveTable {
    entries: BTreeMap<RoleId, Vec<RoleId>>,
}

impl ExclusiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of triggers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of (trigger, conflict) pairs
    pub fn pair_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_trigger(&self, role: &RoleId) -> bool {
        self.entries.contains_key(role)
    }

    /// Conflicts of `trigger`, empty if it is not a trigger
    pub fn conflicts(&self, trigger: &RoleId) -> &[RoleId] {
        self.entries.get(trigger).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleId, &[RoleId])> {
        self.entries.iter().map(|(t, c)| (t, c.as_slice()))
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&RoleId, &RoleId)> {
        self.entries
            .iter()
            .flat_map(|(t, cs)| cs.iter().map(move |c| (t, c)))
    }

    /// Insert a pair. Returns `false` if it was already present.
    pub fn insert(&mut self, trigger: RoleId, conflict: RoleId) -> Result<bool> {
        trigger.validate()?;
        conflict.validate()?;
        if trigger == conflict {
            return Err(RuleError::validation(format!(
                "role {trigger} cannot exclude itself"
            )));
        }

        let conflicts = self.entries.entry(trigger).or_default();
        if conflicts.contains(&conflict) {
            return Ok(false);
        }
        conflicts.push(conflict);
        Ok(true)
    }

    /// Remove one pair, pruning the trigger when its set becomes empty
    pub fn remove_pair(&mut self, trigger: &RoleId, conflict: &RoleId) -> bool {
        let Some(conflicts) = self.entries.get_mut(trigger) else {
            return false;
        };
        let before = conflicts.len();
        conflicts.retain(|c| c != conflict);
        let removed = conflicts.len() != before;
        if conflicts.is_empty() {
            self.entries.remove(trigger);
        }
        removed
    }

    /// Remove a trigger with all of its conflicts
    pub fn remove_trigger(&mut self, trigger: &RoleId) -> bool {
        self.entries.remove(trigger).is_some()
    }
}

impl TryFrom<BTreeMap<RoleId, Vec<RoleId>>> for ExclusiveTable {
    type Error = RuleError;

    fn try_from(raw: BTreeMap<RoleId, Vec<RoleId>>) -> Result<Self> {
        let mut table = ExclusiveTable::new();
        for (trigger, conflicts) in raw {
            if conflicts.is_empty() {
                return Err(RuleError::validation(format!(
                    "trigger {trigger} has an empty conflict set"
                )));
            }
            for conflict in conflicts {
                if !table.insert(trigger.clone(), conflict.clone())? {
                    return Err(RuleError::validation(format!(
                        "trigger {trigger} lists conflict {conflict} twice"
                    )));
                }
            }
        }
        Ok(table)
    }
}

impl From<ExclusiveTable> for BTreeMap<RoleId, Vec<RoleId>> {
    fn from(table: ExclusiveTable) -> Self {
        table.entries
    }
}

// =============================================================================
// Family table
// =============================================================================

/// kid → parent. Each kid has exactly one parent; many kids may share one.
/// Chains are allowed, cycles are not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<RoleId, RoleId>", into = "BTreeMap<RoleId, RoleId>")]
pub struct FamilyTable {
    links: BTreeMap<RoleId, RoleId>,
}

impl FamilyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn parent_of(&self, kid: &RoleId) -> Option<&RoleId> {
        self.links.get(kid)
    }

    pub fn kids_of<'a>(&'a self, parent: &'a RoleId) -> impl Iterator<Item = &'a RoleId> + 'a {
        self.links
            .iter()
            .filter(move |(_, p)| *p == parent)
            .map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleId, &RoleId)> {
        self.links.iter()
    }

    /// Kids grouped under their parent, parents in order of first appearance
    pub fn grouped_by_parent(&self) -> Vec<(&RoleId, Vec<&RoleId>)> {
        let mut groups: Vec<(&RoleId, Vec<&RoleId>)> = Vec::new();
        for (kid, parent) in &self.links {
            match groups.iter_mut().find(|(p, _)| *p == parent) {
                Some((_, kids)) => kids.push(kid),
                None => groups.push((parent, vec![kid])),
            }
        }
        groups
    }

    /// Set (or overwrite) the parent of `kid`, returning the previous parent
    pub fn set(&mut self, kid: RoleId, parent: RoleId) -> Result<Option<RoleId>> {
        kid.validate()?;
        parent.validate()?;
        if kid == parent {
            return Err(RuleError::validation(format!(
                "role {kid} cannot be its own parent"
            )));
        }
        if self.reaches(&parent, &kid) {
            return Err(RuleError::validation(format!(
                "linking {kid} to {parent} would create a family cycle"
            )));
        }
        Ok(self.links.insert(kid, parent))
    }

    pub fn remove(&mut self, kid: &RoleId) -> Option<RoleId> {
        self.links.remove(kid)
    }

    /// Whether walking parent links from `from` arrives at `target`
    fn reaches(&self, from: &RoleId, target: &RoleId) -> bool {
        let mut current = from;
        // An acyclic table visits each kid at most once.
        for _ in 0..=self.links.len() {
            if current == target {
                return true;
            }
            match self.links.get(current) {
                Some(next) => current = next,
                None => return false,
            }
        }
        true
    }
}

impl TryFrom<BTreeMap<RoleId, RoleId>> for FamilyTable {
    type Error = RuleError;

    fn try_from(raw: BTreeMap<RoleId, RoleId>) -> Result<Self> {
        let mut table = FamilyTable::new();
        for (kid, parent) in raw {
            table.set(kid, parent)?;
        }
        Ok(table)
    }
}

impl From<FamilyTable> for BTreeMap<RoleId, RoleId> {
    fn from(table: FamilyTable) -> Self {
        table.links
    }
}
