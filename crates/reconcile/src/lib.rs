//! Three-way diff between a declared collection and an upstream collection.
//!
//! Used identically for team memberships (connector/group/user) and trusted
//! fingerprint sets; the only per-use variation is which fetch/apply
//! primitives the caller plugs in. The diff itself is pure and does no I/O.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One collection entry: a principal (or fingerprint hash) and its role.
/// Collections without roles use an empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub key: String,
    pub role: String,
}

impl Assignment {
    pub fn new(key: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            role: role.into(),
        }
    }
}

/// Result of classifying desired against upstream entries by key.
///
/// Appliers must run `revoke` and `update_role` before `add` so a key moving
/// between roles never collides upstream. Entries are sorted by key, which
/// makes the plan deterministic for a given input set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Present upstream, absent in the declaration.
    pub revoke: Vec<String>,
    /// Present on both sides with a different role.
    pub update_role: Vec<Assignment>,
    /// Declared but absent upstream.
    pub add: Vec<Assignment>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.revoke.is_empty() && self.update_role.is_empty() && self.add.is_empty()
    }
}

/// Classify every key into revoke / update-role / add. Keys present on both
/// sides with an equal role produce no action.
pub fn diff_memberships(desired: &[Assignment], upstream: &[Assignment]) -> MembershipDiff {
    let desired_by_key: HashMap<&str, &str> = desired
        .iter()
        .map(|a| (a.key.as_str(), a.role.as_str()))
        .collect();
    let upstream_by_key: HashMap<&str, &str> = upstream
        .iter()
        .map(|a| (a.key.as_str(), a.role.as_str()))
        .collect();

    let mut out = MembershipDiff::default();
    for a in upstream {
        match desired_by_key.get(a.key.as_str()) {
            None => out.revoke.push(a.key.clone()),
            Some(role) if *role != a.role => {
                out.update_role.push(Assignment::new(&a.key, *role));
            }
            Some(_) => {}
        }
    }
    for a in desired {
        if !upstream_by_key.contains_key(a.key.as_str()) {
            out.add.push(a.clone());
        }
    }
    out.revoke.sort();
    out.update_role.sort_by(|a, b| a.key.cmp(&b.key));
    out.add.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(key: &str, role: &str) -> Assignment {
        Assignment::new(key, role)
    }

    #[test]
    fn classifies_revoke_add_and_keep() {
        let desired = vec![a("A", "role1"), a("B", "role2")];
        let upstream = vec![a("A", "role1"), a("C", "role3")];
        let diff = diff_memberships(&desired, &upstream);
        assert_eq!(diff.revoke, vec!["C".to_string()]);
        assert_eq!(diff.add, vec![a("B", "role2")]);
        assert!(diff.update_role.is_empty());
    }

    #[test]
    fn role_change_becomes_update_not_add() {
        let desired = vec![a("A", "role9"), a("B", "role2")];
        let upstream = vec![a("A", "role1"), a("C", "role3")];
        let diff = diff_memberships(&desired, &upstream);
        assert_eq!(diff.update_role, vec![a("A", "role9")]);
        assert_eq!(diff.revoke, vec!["C".to_string()]);
        assert_eq!(diff.add, vec![a("B", "role2")]);
    }

    #[test]
    fn equal_sides_produce_empty_plan() {
        let both = vec![a("A", "r"), a("B", "r")];
        let diff = diff_memberships(&both, &both);
        assert!(diff.is_empty());
    }

    #[test]
    fn roleless_collections_diff_on_keys_alone() {
        // Fingerprint sets carry no role.
        let desired = vec![a("sha256:aaa", ""), a("sha256:bbb", "")];
        let upstream = vec![a("sha256:bbb", ""), a("sha256:ccc", "")];
        let diff = diff_memberships(&desired, &upstream);
        assert_eq!(diff.revoke, vec!["sha256:ccc".to_string()]);
        assert_eq!(diff.add, vec![a("sha256:aaa", "")]);
        assert!(diff.update_role.is_empty());
    }

    #[test]
    fn plan_is_sorted_for_determinism() {
        let desired = vec![a("z", "r"), a("m", "r"), a("a", "r")];
        let upstream: Vec<Assignment> = vec![];
        let diff = diff_memberships(&desired, &upstream);
        let keys: Vec<&str> = diff.add.iter().map(|x| x.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }
}
