//! OF-022: Tag reconciliation.
//!
//! Tags are user-defined pairs stored at the top level of an object's
//! template. Updates are diff-based: only keys named in the old or new tag
//! maps are touched, so unmanaged template keys survive.

use super::DynTemplate;
use std::collections::{BTreeMap, BTreeSet};

pub type TagMap = BTreeMap<String, String>;

/// Difference between two tag maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: TagMap,
    pub removed: BTreeSet<String>,
    pub changed: TagMap,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Delete removed and changed keys, then add new and changed pairs.
    pub fn apply(&self, template: &mut DynTemplate) {
        for key in self.removed.iter().chain(self.changed.keys()) {
            template.del(key);
        }
        for (key, value) in self.added.iter().chain(self.changed.iter()) {
            template.add_pair(key, value);
        }
    }
}

/// Compute the difference between the old and new tag maps.
///
/// Keys are compared case-insensitively, as they all land upper-cased in
/// the remote template.
pub fn diff_tags(old: &TagMap, new: &TagMap) -> TagDiff {
    let old = normalize(old);
    let new = normalize(new);
    let mut diff = TagDiff::default();

    for (key, value) in &new {
        match old.get(key) {
            None => {
                diff.added.insert(key.clone(), value.clone());
            }
            Some(previous) if previous != value => {
                diff.changed.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.removed.insert(key.clone());
        }
    }

    diff
}

fn normalize(tags: &TagMap) -> TagMap {
    tags.iter()
        .map(|(k, v)| (k.to_uppercase(), v.clone()))
        .collect()
}

/// Effective tag set: provider default tags overlaid with resource tags.
pub fn merge_default_tags(defaults: &TagMap, tags: &TagMap) -> TagMap {
    let mut all = defaults.clone();
    for (key, value) in tags {
        // Resource keys win even when spelled in another case.
        all.retain(|k, _| !k.eq_ignore_ascii_case(key));
        all.insert(key.clone(), value.clone());
    }
    all
}

/// Add every tag to a template being built for creation.
pub fn add_tags(template: &mut DynTemplate, tags: &TagMap) {
    for (key, value) in tags {
        template.set_pair(key, value);
    }
}

/// Read back the declared tags from a remote template.
///
/// Only declared keys are surfaced, under the declared spelling. Keys
/// missing remotely are left out so the next plan sees the difference.
pub fn read_tags(template: &DynTemplate, declared: &TagMap) -> TagMap {
    declared
        .keys()
        .filter_map(|key| {
            template
                .get_str(key)
                .map(|value| (key.clone(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_of022_diff_classifies_keys() {
        let old = tags(&[("env", "prod"), ("team", "a"), ("gone", "x")]);
        let new = tags(&[("env", "prod"), ("team", "b"), ("fresh", "y")]);
        let diff = diff_tags(&old, &new);
        assert_eq!(diff.added, tags(&[("FRESH", "y")]));
        assert_eq!(diff.changed, tags(&[("TEAM", "b")]));
        assert_eq!(diff.removed, BTreeSet::from(["GONE".to_string()]));
    }

    #[test]
    fn test_of022_diff_is_case_insensitive() {
        let diff = diff_tags(&tags(&[("Env", "a")]), &tags(&[("ENV", "a")]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_of022_apply_preserves_unmanaged_keys() {
        let mut t = parse("NAME=\"c1\"\nRESERVED_CPU=\"-100\"\nENV=\"prod\"\nTEAM=\"a\"\nGONE=\"x\"").unwrap();
        let diff = diff_tags(
            &tags(&[("env", "prod"), ("team", "a"), ("gone", "x")]),
            &tags(&[("env", "prod"), ("team", "b"), ("fresh", "y")]),
        );
        diff.apply(&mut t);
        assert_eq!(t.get_str("NAME"), Some("c1"));
        assert_eq!(t.get_str("RESERVED_CPU"), Some("-100"));
        assert_eq!(t.get_str("ENV"), Some("prod"));
        assert_eq!(t.get_str("TEAM"), Some("b"));
        assert_eq!(t.get_str("FRESH"), Some("y"));
        assert!(!t.contains_key("GONE"));
    }

    #[test]
    fn test_of022_default_tags_overridden_by_resource() {
        let defaults = tags(&[("OWNER", "ops"), ("env", "dev")]);
        let resource = tags(&[("env", "prod")]);
        let all = merge_default_tags(&defaults, &resource);
        assert_eq!(all, tags(&[("OWNER", "ops"), ("env", "prod")]));
    }

    #[test]
    fn test_of022_read_only_declared() {
        let t = parse("ENV=\"prod\"\nOTHER=\"1\"").unwrap();
        let read = read_tags(&t, &tags(&[("env", "dev"), ("missing", "x")]));
        assert_eq!(read, tags(&[("env", "prod")]));
    }

    #[test]
    fn test_of022_add_tags_replaces_existing() {
        let mut t = parse("ENV=\"old\"").unwrap();
        add_tags(&mut t, &tags(&[("env", "new")]));
        assert_eq!(t.get_str("ENV"), Some("new"));
        assert_eq!(t.elements.len(), 1);
    }
}
