//! Versioned and revision properties

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property value
pub type PropertyValue = String;

/// One property change: a `None` value deletes the property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropChange {
    pub name: String,
    pub value: Option<PropertyValue>,
}

/// Property set of a node, transaction or revision
///
/// Ordered by name so that serialized forms are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    /// Create a new empty property set
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Set or delete depending on `value`
    pub fn apply(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(v) => self.set(name, v),
            None => {
                self.remove(name);
            }
        }
    }

    /// List all property names
    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter()
    }

    /// Changes that turn `self` into `target`, sorted by name.
    pub fn diff(&self, target: &PropertySet) -> Vec<PropChange> {
        let mut changes = Vec::new();
        for (name, value) in &self.properties {
            match target.get(name) {
                None => changes.push(PropChange {
                    name: name.clone(),
                    value: None,
                }),
                Some(v) if v != value => changes.push(PropChange {
                    name: name.clone(),
                    value: Some(v.clone()),
                }),
                Some(_) => {}
            }
        }
        for (name, value) in &target.properties {
            if !self.contains(name) {
                changes.push(PropChange {
                    name: name.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        changes.sort_by(|a, b| a.name.cmp(&b.name));
        changes
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}

/// Standard property names
pub mod svn_props {
    pub const EXECUTABLE: &str = "svn:executable";
    pub const MIME_TYPE: &str = "svn:mime-type";
    pub const IGNORE: &str = "svn:ignore";
    pub const EOL_STYLE: &str = "svn:eol-style";
    pub const KEYWORDS: &str = "svn:keywords";
    pub const NEEDS_LOCK: &str = "svn:needs-lock";
    pub const SPECIAL: &str = "svn:special";
    pub const EXTERNALS: &str = "svn:externals";
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    // Revision properties
    pub const REVISION_AUTHOR: &str = "svn:author";
    pub const REVISION_LOG: &str = "svn:log";
    pub const REVISION_DATE: &str = "svn:date";

    // Entry properties sent to working copies
    pub const ENTRY_PREFIX: &str = "svn:entry:";
    pub const ENTRY_LOCK_TOKEN: &str = "svn:entry:lock-token";

    pub const EXECUTABLE_VALUE: &str = "*";

    /// Check if a property name is an SVN standard property
    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }

    /// Entry props are generated, never stored on nodes
    pub fn is_entry_property(name: &str) -> bool {
        name.starts_with(ENTRY_PREFIX)
    }
}

/// Format a timestamp the way `svn:date` stores it
pub fn format_svn_date(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Parse an `svn:date` value
pub fn parse_svn_date(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_set_basic_operations() {
        let mut prop_set = PropertySet::new();
        assert!(prop_set.get("test").is_none());
        assert!(!prop_set.contains("test"));

        prop_set.set("test", "value");
        assert_eq!(prop_set.get("test"), Some(&"value".to_string()));

        let removed = prop_set.remove("test");
        assert_eq!(removed, Some("value".to_string()));
        assert!(prop_set.is_empty());
    }

    #[test]
    fn test_apply_none_deletes() {
        let mut props = PropertySet::new();
        props.apply("svn:eol-style", Some("native"));
        assert!(props.contains(svn_props::EOL_STYLE));
        props.apply("svn:eol-style", None);
        assert!(!props.contains(svn_props::EOL_STYLE));
    }

    #[test]
    fn test_diff() {
        let mut a = PropertySet::new();
        a.set("keep", "1");
        a.set("gone", "x");
        a.set("changed", "old");
        let mut b = PropertySet::new();
        b.set("keep", "1");
        b.set("changed", "new");
        b.set("added", "y");

        let changes = a.diff(&b);
        assert_eq!(
            changes,
            vec![
                PropChange { name: "added".into(), value: Some("y".into()) },
                PropChange { name: "changed".into(), value: Some("new".into()) },
                PropChange { name: "gone".into(), value: None },
            ]
        );
        assert!(b.diff(&b).is_empty());
    }

    #[test]
    fn test_svn_standard_properties() {
        use svn_props::*;
        assert!(is_svn_property("svn:executable"));
        assert!(!is_svn_property("custom:myprop"));
        assert!(is_entry_property(ENTRY_LOCK_TOKEN));
        assert!(!is_entry_property(REVISION_LOG));
    }

    #[test]
    fn test_svn_date_roundtrip() {
        let dt = chrono::DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap();
        let s = format_svn_date(&dt);
        assert_eq!(s, "2023-11-14T22:13:20.123000Z");
        assert_eq!(parse_svn_date(&s), Some(dt));
    }
}
