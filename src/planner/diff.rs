//! Property-level diffs.
//!
//! Compares the properties recorded for a resource with the desired ones.
//! Equality is structural over the tagged property values.

use serde::Serialize;

use crate::config::{PropertyMap, PropertyValue};

/// Kind of change planned for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Resource is created.
    Create,
    /// Resource is updated in place.
    Update,
    /// Resource is deleted.
    Delete,
}

/// Difference for a single property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property name.
    pub key: String,
    /// Recorded value, absent when the property is added.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<PropertyValue>,
    /// Desired value, absent when the property is removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<PropertyValue>,
}

/// Computes the per-key differences between two property maps.
///
/// Keys come out in ascending order; unchanged keys are omitted.
#[must_use]
pub fn property_diff(before: &PropertyMap, after: &PropertyMap) -> Vec<PropertyChange> {
    let mut changes = Vec::new();

    for (key, old) in before {
        match after.get(key) {
            Some(new) if new == old => {}
            new => changes.push(PropertyChange {
                key: key.clone(),
                before: Some(old.clone()),
                after: new.cloned(),
            }),
        }
    }

    for (key, new) in after {
        if !before.contains_key(key) {
            changes.push(PropertyChange {
                key: key.clone(),
                before: None,
                after: Some(new.clone()),
            });
        }
    }

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl ChangeAction {
    /// Returns the symbol used when rendering plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
        }
    }
}

impl std::fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => write!(f, "{}: {before} -> {after}", self.key),
            (None, Some(after)) => write!(f, "{}: (none) -> {after}", self.key),
            (Some(before), None) => write!(f, "{}: {before} -> (none)", self.key),
            (None, None) => write!(f, "{}", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_changes() {
        let props = map(&[("image", "web:1".into()), ("replicas", 2_i64.into())]);
        assert!(property_diff(&props, &props.clone()).is_empty());
    }

    #[test]
    fn test_changed_added_removed() {
        let before = map(&[("image", "web:1".into()), ("size", "small".into())]);
        let after = map(&[("image", "web:2".into()), ("replicas", 3_i64.into())]);

        let changes = property_diff(&before, &after);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["image", "replicas", "size"]);

        assert_eq!(changes[0].to_string(), "image: web:1 -> web:2");
        assert_eq!(changes[1].before, None);
        assert_eq!(changes[2].after, None);
    }

    #[test]
    fn test_type_change_is_a_change() {
        let before = map(&[("replicas", "2".into())]);
        let after = map(&[("replicas", 2_i64.into())]);

        assert_eq!(property_diff(&before, &after).len(), 1);
    }
}
