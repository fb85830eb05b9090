//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of desired resource specs. The
//! hash is recorded in plans and in the deployment history.

use sha2::{Digest, Sha256};

use super::spec::{PropertyValue, ResourceSpec};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of a desired spec set.
    ///
    /// Independent of declaration order.
    #[must_use]
    pub fn hash_specs(&self, specs: &[ResourceSpec]) -> String {
        let mut hasher = Sha256::new();

        let mut sorted: Vec<&ResourceSpec> = specs.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for spec in sorted {
            hasher.update(self.hash_spec(spec).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource spec.
    #[must_use]
    pub fn hash_spec(&self, spec: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(spec.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(spec.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(spec.provider.as_bytes());
        hasher.update([0u8]);

        // BTreeMap iteration is ordered, which keeps this deterministic
        for (key, value) in &spec.properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            Self::update_value(&mut hasher, value);
        }

        let mut dependencies: Vec<&String> = spec.depends_on.iter().collect();
        dependencies.sort();
        for dependency in dependencies {
            hasher.update(b"dep:");
            hasher.update(dependency.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    fn update_value(hasher: &mut Sha256, value: &PropertyValue) {
        match value {
            PropertyValue::Bool(b) => hasher.update([b'b', u8::from(*b)]),
            PropertyValue::Integer(i) => {
                hasher.update(b"i");
                hasher.update(i.to_be_bytes());
            }
            PropertyValue::Float(x) => {
                hasher.update(b"f");
                hasher.update(x.to_bits().to_be_bytes());
            }
            PropertyValue::String(s) => {
                hasher.update(b"s");
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            PropertyValue::List(items) => {
                hasher.update(b"l");
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    Self::update_value(hasher, item);
                }
            }
            PropertyValue::Map(entries) => {
                hasher.update(b"m");
                hasher.update((entries.len() as u64).to_be_bytes());
                for (key, item) in entries {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    Self::update_value(hasher, item);
                }
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_spec(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, "instance", "local")
            .with_property("image", "web:1")
            .with_property("replicas", 2_i64)
    }

    #[test]
    fn test_spec_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let spec = create_test_spec("web");

        assert_eq!(hasher.hash_spec(&spec), hasher.hash_spec(&spec));
    }

    #[test]
    fn test_different_specs_different_hash() {
        let hasher = ConfigHasher::new();
        let web = create_test_spec("web");
        let changed = create_test_spec("web").with_property("replicas", 3_i64);

        assert_ne!(hasher.hash_spec(&web), hasher.hash_spec(&create_test_spec("api")));
        assert_ne!(hasher.hash_spec(&web), hasher.hash_spec(&changed));
    }

    #[test]
    fn test_set_hash_ignores_order() {
        let hasher = ConfigHasher::new();
        let a = [create_test_spec("a"), create_test_spec("b")];
        let b = [create_test_spec("b"), create_test_spec("a")];

        assert_eq!(hasher.hash_specs(&a), hasher.hash_specs(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
