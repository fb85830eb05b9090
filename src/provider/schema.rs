//! Resource schemas published by providers.
//!
//! A schema lists the properties a resource type accepts, their kinds and
//! whether they are required. Specs are checked against it while planning, so
//! a mistyped property is rejected before any provider call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{PropertyKind, ResourceSpec};
use crate::error::ConfigError;

/// Schema of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Accepted kind.
    pub kind: PropertyKind,
    /// Whether the property must be present.
    #[serde(default)]
    pub required: bool,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource type this schema applies to.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Known properties.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
    /// Whether properties not listed in `fields` are accepted.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl ResourceSchema {
    /// Creates an empty schema for a resource type.
    #[must_use]
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            fields: BTreeMap::new(),
            allow_unknown: false,
        }
    }

    /// Adds a required property.
    #[must_use]
    pub fn required(mut self, name: &str, kind: PropertyKind) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                kind,
                required: true,
                description: None,
            },
        );
        self
    }

    /// Adds an optional property.
    #[must_use]
    pub fn optional(mut self, name: &str, kind: PropertyKind) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                kind,
                required: false,
                description: None,
            },
        );
        self
    }

    /// Checks a spec's properties against this schema.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Schema` listing every missing, unknown or
    /// mistyped property.
    pub fn validate(&self, spec: &ResourceSpec) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        for (name, field) in &self.fields {
            match spec.properties.get(name) {
                None if field.required => problems.push(format!("missing required property '{name}'")),
                Some(value) if !field.kind.accepts(value) => problems.push(format!(
                    "property '{name}' must be {}, got {}",
                    field.kind,
                    value.kind()
                )),
                _ => {}
            }
        }

        if !self.allow_unknown {
            for name in spec.properties.keys() {
                if !self.fields.contains_key(name) {
                    problems.push(format!("unknown property '{name}'"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Schema {
                resource: spec.name.clone(),
                resource_type: spec.resource_type.clone(),
                provider: spec.provider.clone(),
                message: problems.join("; "),
            })
        }
    }
}

/// Schemas of the resource types the built-in providers manage.
#[must_use]
pub fn builtin_schemas() -> BTreeMap<String, ResourceSchema> {
    [
        ResourceSchema::new("instance")
            .required("image", PropertyKind::String)
            .optional("size", PropertyKind::String)
            .optional("replicas", PropertyKind::Integer)
            .optional("ports", PropertyKind::List)
            .optional("env", PropertyKind::Map),
        ResourceSchema::new("database")
            .required("engine", PropertyKind::String)
            .optional("version", PropertyKind::String)
            .optional("storage_gb", PropertyKind::Integer),
        ResourceSchema::new("network")
            .required("cidr", PropertyKind::String)
            .optional("public", PropertyKind::Bool),
    ]
    .into_iter()
    .map(|schema| (schema.resource_type.clone(), schema))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_spec_passes() {
        let schemas = builtin_schemas();
        let spec = ResourceSpec::new("web", "instance", "local")
            .with_property("image", "web:1")
            .with_property("replicas", 2_i64);

        assert!(schemas["instance"].validate(&spec).is_ok());
    }

    #[test]
    fn test_problems_collected() {
        let schemas = builtin_schemas();
        let spec = ResourceSpec::new("web", "instance", "local")
            .with_property("replicas", "two")
            .with_property("colour", "blue");

        let err = schemas["instance"].validate(&spec).expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("missing required property 'image'"), "{message}");
        assert!(message.contains("property 'replicas' must be integer, got string"));
        assert!(message.contains("unknown property 'colour'"));
        assert!(message.contains("resource 'web'"));
    }

    #[test]
    fn test_allow_unknown() {
        let mut schema = ResourceSchema::new("bucket");
        schema.allow_unknown = true;
        let spec = ResourceSpec::new("assets", "bucket", "plugin").with_property("anything", true);

        assert!(schema.validate(&spec).is_ok());
    }

    #[test]
    fn test_schema_wire_format() {
        let json = r#"{"type": "queue", "fields": {"fifo": {"kind": "bool", "required": true}}}"#;
        let schema: ResourceSchema = serde_json::from_str(json).expect("parse");

        assert_eq!(schema.resource_type, "queue");
        assert!(schema.fields["fifo"].required);
        assert_eq!(schema.fields["fifo"].kind, PropertyKind::Bool);
        assert!(!schema.allow_unknown);
    }
}
