//! Variable substitution in resource properties.
//!
//! String properties may reference `${var.NAME}`, `${tag.NAME}`, `${env}` and
//! `${region}`. A string that consists of exactly one `${var.NAME}` reference
//! takes the variable's value with its type preserved, so `"${var.replicas}"`
//! renders to an integer when the variable is one.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use super::spec::{PropertyMap, PropertyValue};

/// Values available to templates for one environment.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    environment: &'a str,
    region: Option<&'a str>,
    variables: &'a PropertyMap,
    tags: &'a BTreeMap<String, String>,
}

impl<'a> TemplateContext<'a> {
    /// Creates a template context.
    #[must_use]
    pub const fn new(
        environment: &'a str,
        region: Option<&'a str>,
        variables: &'a PropertyMap,
        tags: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            environment,
            region,
            variables,
            tags,
        }
    }

    fn lookup(&self, reference: &str) -> Option<PropertyValue> {
        match reference {
            "env" => Some(PropertyValue::from(self.environment)),
            "region" => self.region.map(PropertyValue::from),
            _ => {
                if let Some(name) = reference.strip_prefix("var.") {
                    self.variables.get(name).cloned()
                } else if let Some(name) = reference.strip_prefix("tag.") {
                    self.tags.get(name).map(|t| PropertyValue::from(t.as_str()))
                } else {
                    None
                }
            }
        }
    }
}

/// Renders every property of a resource.
///
/// # Errors
///
/// Returns `ConfigError::UnresolvedReference` for unknown or unterminated
/// references.
pub fn render_properties(
    resource: &str,
    properties: &PropertyMap,
    context: &TemplateContext<'_>,
) -> Result<PropertyMap, ConfigError> {
    properties
        .iter()
        .map(|(key, value)| {
            render_value(value, context)
                .map(|rendered| (key.clone(), rendered))
                .map_err(|reference| ConfigError::UnresolvedReference {
                    resource: resource.to_string(),
                    property: key.clone(),
                    reference,
                })
        })
        .collect()
}

fn render_value(value: &PropertyValue, context: &TemplateContext<'_>) -> Result<PropertyValue, String> {
    match value {
        PropertyValue::String(s) => render_string(s, context),
        PropertyValue::List(items) => items
            .iter()
            .map(|item| render_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(PropertyValue::List),
        PropertyValue::Map(entries) => entries
            .iter()
            .map(|(k, v)| render_value(v, context).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(PropertyValue::Map),
        other => Ok(other.clone()),
    }
}

fn render_string(input: &str, context: &TemplateContext<'_>) -> Result<PropertyValue, String> {
    if let Some(reference) = input.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !reference.contains("${") && !reference.contains('}') {
            return context.lookup(reference).ok_or_else(|| reference.to_string());
        }
    }

    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| after.to_string())?;
        let reference = &after[..end];
        let value = context.lookup(reference).ok_or_else(|| reference.to_string())?;
        output.push_str(&value.to_string());
        rest = &after[end + 1..];
    }
    output.push_str(rest);

    Ok(PropertyValue::String(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (PropertyMap, BTreeMap<String, String>) {
        let mut variables = PropertyMap::new();
        variables.insert(String::from("image_tag"), PropertyValue::from("1.4.2"));
        variables.insert(String::from("replicas"), PropertyValue::Integer(3));

        let mut tags = BTreeMap::new();
        tags.insert(String::from("team"), String::from("platform"));
        (variables, tags)
    }

    #[test]
    fn test_interpolation() {
        let (variables, tags) = fixtures();
        let context = TemplateContext::new("staging", Some("eu-west-1"), &variables, &tags);

        let rendered = render_string("web:${var.image_tag}-${env}@${region}/${tag.team}", &context);
        assert_eq!(
            rendered,
            Ok(PropertyValue::from("web:1.4.2-staging@eu-west-1/platform"))
        );
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let (variables, tags) = fixtures();
        let context = TemplateContext::new("staging", None, &variables, &tags);

        assert_eq!(
            render_string("${var.replicas}", &context),
            Ok(PropertyValue::Integer(3))
        );
        assert_eq!(
            render_string("n=${var.replicas}", &context),
            Ok(PropertyValue::from("n=3"))
        );
    }

    #[test]
    fn test_nested_values_rendered() {
        let (variables, tags) = fixtures();
        let context = TemplateContext::new("dev", None, &variables, &tags);

        let value = PropertyValue::List(vec![PropertyValue::from("${env}"), PropertyValue::Bool(true)]);
        assert_eq!(
            render_value(&value, &context),
            Ok(PropertyValue::List(vec![PropertyValue::from("dev"), PropertyValue::Bool(true)]))
        );
    }

    #[test]
    fn test_unknown_reference() {
        let (variables, tags) = fixtures();
        let context = TemplateContext::new("dev", None, &variables, &tags);

        let mut properties = PropertyMap::new();
        properties.insert(String::from("image"), PropertyValue::from("web:${var.missing}"));

        let err = render_properties("web", &properties, &context).expect_err("unknown variable");
        assert!(matches!(
            err,
            ConfigError::UnresolvedReference { ref reference, .. } if reference == "var.missing"
        ));

        // No region configured
        assert!(render_string("${region}", &context).is_err());
        // Unterminated
        assert!(render_string("x-${env", &context).is_err());
    }
}
