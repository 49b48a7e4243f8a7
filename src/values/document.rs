//! Validation rules shared by every `ValuesSource` variant.
//!
//! A converted values document must contain no `null` leaves before it's
//! handed to Helm, since a stray `null` serializes to YAML `null`, which the
//! chart's templates choke on.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Result, ValidationError};

static SERVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("valid regex"));

/// Recursively rejects any `null` leaf in a parsed values document.
pub fn validate_no_null_values(doc: &serde_yaml::Value, source: &str) -> Result<()> {
    walk_for_null(doc, source, String::new())
}

fn walk_for_null(value: &serde_yaml::Value, source: &str, path: String) -> Result<()> {
    match value {
        serde_yaml::Value::Null => Err(ValidationError::NullValue {
            path: if path.is_empty() { "<root>".to_string() } else { path },
            source: source.to_string(),
        }
        .into()),
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().map(str::to_string).unwrap_or_else(|| format!("{k:?}"));
                let child_path = if path.is_empty() { key } else { format!("{path}.{key}") };
                walk_for_null(v, source, child_path)?;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => {
            for (i, v) in seq.iter().enumerate() {
                walk_for_null(v, source, format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validates a single candidate service name against the DNS-1123-ish rule
/// used for Helm values `services` keys:
/// `^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$`, length <= 63.
pub fn validate_k8s_service_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("service name cannot be empty".to_string());
    }
    if name.len() > 63 {
        return Err(format!("service name '{name}' is too long (max 63 characters)"));
    }
    if !SERVICE_NAME_RE.is_match(name) {
        return Err(format!(
            "service name '{name}' must consist only of lowercase alphanumeric characters, '-' or \
             '.', and must start and end with an alphanumeric character"
        ));
    }
    Ok(())
}

/// Validates every key under `services:` in a parsed values document.
pub fn validate_service_names(doc: &serde_yaml::Value) -> Result<()> {
    let Some(services) = doc.get("services").and_then(|v| v.as_mapping()) else {
        return Ok(());
    };
    let mut invalid = Vec::new();
    for key in services.keys() {
        let Some(name) = key.as_str() else { continue };
        if let Err(reason) = validate_k8s_service_name(name) {
            invalid.push((name.to_string(), reason));
        }
    }
    if let Some((name, reason)) = invalid.into_iter().next() {
        return Err(ValidationError::InvalidServiceName { name, reason }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_leaf_anywhere() {
        let doc: serde_yaml::Value = serde_yaml::from_str("services:\n  web:\n    image: null\n").unwrap();
        let err = validate_no_null_values(&doc, "test").unwrap_err();
        assert!(err.to_string().contains("services.web.image"));
    }

    #[test]
    fn accepts_document_without_nulls() {
        let doc: serde_yaml::Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n").unwrap();
        assert!(validate_no_null_values(&doc, "test").is_ok());
    }

    #[test]
    fn service_name_rules() {
        assert!(validate_k8s_service_name("web").is_ok());
        assert!(validate_k8s_service_name("web-browser").is_ok());
        assert!(validate_k8s_service_name("web.v2").is_ok());
        assert!(validate_k8s_service_name("-invalid-start").is_err());
        assert!(validate_k8s_service_name("invalid-end-").is_err());
        assert!(validate_k8s_service_name("Invalid_Service").is_err());
        assert!(validate_k8s_service_name("").is_err());
        assert!(validate_k8s_service_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn validates_all_service_keys() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("services:\n  Invalid_Service:\n    image: redis\n").unwrap();
        assert!(validate_service_names(&doc).is_err());
    }
}
