//! Compose document loading helpers.
//!
//! The converter (`values::converter`) works directly over the generic
//! `serde_yaml::Value` tree so the "reject anything not in the documented
//! subset" behavior falls out of the conversion itself rather than a
//! strongly-typed intermediate struct.

use std::path::Path;

use crate::errors::{Result, ValidationError};

/// Infers whether `path` is a Docker Compose file from its name alone,
/// erring on the side of false negatives.
pub fn is_docker_compose_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with("compose.yaml") || name.ends_with("compose.yml")
}

/// Reads and parses a Compose file from disk into a generic YAML value.
pub fn load_compose_file(path: &Path) -> Result<serde_yaml::Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ValidationError::Other(format!("could not read compose file '{}': {e}", path.display()))
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_compose_file_by_suffix() {
        assert!(is_docker_compose_file(Path::new("docker-compose.yaml")));
        assert!(is_docker_compose_file(Path::new("compose.yml")));
        assert!(!is_docker_compose_file(Path::new("helm-values.yaml")));
        assert!(!is_docker_compose_file(Path::new("values.yaml")));
    }
}
