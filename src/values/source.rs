//! The polymorphic values provider.
//!
//! A single `with_values_file` scoped operation dispatches on the kind of
//! source, rather than a trait with three implementations. The scope is
//! expressed as an async closure so a `tempfile::NamedTempFile`'s `Drop`
//! guarantees deletion when the scope exits, without a separate cleanup
//! step to remember.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::values::{converter, document};

pub enum ValuesSource {
    /// No values file supplied.
    None,
    /// A user-supplied, already-Helm-shaped values file.
    Static(PathBuf),
    /// A Compose file on disk, converted on demand.
    ComposeFile(PathBuf),
    /// An in-memory Compose document, converted on demand.
    ComposeDoc(serde_yaml::Value),
}

impl ValuesSource {
    /// Validates a static values file: must parse as a mapping and contain
    /// no null leaves.
    pub fn validate_static_file(path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&contents)?;
        document::validate_no_null_values(&doc, &path.display().to_string())?;
        document::validate_service_names(&doc)?;
        Ok(())
    }

    /// Runs `scope` with the resolved values file path (or `None`),
    /// guaranteeing any temporary file created for a Compose conversion is
    /// deleted once `scope` returns.
    pub async fn with_values_file<F, Fut, T>(&self, scope: F) -> Result<T>
    where
        F: FnOnce(Option<&Path>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            ValuesSource::None => scope(None).await,
            ValuesSource::Static(path) => {
                Self::validate_static_file(path)?;
                scope(Some(path)).await
            }
            ValuesSource::ComposeFile(path) => {
                let source = path.display().to_string();
                let compose = crate::values::compose::load_compose_file(path)?;
                let converted = converter::convert_compose_to_values(&compose, &source)?;
                Self::materialize_and_scope(&converted, &source, scope).await
            }
            ValuesSource::ComposeDoc(doc) => {
                let source = "in-memory compose document".to_string();
                let converted = converter::convert_compose_to_values(doc, &source)?;
                Self::materialize_and_scope(&converted, &source, scope).await
            }
        }
    }

    async fn materialize_and_scope<F, Fut, T>(converted: &serde_yaml::Value, source: &str, scope: F) -> Result<T>
    where
        F: FnOnce(Option<&Path>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        document::validate_no_null_values(converted, source)?;
        document::validate_service_names(converted)?;
        let yaml = serde_yaml::to_string(converted)?;
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        scope(Some(file.path())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_yields_no_path() {
        let source = ValuesSource::None;
        let result = source.with_values_file(|p| async move { Ok(p.is_none()) }).await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn compose_doc_materializes_a_temp_file_that_parses_back() {
        let doc: serde_yaml::Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n").unwrap();
        let source = ValuesSource::ComposeDoc(doc);
        let result = source
            .with_values_file(|p| async move {
                let path = p.expect("path present");
                let contents = std::fs::read_to_string(path)?;
                Ok(contents.contains("dnsRecord"))
            })
            .await
            .unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn static_file_rejects_null_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        std::fs::write(&path, "services:\n  web:\n    image: null\n").unwrap();
        let source = ValuesSource::Static(path);
        let result = source.with_values_file(|_| async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
