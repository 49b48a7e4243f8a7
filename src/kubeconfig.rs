//! Kubeconfig / context resolver.
//!
//! `kube::Client` is `Clone + Send + Sync`, so a single process-wide cache
//! keyed by context name is sufficient; there is no need for the
//! thread-local client cache a synchronous Kubernetes client would require.

use std::collections::HashMap;
use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio::sync::{Mutex, OnceCell};

use crate::errors::{Result, ValidationError};

const INCLUSTER_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, Clone)]
struct KubeContext {
    name: String,
    namespace: Option<String>,
}

enum Mode {
    InCluster,
    Kubeconfig { contexts: Vec<KubeContext>, current: Option<String> },
}

/// The process-wide kubeconfig/context resolver. Initialized once, under a
/// lock, the first time [`KubeConfig::instance`] is called; the resolved
/// mode is frozen thereafter.
pub struct KubeConfig {
    mode: Mode,
    clients: Mutex<HashMap<Option<String>, kube::Client>>,
}

static INSTANCE: OnceCell<KubeConfig> = OnceCell::const_new();

impl KubeConfig {
    /// Returns the singleton resolver, loading in-cluster or kubeconfig
    /// credentials on first access.
    pub async fn instance() -> Result<&'static KubeConfig> {
        INSTANCE.get_or_try_init(Self::load).await
    }

    async fn load() -> Result<KubeConfig> {
        if let Ok(config) = kube::Config::incluster() {
            // Verify the client actually builds before committing to in-cluster mode.
            if kube::Client::try_from(config).is_ok() {
                trace!("loaded in-cluster Kubernetes configuration");
                return Ok(KubeConfig { mode: Mode::InCluster, clients: Mutex::new(HashMap::new()) });
            }
        }

        let kubeconfig = Kubeconfig::read().map_err(|e| ValidationError::Other(format!("could not read kubeconfig: {e}")))?;
        let current = kubeconfig.current_context.clone();
        let contexts = kubeconfig
            .contexts
            .iter()
            .map(|ctx| KubeContext {
                name: ctx.name.clone(),
                namespace: ctx.context.as_ref().and_then(|c| c.namespace.clone()),
            })
            .collect();
        trace!("loaded kubeconfig-based Kubernetes configuration");
        Ok(KubeConfig { mode: Mode::Kubeconfig { contexts, current }, clients: Mutex::new(HashMap::new()) })
    }

    /// Resolves the default namespace for `context_name` (`None` = current
    /// context), falling back to `"default"`.
    pub fn get_default_namespace(&self, context_name: Option<&str>) -> Result<String> {
        match &self.mode {
            Mode::InCluster => {
                if context_name.is_some() {
                    return Err(ValidationError::NamedContextInCluster(context_name.unwrap().to_string()).into());
                }
                Ok(std::fs::read_to_string(Path::new(INCLUSTER_NAMESPACE_PATH))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "default".to_string()))
            }
            Mode::Kubeconfig { contexts, current } => {
                let resolved = self.resolve_context(contexts, current.as_deref(), context_name)?;
                Ok(resolved.namespace.unwrap_or_else(|| "default".to_string()))
            }
        }
    }

    /// Validates that `context_name` exists in the kubeconfig file (or
    /// rejects it outright when running in-cluster).
    pub fn validate_context_name(&self, context_name: &str) -> Result<()> {
        match &self.mode {
            Mode::InCluster => Err(ValidationError::NamedContextInCluster(context_name.to_string()).into()),
            Mode::Kubeconfig { contexts, .. } => {
                self.resolve_context(contexts, None, Some(context_name))?;
                Ok(())
            }
        }
    }

    fn resolve_context<'a>(
        &self,
        contexts: &'a [KubeContext],
        current: Option<&str>,
        requested: Option<&str>,
    ) -> Result<&'a KubeContext> {
        match requested {
            None => {
                let name = current.ok_or(ValidationError::NoCurrentContext)?;
                contexts
                    .iter()
                    .find(|c| c.name == name)
                    .ok_or(ValidationError::NoCurrentContext)
            }
            Some(name) => {
                if contexts.is_empty() {
                    return Err(ValidationError::NoContexts.into());
                }
                contexts.iter().find(|c| c.name == name).ok_or_else(|| {
                    ValidationError::UnknownContext {
                        name: name.to_string(),
                        available: contexts.iter().map(|c| c.name.clone()).collect(),
                    }
                    .into()
                })
            }
        }
    }

    /// Returns a `kube::Client` for `context_name` (`None` = current
    /// context / in-cluster), building and caching it on first use.
    pub async fn client_for(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let key = context_name.map(str::to_string);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = match &self.mode {
            Mode::InCluster => {
                if context_name.is_some() {
                    return Err(ValidationError::NamedContextInCluster(context_name.unwrap().to_string()).into());
                }
                let config = kube::Config::incluster()
                    .map_err(|e| ValidationError::Other(format!("failed to load in-cluster config: {e}")))?;
                kube::Client::try_from(config)?
            }
            Mode::Kubeconfig { contexts, current } => {
                self.resolve_context(contexts, current.as_deref(), context_name)?;
                let kubeconfig = Kubeconfig::read().map_err(|e| ValidationError::Other(format!("could not read kubeconfig: {e}")))?;
                let options = KubeConfigOptions {
                    context: context_name.map(str::to_string).or_else(|| current.clone()),
                    ..Default::default()
                };
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ValidationError::Other(format!("failed to build kube config: {e}")))?;
                kube::Client::try_from(config)?
            }
        };
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_named_context() {
        let contexts = vec![
            KubeContext { name: "a".into(), namespace: Some("ns-a".into()) },
            KubeContext { name: "b".into(), namespace: None },
        ];
        let resolver = KubeConfig { mode: Mode::InCluster, clients: Mutex::new(HashMap::new()) };
        let found = resolver.resolve_context(&contexts, Some("a"), Some("b")).unwrap();
        assert_eq!(found.name, "b");
    }

    #[test]
    fn unknown_context_lists_available() {
        let contexts = vec![KubeContext { name: "a".into(), namespace: None }];
        let resolver = KubeConfig { mode: Mode::InCluster, clients: Mutex::new(HashMap::new()) };
        let err = resolver.resolve_context(&contexts, Some("a"), Some("missing")).unwrap_err();
        match err {
            crate::errors::SandboxError::Validation(ValidationError::UnknownContext { available, .. }) => {
                assert_eq!(available, vec!["a".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn in_cluster_rejects_named_context() {
        let resolver = KubeConfig { mode: Mode::InCluster, clients: Mutex::new(HashMap::new()) };
        assert!(resolver.get_default_namespace(Some("other")).is_err());
    }

    #[test]
    fn in_cluster_falls_back_to_default_namespace_when_unreadable() {
        let resolver = KubeConfig { mode: Mode::InCluster, clients: Mutex::new(HashMap::new()) };
        assert_eq!(resolver.get_default_namespace(None).unwrap(), "default");
    }
}
