//! Per-task release registry.
//!
//! Parallel evaluations must see independent registries, which rules out a
//! process-wide singleton like [`crate::kubeconfig::KubeConfig`] or
//! [`crate::pod::executor::PodOpExecutor`]; this is instead an owned value
//! the façade constructs once per task and threads through its callbacks.
//! Cleanup snapshots the registry and clears it before gathering, rather
//! than iterating it live, so new registrations can't starve a cleanup pass.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::errors::Result;
use crate::release::Release;

/// Registry of releases installed during a single task, owned by whichever
/// scope the embedder considers "a task". Cloning is cheap and shares the
/// underlying registry, so a [`ReleaseManager`] can be handed to concurrent
/// samples within the same task without becoming a global.
#[derive(Clone, Default)]
pub struct ReleaseManager {
    releases: Arc<Mutex<Vec<Arc<Release>>>>,
}

impl ReleaseManager {
    pub fn new() -> Self {
        ReleaseManager::default()
    }

    /// Registers `release` before awaiting install, so a failed install is
    /// still tracked for cleanup.
    pub async fn install(&self, release: Arc<Release>) -> Result<()> {
        self.releases.lock().await.push(release.clone());
        release.install(None).await
    }

    /// Uninstalls `release` and removes it from the registry.
    pub async fn uninstall(&self, release: &Release, quiet: bool) -> Result<()> {
        release.uninstall(quiet).await?;
        let mut releases = self.releases.lock().await;
        releases.retain(|r| r.release_name != release.release_name);
        Ok(())
    }

    /// Tears down every release ever registered with this manager.
    ///
    /// When `print_only` is set, prints cleanup instructions and returns
    /// without touching the cluster. Otherwise atomically snapshots and
    /// clears the registry, then runs all uninstalls in parallel, swallowing
    /// per-release failures so one straggler can't strand the rest.
    pub async fn uninstall_all(&self, print_only: bool) {
        if print_only {
            let releases = self.releases.lock().await;
            if releases.is_empty() {
                return;
            }
            println!("The following Helm releases were left installed; clean them up with:");
            for release in releases.iter() {
                println!("  helm uninstall {} --namespace {}", release.release_name, release.namespace());
            }
            return;
        }

        let snapshot = {
            let mut releases = self.releases.lock().await;
            std::mem::take(&mut *releases)
        };

        let futures = snapshot.into_iter().map(|release| async move {
            if let Err(error) = release.uninstall(true).await {
                warn!(release = release.release_name.as_str(), error = %error, "failed to uninstall release during cleanup");
            }
        });
        futures::future::join_all(futures).await;
    }

    /// Uninstalls a release by name directly, bypassing the registry.
    pub async fn uninstall_unmanaged_by_name(release: &Release) -> Result<()> {
        release.uninstall(false).await
    }

    pub async fn installed_count(&self) -> usize {
        self.releases.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ValuesSource;

    fn dummy_release() -> Arc<Release> {
        Arc::new(Release::new("test-task", None, ValuesSource::None, None, vec![], "default".to_string()))
    }

    #[tokio::test]
    async fn install_registers_before_install_completes() {
        let manager = ReleaseManager::new();
        let release = dummy_release();
        // install() will fail (no real cluster) but the release must still
        // be registered for cleanup.
        let _ = manager.install(release.clone()).await;
        assert_eq!(manager.installed_count().await, 1);
    }

    #[tokio::test]
    async fn print_only_cleanup_does_not_clear_registry() {
        let manager = ReleaseManager::new();
        let release = dummy_release();
        manager.releases.lock().await.push(release);
        manager.uninstall_all(true).await;
        assert_eq!(manager.installed_count().await, 1);
    }

    #[tokio::test]
    async fn uninstall_all_clears_the_registry_even_when_uninstall_fails() {
        let manager = ReleaseManager::new();
        let release = dummy_release();
        manager.releases.lock().await.push(release);
        manager.uninstall_all(false).await;
        assert_eq!(manager.installed_count().await, 0);
    }
}
