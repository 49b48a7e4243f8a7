//! Helm release lifecycle.
//!
//! Install and uninstall each have their own concurrency semaphore, so a
//! burst of uninstalls can't starve installs (or vice versa). Quota-modified
//! conflicts retry on a fixed short delay (the object just needs to settle);
//! quota-exceeded retries back off exponentially, since the quota itself
//! isn't going to free up any faster by hammering it. Extra values are
//! injected via repeated `--set-string` flags.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cmd::subprocess::{self, SubprocessOutput};
use crate::config;
use crate::errors::{InstallTimeoutError, PodError, Result, SandboxError, TransientInstallError};
use crate::pod::executor::PodOpExecutor;
use crate::pod::PodInfo;
use crate::values::ValuesSource;

/// The chart bundled with the embedding framework, used when the caller
/// doesn't supply their own. Rendering its templates is out of this crate's
/// scope; only the path is this core's concern.
pub const DEFAULT_CHART: &str = "resources/helm/agent-env";

pub const MAX_INSTALL_ATTEMPTS: u32 = 5;
const INSTALL_RETRY_DELAY: Duration = Duration::from_secs(5);
const QUOTA_EXCEEDED_BASE_DELAY: Duration = Duration::from_secs(5);

static QUOTA_MODIFIED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)Operation cannot be fulfilled on resourcequotas ".*": the object has been modified; please apply your changes to the latest version and try again"#,
    )
    .expect("valid regex")
});
static QUOTA_EXCEEDED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)forbidden: exceeded quota: .*requested:.*used:.*limited:.*").expect("valid regex"));
static CONTEXT_DEADLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"INSTALLATION FAILED: context deadline exceeded").expect("valid regex"));
static RELEASE_NOT_FOUND_RE_TEMPLATE: &str = r"^Error: uninstall: Release not loaded: {name}: release: not found$";

static INSTALL_SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(config::max_helm_install().unwrap_or(8)));
static UNINSTALL_SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(config::max_helm_uninstall().unwrap_or(8)));

/// Process-wide counter of quota-exceeded occurrences, surfaced to the
/// embedder.
static RESOURCE_QUOTA_EXCEEDED_COUNTER: AtomicU32 = AtomicU32::new(0);
static QUOTA_EXCEEDED_WARNING_LOGGED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

pub fn resource_quota_exceeded_count() -> u32 {
    RESOURCE_QUOTA_EXCEEDED_COUNTER.load(Ordering::SeqCst)
}

/// A Helm release of one or more pods for a single evaluation sample.
pub struct Release {
    pub task_name: String,
    pub release_name: String,
    pub chart_path: Option<PathBuf>,
    pub values_source: ValuesSource,
    pub context_name: Option<String>,
    pub extra_values: Vec<(String, String)>,
    namespace: String,
}

impl Release {
    pub fn new(
        task_name: impl Into<String>,
        chart_path: Option<PathBuf>,
        values_source: ValuesSource,
        context_name: Option<String>,
        extra_values: Vec<(String, String)>,
        namespace: String,
    ) -> Self {
        Release {
            task_name: task_name.into(),
            release_name: generate_release_name(),
            chart_path,
            values_source,
            context_name,
            extra_values,
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wraps an already-installed release by name, for CLI cleanup of
    /// unmanaged releases where no `Release` was ever constructed by this
    /// process.
    pub fn existing(release_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Release {
            task_name: String::new(),
            release_name: release_name.into(),
            chart_path: None,
            values_source: ValuesSource::None,
            context_name: None,
            extra_values: Vec::new(),
            namespace: namespace.into(),
        }
    }

    /// Installs the release, retrying transient quota failures. If the
    /// install task is cancelled, runs `uninstall` before propagating.
    pub async fn install(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let _permit = INSTALL_SEMAPHORE.acquire().await.expect("install semaphore is never closed");
        trace!(
            release = self.release_name.as_str(),
            chart = ?self.chart_path,
            namespace = self.namespace.as_str(),
            task = self.task_name.as_str(),
            "installing Helm chart"
        );

        let install_fut = self.install_with_retries();
        match cancel {
            None => install_fut.await,
            Some(token) => {
                tokio::select! {
                    result = install_fut => result,
                    _ = token.cancelled() => {
                        warn!(release = self.release_name.as_str(), "install cancelled, uninstalling before propagating");
                        let _ = self.uninstall(true).await;
                        Err(SandboxError::Validation(crate::errors::ValidationError::Other(
                            "install cancelled".to_string(),
                        )))
                    }
                }
            }
        }
    }

    async fn install_with_retries(&self) -> Result<()> {
        let mut attempt = 1u32;
        let mut quota_modified_delay = INSTALL_RETRY_DELAY;
        let mut quota_exceeded_delay = QUOTA_EXCEEDED_BASE_DELAY;
        loop {
            match self
                .values_source
                .with_values_file(|values_path| self.run_install(attempt > 1, values_path))
                .await
            {
                Ok(()) => return Ok(()),
                Err(SandboxError::TransientInstall(TransientInstallError::QuotaModified(_))) if attempt < MAX_INSTALL_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(quota_modified_delay).await;
                }
                Err(SandboxError::TransientInstall(TransientInstallError::QuotaExceeded(_))) if attempt < MAX_INSTALL_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(quota_exceeded_delay).await;
                    quota_exceeded_delay *= 2;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn run_install(&self, upgrade: bool, values_path: Option<&Path>) -> Result<()> {
        let timeout_secs = config::helm_timeout_secs()?;
        let mut args: Vec<String> = if upgrade { vec!["upgrade".into(), "--install".into()] } else { vec!["install".into()] };
        args.push(self.release_name.clone());
        args.push(
            self.chart_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| DEFAULT_CHART.to_string()),
        );
        args.push("--namespace".into());
        args.push(self.namespace.clone());
        args.push("--wait".into());
        args.push("--timeout".into());
        args.push(format!("{timeout_secs}s"));
        args.push("--labels".into());
        args.push("inspectSandbox=true".into());
        args.push("--set".into());
        args.push(format!("annotations.inspectTaskName={}", self.task_name));
        if let Some(values_path) = values_path {
            args.push("--values".into());
            args.push(values_path.display().to_string());
        }
        for (key, value) in &self.extra_values {
            args.push(format!("--set-string={key}={}", escape_helm_value(value)));
        }
        if config::create_namespace_enabled() {
            args.push("--create-namespace".into());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = subprocess::run("helm", &arg_refs, &[], None, None).await?;
        if result.success {
            return Ok(());
        }
        Err(self.classify_install_failure(&result, timeout_secs))
    }

    fn classify_install_failure(&self, result: &SubprocessOutput, timeout_secs: u32) -> SandboxError {
        if QUOTA_MODIFIED_RE.is_match(&result.stderr) {
            trace!(release = self.release_name.as_str(), error = result.stderr.as_str(), "resourcequota modified");
            return TransientInstallError::QuotaModified(result.stderr.clone()).into();
        }
        if let Some(m) = QUOTA_EXCEEDED_RE.find(&result.stderr) {
            trace!(release = self.release_name.as_str(), error = result.stderr.as_str(), "resourcequota exceeded");
            if !QUOTA_EXCEEDED_WARNING_LOGGED.swap(true, Ordering::SeqCst) {
                warn!(
                    "K8s resource quota exceeded. Please uninstall any unused Helm releases or reduce the \
                     level of concurrency in your eval. {}",
                    m.as_str()
                );
            }
            RESOURCE_QUOTA_EXCEEDED_COUNTER.fetch_add(1, Ordering::SeqCst);
            return TransientInstallError::QuotaExceeded(result.stderr.clone()).into();
        }
        if CONTEXT_DEADLINE_RE.is_match(&result.stderr) {
            return InstallTimeoutError { timeout_secs }.into();
        }
        PodError::new(format!(
            "Helm install failed for release '{}': {}",
            self.release_name, result.stderr
        ))
        .into()
    }

    /// Uninstalls the release. `Release not found` errors are treated as
    /// success, so uninstall is idempotent.
    pub async fn uninstall(&self, quiet: bool) -> Result<()> {
        let _permit = UNINSTALL_SEMAPHORE.acquire().await.expect("uninstall semaphore is never closed");
        let timeout_secs = config::helm_timeout_secs()?;
        let args = [
            "uninstall",
            self.release_name.as_str(),
            "--namespace",
            self.namespace.as_str(),
            "--wait",
            "--timeout",
            &format!("{timeout_secs}s"),
        ];
        let result = subprocess::run("helm", &args, &[], None, None).await?;
        let not_found = is_release_not_found(&result.stderr, &self.release_name);
        if !quiet && !not_found {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
        }
        if !result.success && !not_found {
            return Err(PodError::new(format!(
                "Helm uninstall failed for release '{}': {}",
                self.release_name, result.stderr
            ))
            .into());
        }
        Ok(())
    }

    /// Enumerates the release's sandbox pods, keyed by `inspect/service`
    /// label. Errors if the release has no pods carrying that label, since
    /// that means the chart's pod template or label wiring is broken.
    pub async fn get_sandbox_pods(&self, client: kube::Client) -> Result<std::collections::HashMap<String, PodInfo>> {
        use k8s_openapi::api::core::v1::Pod;
        use kube::api::{Api, ListParams};

        let namespace = self.namespace.clone();
        let release_name = self.release_name.clone();
        let context_name = self.context_name.clone();
        let executor = PodOpExecutor::global(None).await?;
        let pods = executor
            .run_async(move || async move {
                let api: Api<Pod> = Api::namespaced(client, &namespace);
                let selector = format!("app.kubernetes.io/instance={release_name}");
                let params = ListParams::default().labels(&selector);
                api.list(&params)
                    .await
                    .map_err(|e| PodError::new(format!("failed to list pods for release '{release_name}': {e}")).into())
            })
            .await?;

        let mut sandboxes = std::collections::HashMap::new();
        for pod in pods {
            let Some(labels) = pod.metadata.labels.as_ref() else { continue };
            let Some(service_key) = labels.get("inspect/service") else { continue };
            let name = pod.metadata.name.clone().unwrap_or_default();
            let default_container_name = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .map(|c| c.name.clone())
                .unwrap_or_default();
            let mut restart_counts = std::collections::HashMap::new();
            if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
                for status in statuses {
                    restart_counts.insert(status.name.clone(), status.restart_count);
                }
            }
            sandboxes.insert(
                service_key.clone(),
                PodInfo {
                    name,
                    namespace: self.namespace.clone(),
                    default_container_name,
                    context_name: context_name.clone(),
                    restart_counts,
                },
            );
        }
        if sandboxes.is_empty() {
            return Err(PodError::new(format!("no pods found for release '{}'", self.release_name)).into());
        }
        Ok(sandboxes)
    }
}

fn is_release_not_found(stderr: &str, release_name: &str) -> bool {
    let pattern = RELEASE_NOT_FOUND_RE_TEMPLATE.replace("{name}", &regex::escape(release_name));
    Regex::new(&format!("(?i){pattern}")).map(|re| re.is_match(stderr.trim())).unwrap_or(false)
}

/// Backslash-escapes `, . = \` in a `--set-string` value.
pub fn escape_helm_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '.' | '=' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

const RELEASE_NAME_LEN: usize = 8;
const RELEASE_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Mints an 8-char lowercase-alphanumeric release name, a valid DNS-1123
/// label prefix. Derived from UUIDv4 bytes mapped into `[a-z0-9]`.
pub fn generate_release_name() -> String {
    let bytes = uuid::Uuid::new_v4();
    bytes.as_bytes()[..RELEASE_NAME_LEN]
        .iter()
        .map(|b| RELEASE_NAME_ALPHABET[*b as usize % RELEASE_NAME_ALPHABET.len()] as char)
        .collect()
}

/// Discovers all releases carrying `inspectSandbox=true` in `namespace`.
pub async fn list_managed_release_names(namespace: &str) -> Result<Vec<String>> {
    let args = [
        "list",
        "--namespace",
        namespace,
        "-q",
        "--selector",
        "inspectSandbox=true",
        "--max",
        "0",
    ];
    let result = subprocess::run("helm", &args, &[], None, None).await?;
    if !result.success {
        return Err(PodError::new(format!("failed to list Helm releases: {}", result.stderr)).into());
    }
    Ok(result.stdout.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_names_are_eight_lowercase_alphanumeric_chars() {
        for _ in 0..100 {
            let name = generate_release_name();
            assert_eq!(name.len(), RELEASE_NAME_LEN);
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn escapes_comma_dot_equals_backslash() {
        assert_eq!(escape_helm_value("a,b.c=d\\e"), r"a\,b\.c\=d\\e");
        assert_eq!(escape_helm_value("plain"), "plain");
    }

    #[test]
    fn release_not_found_is_idempotent_success() {
        let stderr = "Error: uninstall: Release not loaded: abcd1234: release: not found";
        assert!(is_release_not_found(stderr, "abcd1234"));
        assert!(!is_release_not_found("Error: some other failure", "abcd1234"));
    }

    #[test]
    fn quota_modified_message_is_classified_transient() {
        let stderr = "Error: UPGRADE FAILED: Operation cannot be fulfilled on resourcequotas \"compute-quota\": \
            the object has been modified; please apply your changes to the latest version and try again";
        assert!(QUOTA_MODIFIED_RE.is_match(stderr));
    }

    #[test]
    fn quota_exceeded_message_is_classified_transient() {
        let stderr = "Error: forbidden: exceeded quota: compute-quota, requested: pods=1, used: pods=10, limited: pods=10";
        assert!(QUOTA_EXCEEDED_RE.is_match(stderr));
    }

    #[test]
    fn context_deadline_message_is_classified_fatal() {
        let stderr = "Error: INSTALLATION FAILED: context deadline exceeded";
        assert!(CONTEXT_DEADLINE_RE.is_match(stderr));
    }
}
