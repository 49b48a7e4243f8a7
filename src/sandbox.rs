//! Sandbox façade.
//!
//! Exposes four framework callbacks (`task_init`/`sample_init`/
//! `sample_cleanup`/`task_cleanup`) and traces every pod operation through
//! `log_op`: pass "expected" errors through unenriched, log and re-wrap
//! anything else as `SandboxError::K8s` (built by
//! [`crate::errors::SandboxError::enrich`]).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{self, ResolvedConfig, SandboxConfig, SandboxConfigInput};
use crate::errors::{Result, ValidationError};
use crate::kubeconfig::KubeConfig;
use crate::manager::ReleaseManager;
use crate::pod::exec::{self, ExecOutcome, ExecRequest};
use crate::pod::executor::PodOpExecutor;
use crate::pod::transfer::{self, FileBytes, FileContent, ReadMode};
use crate::pod::PodInfo;
use crate::release::Release;
use crate::values::compose::is_docker_compose_file;
use crate::values::ValuesSource;

static METADATA_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9 ]+$").expect("valid regex"));

/// One sample's binding of a `Release` + pod + resolved config.
pub struct Sandbox {
    pub release: Arc<Release>,
    pub pod: PodInfo,
    pub config: Arc<ResolvedConfig>,
}

impl Sandbox {
    /// Runs `request` in this sandbox's pod, filling in the resolved
    /// `default_user` when the caller didn't specify one.
    pub async fn exec(&self, mut request: ExecRequest) -> Result<ExecOutcome> {
        if request.user.is_none() {
            request.user = self.config.default_user.clone();
        }
        let client = self.client().await?;
        self.log_op("K8s execute command in Pod", || {
            exec::exec(
                client,
                &self.pod,
                request,
                self.config.restarted_container_behavior,
                config::pod_restart_check_enabled(),
            )
        })
        .await
    }

    pub async fn read_file(&self, path: &str, text: bool) -> Result<FileBytes> {
        let client = self.client().await?;
        let mode = if text { ReadMode::Text } else { ReadMode::Bytes };
        self.log_op("K8s read file from Pod", || transfer::read_file(client, &self.pod, path, mode)).await
    }

    pub async fn write_file(&self, path: &str, content: FileContent) -> Result<()> {
        let client = self.client().await?;
        self.log_op("K8s write file to Pod", || transfer::write_file(client, &self.pod, path, content)).await
    }

    /// Builds the connection command a user would run to attach an
    /// interactive shell to this sandbox.
    pub fn connection(&self, user: Option<&str>) -> Connection {
        let user = user.or(self.config.default_user.as_deref());
        build_connection(&self.pod, user)
    }

    async fn client(&self) -> Result<kube::Client> {
        KubeConfig::instance().await?.client_for(self.pod.context_name.as_deref()).await
    }

    /// Traces `op`, passing "expected" errors through unenriched and
    /// re-wrapping anything else with pod/release/task context.
    async fn log_op<F, Fut, T>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        trace!(op, pod = self.pod.name.as_str(), task = self.release.task_name.as_str(), "starting");
        match f().await {
            Ok(value) => {
                trace!(op, pod = self.pod.name.as_str(), "completed");
                Ok(value)
            }
            Err(error) if error.is_expected() => Err(error),
            Err(error) => {
                error!(op, pod = self.pod.name.as_str(), task = self.release.task_name.as_str(), error = %error, "unexpected error during pod operation");
                Err(error.enrich(
                    Some(self.release.release_name.clone()),
                    Some(self.pod.name.clone()),
                    Some(self.release.task_name.clone()),
                ))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub command: Vec<String>,
    pub vscode_command: Option<String>,
}

/// Builds `kubectl exec -it <pod> -n <ns> -c <container> [--context <ctx>]
/// -- (su -s /bin/bash -l <user>|bash -l)`. A VSCode-attach command is
/// included only when neither a named context nor a user override is in
/// play.
fn build_connection(pod: &PodInfo, user: Option<&str>) -> Connection {
    let mut command = vec![
        "kubectl".to_string(),
        "exec".to_string(),
        "-it".to_string(),
        pod.name.clone(),
        "-n".to_string(),
        pod.namespace.clone(),
        "-c".to_string(),
        pod.default_container_name.clone(),
    ];
    if let Some(context) = &pod.context_name {
        command.push("--context".to_string());
        command.push(context.clone());
    }
    command.push("--".to_string());
    match user {
        Some(user) => {
            command.extend(["su".to_string(), "-s".to_string(), "/bin/bash".to_string(), "-l".to_string(), user.to_string()]);
        }
        None => command.extend(["bash".to_string(), "-l".to_string()]),
    }

    let vscode_command = (pod.context_name.is_none() && user.is_none())
        .then(|| format!("code --remote attached-container+{}+{} /root", pod.namespace, pod.name));

    Connection { command, vscode_command }
}

/// Validates that `helm` and `kubectl` are reachable on `PATH` and
/// initializes the process-wide singletons.
pub async fn task_init() -> Result<()> {
    check_binary_on_path("helm", &["version"]).await?;
    check_binary_on_path("kubectl", &["version", "--client"]).await?;
    KubeConfig::instance().await?;
    PodOpExecutor::global(None).await?;
    Ok(())
}

async fn check_binary_on_path(binary: &str, args: &[&str]) -> Result<()> {
    crate::cmd::subprocess::run(binary, args, &[], None, None)
        .await
        .map(|_| ())
        .map_err(|e| ValidationError::Other(format!("required binary '{binary}' is not available on PATH: {e}")).into())
}

/// Resolves config, installs a fresh release and returns its sandboxes,
/// keyed by service name with `"default"` placed first.
pub async fn sample_init(
    task_name: &str,
    config_input: SandboxConfigInput,
    metadata: &HashMap<String, String>,
    manager: &ReleaseManager,
) -> Result<Vec<(String, Sandbox)>> {
    let resolved = resolve_config(config_input)?;
    let namespace = KubeConfig::instance().await?.get_default_namespace(resolved.context.as_deref())?;
    let values_source = build_values_source(&resolved)?;
    let extra_values = build_extra_values(&resolved, metadata);

    let release = Arc::new(Release::new(
        task_name.to_string(),
        resolved.chart.clone(),
        values_source,
        resolved.context.clone(),
        extra_values,
        namespace,
    ));
    manager.install(release.clone()).await?;

    let client = KubeConfig::instance().await?.client_for(resolved.context.as_deref()).await?;
    let pods = release.get_sandbox_pods(client).await?;
    let resolved = Arc::new(resolved);

    let mut sandboxes: Vec<(String, Sandbox)> = pods
        .into_iter()
        .map(|(key, pod)| (key, Sandbox { release: release.clone(), pod, config: resolved.clone() }))
        .collect();
    trace!(sandboxes = ?sandboxes.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), "available sandboxes");
    reorder_default_first(&mut sandboxes);
    Ok(sandboxes)
}

/// Moves the `"default"` sandbox, if present, to the front and sorts the
/// rest by key so iteration order is deterministic.
fn reorder_default_first(sandboxes: &mut Vec<(String, Sandbox)>) {
    sandboxes.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(pos) = sandboxes.iter().position(|(key, _)| key == "default") {
        let default = sandboxes.remove(pos);
        sandboxes.insert(0, default);
    }
}

/// Uninstalls `sandbox`'s release unless the sample was interrupted, in
/// which case cleanup is deferred to `task_cleanup`.
pub async fn sample_cleanup(sandbox: &Sandbox, manager: &ReleaseManager, interrupted: bool) -> Result<()> {
    if interrupted {
        return Ok(());
    }
    manager.uninstall(&sandbox.release, true).await
}

/// Uninstalls every release the manager is still tracking, or prints
/// cleanup instructions when `cleanup` is false.
pub async fn task_cleanup(manager: &ReleaseManager, cleanup: bool) {
    manager.uninstall_all(!cleanup).await
}

/// CLI entry point for cleaning up unmanaged releases: by name when `id` is
/// given, otherwise discover-then-confirm.
pub async fn cli_cleanup(id: Option<String>, namespace: &str) -> Result<()> {
    match id {
        Some(id) => Release::existing(id, namespace.to_string()).uninstall(false).await,
        None => cli_cleanup_all(namespace).await,
    }
}

async fn cli_cleanup_all(namespace: &str) -> Result<()> {
    let names = crate::release::list_managed_release_names(namespace).await?;
    if names.is_empty() {
        println!("No unmanaged Helm releases found.");
        return Ok(());
    }
    println!("The following Helm releases will be uninstalled:");
    for name in &names {
        println!("  {name}");
    }
    if !confirm("Proceed?").await {
        println!("Aborted.");
        return Ok(());
    }

    let namespace = namespace.to_string();
    let futures = names.into_iter().map(|name| {
        let namespace = namespace.clone();
        async move {
            if let Err(error) = Release::existing(name.clone(), namespace).uninstall(false).await {
                warn!(release = name.as_str(), error = %error, "failed to uninstall unmanaged release");
            }
        }
    });
    futures::future::join_all(futures).await;
    Ok(())
}

async fn confirm(prompt: &str) -> bool {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        print!("{prompt} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
    })
    .await
    .unwrap_or(false)
}

fn resolve_config(input: SandboxConfigInput) -> Result<ResolvedConfig> {
    match input {
        SandboxConfigInput::Compose(doc) => Ok(ResolvedConfig::from_compose(doc)),
        SandboxConfigInput::Sandbox(config) => resolve_sandbox_config(config),
    }
}

fn resolve_sandbox_config(config: SandboxConfig) -> Result<ResolvedConfig> {
    if let Some(chart) = &config.chart {
        if !chart.is_dir() {
            return Err(ValidationError::Other(format!(
                "Helm chart directory not found: '{}'. At present, only charts from local directories are supported.",
                chart.display()
            ))
            .into());
        }
    }
    Ok(ResolvedConfig::from_config(config))
}

fn build_values_source(resolved: &ResolvedConfig) -> Result<ValuesSource> {
    if let Some(compose) = &resolved.compose_config {
        return Ok(ValuesSource::ComposeDoc(compose.clone()));
    }
    let Some(values) = &resolved.values else {
        return Ok(ValuesSource::None);
    };
    if !values.is_file() {
        return Err(ValidationError::Other(format!("Helm values file not found: '{}'.", values.display())).into());
    }
    if is_docker_compose_file(values) {
        if resolved.chart.is_some() {
            return Err(ValidationError::Other(
                "Automatic conversion from compose.yaml to helm-values.yaml is only supported when using the \
                 built-in Helm chart."
                    .to_string(),
            )
            .into());
        }
        return Ok(ValuesSource::ComposeFile(values.clone()));
    }
    Ok(ValuesSource::Static(values.clone()))
}

/// Maps sample metadata keys into Helm `--set-string` extra values: a key
/// matching `^[a-zA-Z0-9 ]+$` is PascalCased and prefixed with
/// `sampleMetadata`, included only if that literal name appears somewhere in
/// the chart's files or the effective values file; anything else is skipped
/// with a warning.
fn build_extra_values(resolved: &ResolvedConfig, metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    if metadata.is_empty() {
        return Vec::new();
    }
    let haystack = chart_and_values_haystack(resolved.chart.as_deref(), resolved.values.as_deref());
    let mut extra_values = Vec::new();
    for (key, value) in metadata {
        if !METADATA_KEY_RE.is_match(key) {
            warn!(key = key.as_str(), "skipping sample metadata key with unsupported characters");
            continue;
        }
        let name = format!("sampleMetadata{}", pascal_case(key));
        if haystack.contains(&name) {
            extra_values.push((name, value.clone()));
        } else {
            warn!(key = key.as_str(), name = name.as_str(), "sample metadata key not referenced by chart; skipping");
        }
    }
    extra_values
}

/// PascalCases `input`, splitting on spaces and on lower→upper camelCase
/// boundaries.
fn pascal_case(input: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    for space_word in input.split(' ') {
        if space_word.is_empty() {
            continue;
        }
        let mut current = String::new();
        for c in space_word.chars() {
            if c.is_uppercase() && current.chars().last().is_some_and(|last| last.is_lowercase() || last.is_numeric()) {
                words.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
        .into_iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn chart_and_values_haystack(chart: Option<&Path>, values: Option<&Path>) -> String {
    let mut haystack = String::new();
    if let Some(values) = values {
        if let Ok(contents) = std::fs::read_to_string(values) {
            haystack.push_str(&contents);
        }
    }
    if let Some(chart) = chart {
        collect_chart_files(chart, &mut haystack);
    } else {
        // Fall back to the bundled chart directory when one is locatable
        // relative to the process; a missing bundled chart (common in unit
        // tests, where no chart is installed alongside the binary) simply
        // yields an empty contribution here.
        collect_chart_files(Path::new(crate::release::DEFAULT_CHART), &mut haystack);
    }
    haystack
}

fn collect_chart_files(dir: &Path, haystack: &mut String) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_chart_files(&path, haystack);
        } else if let Ok(contents) = std::fs::read_to_string(&path) {
            haystack.push_str(&contents);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_cases_space_separated_keys() {
        assert_eq!(pascal_case("my key"), "MyKey");
        assert_eq!(pascal_case("difficulty"), "Difficulty");
    }

    #[test]
    fn pascal_cases_camel_case_boundaries() {
        assert_eq!(pascal_case("myKey"), "MyKey");
        assert_eq!(pascal_case("sampleId2Value"), "SampleId2Value");
    }

    #[test]
    fn connection_omits_vscode_command_when_context_or_user_set() {
        let pod = PodInfo {
            name: "web-0".into(),
            namespace: "default".into(),
            default_container_name: "web".into(),
            context_name: Some("staging".into()),
            restart_counts: HashMap::new(),
        };
        let connection = build_connection(&pod, None);
        assert!(connection.vscode_command.is_none());
        assert!(connection.command.contains(&"--context".to_string()));
    }

    #[test]
    fn connection_includes_vscode_command_by_default() {
        let pod = PodInfo {
            name: "web-0".into(),
            namespace: "default".into(),
            default_container_name: "web".into(),
            context_name: None,
            restart_counts: HashMap::new(),
        };
        let connection = build_connection(&pod, None);
        assert!(connection.vscode_command.is_some());
        assert!(connection.command.ends_with(&["bash".to_string(), "-l".to_string()]));
    }

    #[test]
    fn connection_uses_su_for_named_user() {
        let pod = PodInfo {
            name: "web-0".into(),
            namespace: "default".into(),
            default_container_name: "web".into(),
            context_name: None,
            restart_counts: HashMap::new(),
        };
        let connection = build_connection(&pod, Some("agent"));
        assert!(connection.vscode_command.is_none());
        assert!(connection.command.contains(&"su".to_string()));
    }

    #[test]
    fn metadata_key_with_unsupported_characters_is_skipped() {
        let mut metadata = HashMap::new();
        metadata.insert("weird!key".to_string(), "value".to_string());
        let resolved = ResolvedConfig::from_config(SandboxConfig::default());
        assert!(build_extra_values(&resolved, &metadata).is_empty());
    }

    #[test]
    fn metadata_key_not_referenced_by_chart_is_skipped() {
        let mut metadata = HashMap::new();
        metadata.insert("difficulty".to_string(), "hard".to_string());
        let resolved = ResolvedConfig::from_config(SandboxConfig::default());
        assert!(build_extra_values(&resolved, &metadata).is_empty());
    }

    #[test]
    fn metadata_key_referenced_in_values_file_is_included() {
        let dir = tempfile::tempdir().unwrap();
        let values_path = dir.path().join("values.yaml");
        std::fs::write(&values_path, "services:\n  web:\n    annotation: '{{ .Values.sampleMetadataDifficulty }}'\n").unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("difficulty".to_string(), "hard".to_string());
        let mut resolved = ResolvedConfig::from_config(SandboxConfig::default());
        resolved.values = Some(values_path);
        let extra_values = build_extra_values(&resolved, &metadata);
        assert_eq!(extra_values, vec![("sampleMetadataDifficulty".to_string(), "hard".to_string())]);
    }

    #[test]
    fn reorder_default_first_moves_default_to_the_front() {
        let release = Arc::new(Release::new("task", None, ValuesSource::None, None, vec![], "default".to_string()));
        let config = Arc::new(ResolvedConfig::from_config(SandboxConfig::default()));
        let make = |name: &str| PodInfo {
            name: name.to_string(),
            namespace: "default".into(),
            default_container_name: "main".into(),
            context_name: None,
            restart_counts: HashMap::new(),
        };
        let mut sandboxes: Vec<(String, Sandbox)> = vec![
            ("zeta".to_string(), Sandbox { release: release.clone(), pod: make("zeta"), config: config.clone() }),
            ("default".to_string(), Sandbox { release: release.clone(), pod: make("default"), config: config.clone() }),
            ("alpha".to_string(), Sandbox { release: release.clone(), pod: make("alpha"), config: config.clone() }),
        ];
        reorder_default_first(&mut sandboxes);
        let keys: Vec<&str> = sandboxes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["default", "alpha", "zeta"]);
    }
}
