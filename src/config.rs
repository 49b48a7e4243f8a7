//! Environment-driven configuration surface and the `ResolvedConfig` value
//! produced once per sample.
//!
//! A small set of free functions rather than a config struct, since each
//! env var has its own default and validation rule.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ValidationError};

pub const INSPECT_HELM_TIMEOUT: &str = "INSPECT_HELM_TIMEOUT";
pub const INSPECT_HELM_CREATE_NAMESPACE: &str = "INSPECT_HELM_CREATE_NAMESPACE";
pub const INSPECT_MAX_HELM_INSTALL: &str = "INSPECT_MAX_HELM_INSTALL";
pub const INSPECT_MAX_HELM_UNINSTALL: &str = "INSPECT_MAX_HELM_UNINSTALL";
pub const INSPECT_MAX_POD_OPS: &str = "INSPECT_MAX_POD_OPS";
pub const INSPECT_K8S_LOG_TRUNCATION_THRESHOLD: &str = "INSPECT_K8S_LOG_TRUNCATION_THRESHOLD";
pub const INSPECT_POD_RESTART_CHECK: &str = "INSPECT_POD_RESTART_CHECK";

const DEFAULT_HELM_TIMEOUT_SECS: u32 = 600;
const DEFAULT_MAX_HELM_INSTALL: usize = 8;
const DEFAULT_MAX_HELM_UNINSTALL: usize = 8;

/// Reads a positive-int environment variable, falling back to `default` when
/// unset. A present-but-invalid value is a startup error.
pub fn env_positive_int(name: &str, default: u32) -> Result<u32> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => {
            let value: i64 = raw
                .parse()
                .map_err(|_| ValidationError::Other(format!("{name} must be an int: '{raw}'.")))?;
            if value <= 0 {
                return Err(
                    ValidationError::Other(format!("{name} must be a positive int: '{raw}'.")).into(),
                );
            }
            Ok(value as u32)
        }
    }
}

pub fn helm_timeout_secs() -> Result<u32> {
    env_positive_int(INSPECT_HELM_TIMEOUT, DEFAULT_HELM_TIMEOUT_SECS)
}

pub fn max_helm_install() -> Result<usize> {
    env_positive_int(INSPECT_MAX_HELM_INSTALL, DEFAULT_MAX_HELM_INSTALL as u32).map(|v| v as usize)
}

pub fn max_helm_uninstall() -> Result<usize> {
    env_positive_int(INSPECT_MAX_HELM_UNINSTALL, DEFAULT_MAX_HELM_UNINSTALL as u32).map(|v| v as usize)
}

/// `max_pod_ops` precedence: explicit argument > env var > `cpu_count * 4`.
pub fn max_pod_ops(explicit: Option<usize>) -> Result<usize> {
    if let Some(v) = explicit {
        return Ok(v);
    }
    match env::var(INSPECT_MAX_POD_OPS) {
        Ok(raw) => {
            let value: i64 = raw
                .parse()
                .map_err(|_| ValidationError::Other(format!("{INSPECT_MAX_POD_OPS} must be an int: '{raw}'.")))?;
            if value <= 0 {
                return Err(ValidationError::Other(format!(
                    "{INSPECT_MAX_POD_OPS} must be a positive int: '{raw}'."
                ))
                .into());
            }
            Ok(value as usize)
        }
        Err(_) => {
            let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            Ok(cpus * 4)
        }
    }
}

/// Truthy parsing for `INSPECT_HELM_CREATE_NAMESPACE` (`1|true|yes|y`, case-insensitive).
pub fn create_namespace_enabled() -> bool {
    is_truthy(env::var(INSPECT_HELM_CREATE_NAMESPACE).ok().as_deref())
}

/// `INSPECT_POD_RESTART_CHECK` disables the post-exec restart check only
/// when it is exactly `"false"` (case-insensitive); any other value,
/// including unset, leaves the check enabled.
pub fn pod_restart_check_enabled() -> bool {
    !matches!(
        env::var(INSPECT_POD_RESTART_CHECK).ok().as_deref().map(str::to_lowercase),
        Some(ref v) if v == "false"
    )
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("y")
    )
}

/// How the pod exec engine reports a container restart observed after an
/// exec that never recovered a return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartedContainerBehavior {
    Warn,
    Raise,
}

impl Default for RestartedContainerBehavior {
    fn default() -> Self {
        RestartedContainerBehavior::Warn
    }
}

/// The user-facing config surface: either a Helm-shaped config or
/// (deserialized separately, see `values::compose`) a Compose document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    pub chart: Option<PathBuf>,
    pub values: Option<PathBuf>,
    pub context: Option<String>,
    pub default_user: Option<String>,
    #[serde(default)]
    pub restarted_container_behavior: Option<RestartedContainerBehavior>,
    pub max_pod_ops: Option<usize>,
}

/// Immutable, validated configuration produced once per sample.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub chart: Option<PathBuf>,
    pub values: Option<PathBuf>,
    pub context: Option<String>,
    pub default_user: Option<String>,
    pub restarted_container_behavior: RestartedContainerBehavior,
    /// Set when the caller supplied a Compose document directly rather than
    /// a Helm-shaped config.
    pub compose_config: Option<serde_yaml::Value>,
    pub max_pod_ops: Option<usize>,
}

impl ResolvedConfig {
    pub fn from_config(config: SandboxConfig) -> Self {
        ResolvedConfig {
            chart: config.chart,
            values: config.values,
            context: config.context,
            default_user: config.default_user,
            restarted_container_behavior: config.restarted_container_behavior.unwrap_or_default(),
            compose_config: None,
            max_pod_ops: config.max_pod_ops,
        }
    }

    pub fn from_compose(doc: serde_yaml::Value) -> Self {
        ResolvedConfig {
            chart: None,
            values: None,
            context: None,
            default_user: None,
            restarted_container_behavior: RestartedContainerBehavior::default(),
            compose_config: Some(doc),
            max_pod_ops: None,
        }
    }
}

/// The raw config the embedder hands the façade: either the Helm-shaped
/// [`SandboxConfig`] or a Compose document.
#[derive(Debug, Clone)]
pub enum SandboxConfigInput {
    Sandbox(SandboxConfig),
    Compose(serde_yaml::Value),
}

/// Tries the strict [`SandboxConfig`] shape first (its `deny_unknown_fields`
/// rejects a Compose document's `services`/`volumes` keys); anything that
/// doesn't fit is treated as a Compose document.
pub fn parse_config_input(raw: serde_yaml::Value) -> SandboxConfigInput {
    match serde_yaml::from_value::<SandboxConfig>(raw.clone()) {
        Ok(config) => SandboxConfigInput::Sandbox(config),
        Err(_) => SandboxConfigInput::Compose(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that touch
    // them so they don't race `cargo test`'s default multi-threaded runner.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn default_helm_timeout_when_unset() {
        let _guard = ENV_GUARD.lock().unwrap();
        unsafe { env::remove_var(INSPECT_HELM_TIMEOUT) };
        assert_eq!(helm_timeout_secs().unwrap(), DEFAULT_HELM_TIMEOUT_SECS);
    }

    #[test]
    fn rejects_non_positive_timeout() {
        let _guard = ENV_GUARD.lock().unwrap();
        unsafe { env::set_var(INSPECT_HELM_TIMEOUT, "0") };
        assert!(helm_timeout_secs().is_err());
        unsafe { env::remove_var(INSPECT_HELM_TIMEOUT) };
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("True")));
        assert!(is_truthy(Some("YES")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(None));
    }

    #[test]
    fn pod_restart_check_disabled_only_by_false() {
        let _guard = ENV_GUARD.lock().unwrap();
        unsafe { env::set_var(INSPECT_POD_RESTART_CHECK, "FALSE") };
        assert!(!pod_restart_check_enabled());
        unsafe { env::set_var(INSPECT_POD_RESTART_CHECK, "0") };
        assert!(pod_restart_check_enabled());
        unsafe { env::remove_var(INSPECT_POD_RESTART_CHECK) };
        assert!(pod_restart_check_enabled());
    }

    #[test]
    fn parses_sandbox_shaped_config() {
        let raw: serde_yaml::Value = serde_yaml::from_str("chart: /tmp/chart\ncontext: staging\n").unwrap();
        match parse_config_input(raw) {
            SandboxConfigInput::Sandbox(config) => assert_eq!(config.context.as_deref(), Some("staging")),
            SandboxConfigInput::Compose(_) => panic!("expected Sandbox variant"),
        }
    }

    #[test]
    fn falls_back_to_compose_for_unknown_shape() {
        let raw: serde_yaml::Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n").unwrap();
        match parse_config_input(raw) {
            SandboxConfigInput::Compose(doc) => assert!(doc.get("services").is_some()),
            SandboxConfigInput::Sandbox(_) => panic!("expected Compose variant"),
        }
    }
}
