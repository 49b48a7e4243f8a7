//! Error taxonomy for the sandbox engine.
//!
//! Small `thiserror` leaf enums per component, composed into a single
//! top-level type at the façade.

use crate::cmd::subprocess::SubprocessError;

/// Errors raised while resolving or using kubeconfig / in-cluster credentials.
#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("named contexts are not available when running in-cluster; requested context '{0}'")]
    NamedContextInCluster(String),

    #[error("could not get the current context because no current context is set in the kubeconfig file")]
    NoCurrentContext,

    #[error("could not find a context named '{name}' in the kubeconfig file; available contexts: {available:?}")]
    UnknownContext { name: String, available: Vec<String> },

    #[error("no contexts were present in the kubeconfig file")]
    NoContexts,

    #[error("values document contains a null value at '{path}' (source: {source})")]
    NullValue { path: String, source: String },

    #[error("invalid service name '{name}': {reason}")]
    InvalidServiceName { name: String, reason: String },

    #[error("unsupported key(s) {keys:?} in {context}")]
    UnsupportedKeys { context: String, keys: Vec<String> },

    #[error("{0}")]
    Other(String),
}

/// Transient install failures that the release install loop retries.
#[derive(thiserror::Error, Debug)]
pub enum TransientInstallError {
    #[error("resourcequota modified whilst installing helm chart: {0}")]
    QuotaModified(String),

    #[error("exceeded resource quota whilst installing helm chart: {0}")]
    QuotaExceeded(String),
}

#[derive(thiserror::Error, Debug)]
#[error(
    "helm install timed out (context deadline exceeded); the configured timeout value was {timeout_secs}s. \
     See https://k8s-sandbox.ai-safety-institute.org.uk/tips/troubleshooting/#helm-context-deadline-exceeded. \
     Consider increasing INSPECT_HELM_TIMEOUT."
)]
pub struct InstallTimeoutError {
    pub timeout_secs: u32,
}

/// Errors surfaced by pod interaction (exec, file transfer) that are
/// unexpected and should be enriched with context at the façade.
#[derive(thiserror::Error, Debug)]
#[error("pod error: {message}")]
pub struct PodError {
    pub message: String,
}

impl PodError {
    pub fn new(message: impl Into<String>) -> Self {
        PodError { message: message.into() }
    }
}

/// The exec engine could not recover a return code for a completed command.
#[derive(thiserror::Error, Debug)]
#[error("could not determine the return code of the executed command")]
pub struct GetReturncodeError;

/// Errors "expected" at the façade: passed through without enrichment,
/// logged only at trace level.
#[derive(thiserror::Error, Debug)]
pub enum ExpectedError {
    #[error("command timed out")]
    Timeout,

    #[error("output exceeded the configured size limit of {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("output was not valid UTF-8")]
    UnicodeDecode,

    #[error("is a directory: {0}")]
    IsADirectory(String),
}

/// Top-level error type returned by the sandbox façade.
///
/// `Expected` variants pass through unenriched; any other variant is an
/// "unexpected" fault the façade wraps with pod/release/argument context
/// before logging at error level and rethrowing.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Expected(#[from] ExpectedError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    TransientInstall(#[from] TransientInstallError),

    #[error(transparent)]
    InstallTimeout(#[from] InstallTimeoutError),

    #[error(transparent)]
    Pod(#[from] PodError),

    #[error(transparent)]
    GetReturncode(#[from] GetReturncodeError),

    #[error(transparent)]
    Subprocess(#[from] SubprocessError),

    #[error("{message} (release={release:?}, pod={pod:?}, task={task:?})")]
    K8s {
        message: String,
        release: Option<String>,
        pod: Option<String>,
        task: Option<String>,
        #[source]
        source: Box<SandboxError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl SandboxError {
    /// True when this error is "expected" and should pass through the façade
    /// unenriched.
    pub fn is_expected(&self) -> bool {
        matches!(self, SandboxError::Expected(_))
    }

    pub fn enrich(self, release: Option<String>, pod: Option<String>, task: Option<String>) -> SandboxError {
        if self.is_expected() {
            return self;
        }
        SandboxError::K8s {
            message: self.to_string(),
            release,
            pod,
            task,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
