//! Streaming pod exec engine.
//!
//! A `sh -c` trampoline carries a marker file, the user's command, and a
//! sentinel-framed exit code, so a dropped connection can be told apart from
//! a command that never started (see [`crate::pod::retry`] for the retry
//! classification). Submits the trampoline via `kube::api::Api::exec` with
//! `AttachParams::default().stdin(true).stdout(true).stderr(true).tty(false)`,
//! talking to the cluster only through the `kube` crate.

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod as K8sPod;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::RestartedContainerBehavior;
use crate::errors::{ExpectedError, GetReturncodeError, PodError, Result, SandboxError};
use crate::pod::retry::{self, ExecTransportError, ExecutionState, RetryContext};
use crate::pod::PodInfo;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Default byte limit for stdout/stderr. Unlike the logging truncation
/// threshold, this has no configuring env var; it's a fixed constant
/// matching the embedding framework's own default output cap.
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10 * 1024 * 1024;

static SENTINEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<completed-sentinel-value-(\d+)>").expect("valid regex"));

/// What the caller wants written to the command's stdin.
#[derive(Debug, Clone)]
pub enum ExecStdin {
    Text(String),
    Bytes(Vec<u8>),
}

impl ExecStdin {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            ExecStdin::Text(s) => s.into_bytes(),
            ExecStdin::Bytes(b) => b,
        }
    }
}

/// Inputs to a single exec call.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: Option<ExecStdin>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
}

/// Result of a completed exec call; non-zero exit codes are not errors.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `request.command` in `pod`, retrying idempotently on transport
/// faults.
pub async fn exec(
    client: kube::Client,
    pod: &PodInfo,
    request: ExecRequest,
    restart_behavior: RestartedContainerBehavior,
    restart_check_enabled: bool,
) -> Result<ExecOutcome> {
    let execution_id = retry::generate_execution_id();
    let (marker_path, status_path) = retry::marker_paths(&execution_id);
    let mut retry_ctx = RetryContext::default();
    let started_at = std::time::Instant::now();

    loop {
        let script = build_trampoline(
            &request.command,
            &execution_id,
            request.cwd.as_deref(),
            &request.env,
            request.user.as_deref(),
        );
        match run_attempt(client.clone(), pod, &script, request.stdin.clone(), request.timeout).await {
            Ok(AttemptOutcome::Completed { stdout, stderr, returncode }) => {
                cleanup_marker_files(client.clone(), pod, &marker_path, &status_path).await;
                return Ok(ExecOutcome { returncode, stdout, stderr });
            }
            Ok(AttemptOutcome::NoSentinel { .. }) => {
                if restart_check_enabled {
                    check_pod_restart(client.clone(), pod, restart_behavior, started_at.elapsed()).await?;
                }
                return Err(GetReturncodeError.into());
            }
            Err(AttemptError::Timeout) => return Err(ExpectedError::Timeout.into()),
            Err(AttemptError::OutputLimitExceeded { limit }) => {
                return Err(ExpectedError::OutputLimitExceeded { limit }.into());
            }
            Err(AttemptError::Transport(fault)) => {
                if !retry::is_retryable_error(Some(&fault)) || !retry_ctx.should_retry() {
                    return Err(PodError::new(format!("pod exec transport failure: {fault:?}")).into());
                }
                let state = probe_marker_state(client.clone(), pod, &marker_path, &status_path)
                    .await
                    .unwrap_or(ExecutionState::NotStarted);
                if state != ExecutionState::NotStarted {
                    return Err(PodError::new(format!(
                        "pod exec failed after the command may already have started (state: {state:?}); not retrying"
                    ))
                    .into());
                }
                retry_ctx.increment();
                tokio::time::sleep(retry_ctx.delay()).await;
            }
        }
    }
}

enum AttemptOutcome {
    Completed { stdout: String, stderr: String, returncode: i32 },
    NoSentinel { stdout: String, stderr: String },
}

enum AttemptError {
    Timeout,
    OutputLimitExceeded { limit: usize },
    Transport(ExecTransportError),
}

async fn run_attempt(
    client: kube::Client,
    pod: &PodInfo,
    script: &str,
    stdin: Option<ExecStdin>,
    timeout: Option<Duration>,
) -> std::result::Result<AttemptOutcome, AttemptError> {
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::{Api, AttachParams};

    let api: Api<Pod> = Api::namespaced(client, &pod.namespace);
    let params = AttachParams::default()
        .stdin(true)
        .stdout(true)
        .stderr(true)
        .tty(false)
        .container(pod.default_container_name.clone());

    let attach = api
        .exec(&pod.name, vec!["sh", "-c", script], &params)
        .await
        .map_err(|e| AttemptError::Transport(classify_kube_error(&e)))?;

    run_attached(attach, stdin, timeout).await
}

async fn run_attached(
    mut attach: kube::api::AttachedProcess,
    stdin: Option<ExecStdin>,
    timeout: Option<Duration>,
) -> std::result::Result<AttemptOutcome, AttemptError> {
    let keepalive_token = CancellationToken::new();
    let keepalive_handle = spawn_keepalive(&mut attach, keepalive_token.clone());
    let _keepalive_guard = scopeguard::guard(keepalive_token.clone(), |token| token.cancel());

    let body = async {
        if let Some(stdin_data) = stdin {
            if let Some(mut writer) = attach.stdin() {
                let _ = writer.write_all(&stdin_data.into_bytes()).await;
                let _ = writer.shutdown().await;
            }
        } else {
            drop(attach.stdin());
        }

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut reader) = attach.stdout() {
            read_capped(&mut reader, &mut stdout_buf).await?;
        }
        if let Some(mut reader) = attach.stderr() {
            read_capped(&mut reader, &mut stderr_buf).await?;
        }
        let _ = attach.join().await;
        Ok((stdout_buf, stderr_buf))
    };

    let result = match timeout {
        Some(duration) => match tokio::time::timeout(duration, body).await {
            Ok(inner) => inner,
            Err(_) => {
                keepalive_token.cancel();
                return Err(AttemptError::Timeout);
            }
        },
        None => body.await,
    };

    keepalive_token.cancel();
    let _ = keepalive_handle.await;

    let (stdout_buf, stderr_buf) = result?;
    let stdout_raw = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

    match extract_sentinel(&stdout_raw) {
        (stdout, Some(returncode)) => Ok(AttemptOutcome::Completed { stdout, stderr, returncode }),
        (stdout, None) => Ok(AttemptOutcome::NoSentinel { stdout, stderr }),
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::result::Result<(), AttemptError> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| AttemptError::Transport(classify_message(&e.to_string())))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > DEFAULT_OUTPUT_LIMIT_BYTES {
            return Err(AttemptError::OutputLimitExceeded { limit: DEFAULT_OUTPUT_LIMIT_BYTES });
        }
    }
    Ok(())
}

/// Sends an empty frame on the resize channel every [`KEEPALIVE_INTERVAL`]
/// while the attached process is open, fighting idle-socket reapers that sit
/// between the client and the API server. Exits as soon as the process
/// closes or `stop` fires.
fn spawn_keepalive(attach: &mut kube::api::AttachedProcess, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    let resize_tx = attach.terminal_size();
    tokio::spawn(async move {
        let Some(tx) = resize_tx else { return };
        loop {
            tokio::select! {
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    if tx.send(kube::api::TerminalSize { height: 0, width: 0 }).await.is_err() {
                        return;
                    }
                }
                _ = stop.cancelled() => return,
            }
        }
    })
}

/// Probes whether the command ever started (marker file present) and
/// whether it ran to completion (status file present) by testing for both
/// in a single remote round trip.
async fn probe_marker_state(
    client: kube::Client,
    pod: &PodInfo,
    marker_path: &str,
    status_path: &str,
) -> Result<ExecutionState> {
    let request = ExecRequest {
        command: vec![
            "sh".into(),
            "-c".into(),
            format!(
                "test -f {} && {{ test -f {} && exit 2 || exit 0; }}",
                shell_quote(marker_path),
                shell_quote(status_path)
            ),
        ],
        stdin: None,
        cwd: None,
        env: vec![],
        user: None,
        timeout: Some(Duration::from_secs(10)),
    };
    let script = build_trampoline(&request.command, "probe", None, &[], None);
    match run_attempt(client, pod, &script, None, request.timeout).await {
        Ok(AttemptOutcome::Completed { returncode, .. }) => Ok(match returncode {
            0 => ExecutionState::Started,
            2 => ExecutionState::Completed,
            _ => ExecutionState::NotStarted,
        }),
        _ => Ok(ExecutionState::NotStarted),
    }
}

async fn cleanup_marker_files(client: kube::Client, pod: &PodInfo, marker_path: &str, status_path: &str) {
    let script = format!("rm -f {} {}", shell_quote(marker_path), shell_quote(status_path));
    let _ = run_attempt(client, pod, &script, None, Some(Duration::from_secs(10))).await;
}

/// Compares the container restart counts captured at pod discovery against
/// the current live pod status, to tell a pod restart apart from a command
/// that simply failed.
async fn check_pod_restart(
    client: kube::Client,
    pod: &PodInfo,
    behavior: RestartedContainerBehavior,
    ran_for: Duration,
) -> Result<()> {
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::Api;

    let api: Api<Pod> = Api::namespaced(client, &pod.namespace);
    let current: K8sPod = api
        .get(&pod.name)
        .await
        .map_err(|e| PodError::new(format!("failed to read pod status for restart check: {e}")))?;

    let mut restarted: Vec<String> = Vec::new();
    if let Some(statuses) = current.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for status in statuses {
            let baseline = pod.restart_counts.get(&status.name).copied().unwrap_or(0);
            if status.restart_count > baseline {
                restarted.push(status.name.clone());
            }
        }
    }
    if restarted.is_empty() {
        return Ok(());
    }
    let message = format!(
        "container(s) {restarted:?} in pod '{}' restarted after running for {:.1}s",
        pod.name,
        ran_for.as_secs_f64()
    );
    match behavior {
        RestartedContainerBehavior::Warn => {
            warn!(pod = pod.name.as_str(), containers = ?restarted, ran_for_secs = ran_for.as_secs_f64(), "{}", message);
            Ok(())
        }
        RestartedContainerBehavior::Raise => Err(PodError::new(message).into()),
    }
}

/// Builds the `sh -c` trampoline: writes a marker, optionally `cd`s and
/// exports env vars, runs the user command (as `user` via `su` when given),
/// then echoes the sentinel and writes the status file.
fn build_trampoline(
    command: &[String],
    execution_id: &str,
    cwd: Option<&str>,
    env: &[(String, String)],
    user: Option<&str>,
) -> String {
    let (marker_path, status_path) = retry::marker_paths(execution_id);

    let mut inner = String::new();
    if let Some(cwd) = cwd {
        inner.push_str(&format!("cd {}\n", shell_quote(cwd)));
    }
    for (key, value) in env {
        inner.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    inner.push_str(&shell_join(command));

    let mut script = format!("touch {}\n", shell_quote(&marker_path));
    match user {
        Some(user) => {
            script.push_str(&format!("su -s /bin/sh -c {} {}", shell_quote(&inner), shell_quote(user)));
        }
        None => script.push_str(&inner),
    }
    script.push_str(
        "\nrc=$?\n\
         echo \"<completed-sentinel-value-${rc}>\"\n\
         printf '%s' \"$rc\" > ",
    );
    script.push_str(&shell_quote(&status_path));
    script.push_str("\nexit $rc\n");
    script
}

fn shell_join(command: &[String]) -> String {
    command.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Splices the sentinel out of `stdout` and returns the exit code it
/// encoded, without disturbing surrounding bytes.
pub fn extract_sentinel(stdout: &str) -> (String, Option<i32>) {
    match SENTINEL_RE.captures(stdout) {
        Some(caps) => {
            let whole = caps.get(0).expect("capture group 0 always matches");
            let code: i32 = caps[1].parse().unwrap_or(0);
            let mut spliced = String::with_capacity(stdout.len() - whole.as_str().len());
            spliced.push_str(&stdout[..whole.start()]);
            spliced.push_str(&stdout[whole.end()..]);
            (spliced, Some(code))
        }
        None => (stdout.to_string(), None),
    }
}

fn classify_kube_error(error: &kube::Error) -> ExecTransportError {
    classify_message(&error.to_string())
}

fn classify_message(message: &str) -> ExecTransportError {
    let lower = message.to_lowercase();
    if lower.contains("connection closed") || lower.contains("websocketconnectionclosed") || lower.contains("reset by peer") {
        return ExecTransportError::ConnectionClosed;
    }
    if lower.contains("ssl") && (lower.contains("eof") || lower.contains("unexpected eof")) {
        return ExecTransportError::SslEof;
    }
    if let Some(status_code) = extract_status_code(&lower) {
        return ExecTransportError::BadStatus { status_code, message: message.to_string() };
    }
    ExecTransportError::Other(message.to_string())
}

fn extract_status_code(message: &str) -> Option<u16> {
    static STATUS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([1-5]\d{2})\b").expect("valid regex"));
    STATUS_RE.captures(message).and_then(|c| c[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_extraction_splices_cleanly() {
        let (stdout, rc) = extract_sentinel("a\nb<completed-sentinel-value-42>\nc\nd");
        assert_eq!(stdout, "a\nb\nc\nd");
        assert_eq!(rc, Some(42));
    }

    #[test]
    fn sentinel_extraction_covers_all_codes() {
        for rc in [0u16, 1, 42, 127, 255] {
            let input = format!("prefix<completed-sentinel-value-{rc}>suffix");
            let (stdout, code) = extract_sentinel(&input);
            assert_eq!(stdout, "prefixsuffix");
            assert_eq!(code, Some(rc as i32));
        }
    }

    #[test]
    fn sentinel_absent_yields_none() {
        let (stdout, rc) = extract_sentinel("no sentinel here");
        assert_eq!(stdout, "no sentinel here");
        assert_eq!(rc, None);
    }

    #[test]
    fn trampoline_includes_marker_cwd_env_and_sentinel() {
        let script = build_trampoline(
            &["echo".to_string(), "hi".to_string()],
            "abc123",
            Some("/work"),
            &[("FOO".to_string(), "bar".to_string())],
            None,
        );
        assert!(script.contains("/tmp/.k8s_exec_abc123.marker"));
        assert!(script.contains("cd '/work'"));
        assert!(script.contains("export FOO='bar'"));
        assert!(script.contains("'echo' 'hi'"));
        assert!(script.contains("<completed-sentinel-value-${rc}>"));
        assert!(script.contains("/tmp/.k8s_exec_abc123.status"));
    }

    #[test]
    fn trampoline_wraps_command_with_su_when_user_given() {
        let script = build_trampoline(&["whoami".to_string()], "abc123", None, &[], Some("agent"));
        assert!(script.contains("su -s /bin/sh -c"));
        assert!(script.contains("'whoami'"));
        assert!(script.ends_with("'agent'\nrc=$?\necho \"<completed-sentinel-value-${rc}>\"\nprintf '%s' \"$rc\" > '/tmp/.k8s_exec_abc123.status'\nexit $rc\n"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn classifies_connection_closed_and_ssl_eof_as_retryable() {
        assert!(matches!(classify_message("WebSocketConnectionClosedException"), ExecTransportError::ConnectionClosed));
        assert!(matches!(classify_message("ssl: unexpected eof while reading"), ExecTransportError::SslEof));
    }

    #[test]
    fn classifies_bad_status_from_message() {
        match classify_message("upgrade failed: 503 Service Unavailable") {
            ExecTransportError::BadStatus { status_code, .. } => assert_eq!(status_code, 503),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
