//! Uniform async capture of an external command's result.
//!
//! Arguments always pass through as a vector, never interpolated into a
//! shell string. Uses `tokio::process::Command` and races the child's
//! `wait()` against a `CancellationToken` with `tokio::select!`, killing the
//! child with SIGINT then SIGKILL on cancellation.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(thiserror::Error, Debug)]
pub enum SubprocessError {
    #[error("failed to execute command: {0}")]
    Io(#[from] std::io::Error),

    #[error("command killed: {0}")]
    Killed(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured result of running an external command.
#[derive(Debug, Clone)]
pub struct SubprocessOutput {
    pub success: bool,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a named external command with an argument vector and optional
/// stdin, capturing stdout/stderr to strings.
///
/// No shell interpolation is ever performed: `args` is passed straight to
/// `tokio::process::Command::args`. If `cancel` fires before the child
/// exits, the child is killed (SIGINT, then SIGKILL after the grace period)
/// and `SubprocessError::Killed` is returned; control always returns to the
/// caller.
pub async fn run(
    binary: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    stdin: Option<&[u8]>,
    cancel: Option<&CancellationToken>,
) -> Result<SubprocessOutput, SubprocessError> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in envs {
        command.env(k, v);
    }

    trace!(binary, ?args, "spawning subprocess");
    let mut child = command.spawn()?;

    if let Some(input) = stdin {
        if let Some(mut child_stdin) = child.stdin.take() {
            let _ = child_stdin.write_all(input).await;
        }
    } else {
        drop(child.stdin.take());
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait_and_capture = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let stdout_fut = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout_buf).await;
            }
        };
        let stderr_fut = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr_buf).await;
            }
        };
        let (_, _, status) = tokio::join!(stdout_fut, stderr_fut, child.wait());
        (status, stdout_buf, stderr_buf)
    };

    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);

    tokio::select! {
        (status, stdout_buf, stderr_buf) = wait_and_capture => {
            let status = status?;
            Ok(SubprocessOutput {
                success: status.success(),
                returncode: status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            })
        }
        _ = cancel.cancelled() => {
            kill(&mut child).await;
            Err(SubprocessError::Killed(format!("{binary} was cancelled")))
        }
    }
}

/// SIGINT the child, give it `KILL_GRACE_PERIOD` to exit gracefully, then
/// SIGKILL.
async fn kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGINT);
        }
    }
    let graceful = tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await;
    if graceful.is_err() {
        warn!("subprocess still running after grace period, sending SIGKILL");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_success() {
        let out = run("echo", &["hello"], &[], None, None).await.unwrap();
        assert!(out.success);
        assert_eq!(out.returncode, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let out = run("sh", &["-c", "exit 3"], &[], None, None).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.returncode, 3);
    }

    #[tokio::test]
    async fn cancellation_kills_child_and_returns() {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token_clone.cancel();
        });
        let result = run("sleep", &["30"], &[], None, Some(&token)).await;
        assert!(matches!(result, Err(SubprocessError::Killed(_))));
    }
}
