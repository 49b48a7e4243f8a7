//! Streamed pod file transfer.
//!
//! Archives are gzip-compressed tar streams (`tar::Builder` + `flate2`'s
//! `GzEncoder`/`GzDecoder`), matched on the remote side by `-z` on the `tar`
//! invocation. `tar` is sync, so the local archive is built and extracted
//! inside `spawn_blocking`. Write and read both run a single bare `tar`
//! invocation in the container rather than the trampoline used by
//! [`crate::pod::exec`] — `tar`'s own exit status is read directly off the
//! attached process, there is no sentinel framing or idempotent retry here.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::{Api, AttachParams};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::{ExpectedError, PodError, Result, SandboxError};
use crate::pod::PodInfo;

/// Default byte limit enforced on a `read_file` transfer; see
/// [`crate::pod::exec::DEFAULT_OUTPUT_LIMIT_BYTES`] for the sibling constant
/// on the exec path and why neither is configurable via an env var.
const DEFAULT_TRANSFER_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Bytes to write, either as text (written to the archive entry as UTF-8) or
/// raw bytes.
#[derive(Debug, Clone)]
pub enum FileContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl FileContent {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            FileContent::Text(s) => s.into_bytes(),
            FileContent::Bytes(b) => b,
        }
    }
}

/// What `read_file` should return.
#[derive(Debug, Clone)]
pub enum ReadMode {
    Text,
    Bytes,
}

#[derive(Debug, Clone)]
pub enum FileBytes {
    Text(String),
    Bytes(Vec<u8>),
}

/// Writes `content` to `dest_path` inside `pod` by streaming a single-entry
/// gzipped tar archive into `tar -xzf -`.
pub async fn write_file(client: kube::Client, pod: &PodInfo, dest_path: &str, content: FileContent) -> Result<()> {
    let dest = Path::new(dest_path);
    let file_name = dest
        .file_name()
        .ok_or_else(|| PodError::new(format!("destination path '{dest_path}' has no file name")))?
        .to_string_lossy()
        .into_owned();
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).map(|p| p.to_string_lossy().into_owned());

    let bytes = content.into_bytes();
    let archive = tokio::task::spawn_blocking(move || build_tar_entry(&file_name, &bytes))
        .await
        .map_err(|e| PodError::new(format!("tar build task panicked: {e}")))??;

    let extract_dir = parent.unwrap_or_else(|| ".".to_string());
    let command = vec!["tar".to_string(), "-xzf".to_string(), "-".to_string(), "-C".to_string(), extract_dir];

    let outcome = run_tar(client, pod, &command, Some(archive)).await?;
    if outcome.returncode != 0 {
        return Err(classify_transfer_failure(&outcome.stderr, dest_path));
    }
    Ok(())
}

/// Reads `src_path` from inside `pod` by running `tar -czf - <path>` in the
/// container and extracting the single entry locally.
pub async fn read_file(client: kube::Client, pod: &PodInfo, src_path: &str, mode: ReadMode) -> Result<FileBytes> {
    let command = vec!["tar".to_string(), "-czf".to_string(), "-".to_string(), "-C".to_string(), "/".to_string(), src_path.trim_start_matches('/').to_string()];

    let outcome = run_tar(client, pod, &command, None).await?;
    if outcome.returncode != 0 {
        return Err(classify_transfer_failure(&outcome.stderr, src_path));
    }
    if outcome.stdout.len() > DEFAULT_TRANSFER_LIMIT_BYTES {
        return Err(ExpectedError::OutputLimitExceeded { limit: DEFAULT_TRANSFER_LIMIT_BYTES }.into());
    }

    let extracted = tokio::task::spawn_blocking(move || extract_tar_entry(outcome.stdout))
        .await
        .map_err(|e| PodError::new(format!("tar extract task panicked: {e}")))??;

    if extracted.len() > DEFAULT_TRANSFER_LIMIT_BYTES {
        return Err(ExpectedError::OutputLimitExceeded { limit: DEFAULT_TRANSFER_LIMIT_BYTES }.into());
    }

    match mode {
        ReadMode::Bytes => Ok(FileBytes::Bytes(extracted)),
        ReadMode::Text => String::from_utf8(extracted)
            .map(FileBytes::Text)
            .map_err(|_| ExpectedError::UnicodeDecode.into()),
    }
}

struct TarOutcome {
    returncode: i32,
    stdout: Vec<u8>,
    stderr: String,
}

async fn run_tar(client: kube::Client, pod: &PodInfo, command: &[String], stdin: Option<Vec<u8>>) -> Result<TarOutcome> {
    let api: Api<K8sPod> = Api::namespaced(client, &pod.namespace);
    let params = AttachParams::default()
        .stdin(true)
        .stdout(true)
        .stderr(true)
        .tty(false)
        .container(pod.default_container_name.clone());

    let args: Vec<&str> = command.iter().map(String::as_str).collect();
    let mut attach = api
        .exec(&pod.name, args, &params)
        .await
        .map_err(|e| PodError::new(format!("failed to start tar transfer: {e}")))?;

    if let Some(input) = stdin {
        if let Some(mut writer) = attach.stdin() {
            writer
                .write_all(&input)
                .await
                .map_err(|e| PodError::new(format!("failed writing tar stream to pod: {e}")))?;
            let _ = writer.shutdown().await;
        }
    } else {
        drop(attach.stdin());
    }

    let mut stdout_buf = Vec::new();
    if let Some(mut reader) = attach.stdout() {
        reader
            .read_to_end(&mut stdout_buf)
            .await
            .map_err(|e| PodError::new(format!("failed reading tar stream from pod: {e}")))?;
    }
    let mut stderr_buf = Vec::new();
    if let Some(mut reader) = attach.stderr() {
        let _ = reader.read_to_end(&mut stderr_buf).await;
    }

    let status_fut = attach.take_status();
    let _ = attach.join().await;
    let status_message = match status_fut {
        Some(fut) => fut.await.map(|s| s.message.unwrap_or_default()),
        None => None,
    };
    let returncode = status_message.as_deref().map(returncode_from_status_message).unwrap_or(0);

    Ok(TarOutcome { returncode, stdout: stdout_buf, stderr: String::from_utf8_lossy(&stderr_buf).into_owned() })
}

fn build_tar_entry(file_name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, file_name, Cursor::new(bytes))
        .map_err(|e| PodError::new(format!("failed to build tar entry: {e}")))?;
    let tar_bytes = builder.into_inner().map_err(|e| PodError::new(format!("failed to finalize tar archive: {e}")))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).map_err(|e| PodError::new(format!("failed to gzip tar archive: {e}")))?;
    encoder.finish().map_err(|e| PodError::new(format!("failed to finalize gzip stream: {e}")).into())
}

fn extract_tar_entry(archive_bytes: Vec<u8>) -> Result<Vec<u8>> {
    let mut tar_bytes = Vec::new();
    GzDecoder::new(Cursor::new(archive_bytes))
        .read_to_end(&mut tar_bytes)
        .map_err(|e| PodError::new(format!("failed to gunzip tar stream: {e}")))?;

    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut entries = archive.entries().map_err(|e| PodError::new(format!("failed to read tar stream: {e}")))?;
    let mut entry = entries
        .next()
        .ok_or_else(|| PodError::new("tar stream contained no entries"))?
        .map_err(|e| PodError::new(format!("failed to read tar entry: {e}")))?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).map_err(SandboxError::from)?;
    Ok(buf)
}

/// `kube`'s exec status message reports failures as e.g. "command
/// terminated with non-zero exit code: 137"; anything else (including a
/// plain "Success") is treated as exit code 0.
fn returncode_from_status_message(message: &str) -> i32 {
    static CODE_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"exit code:?\s*(\d+)").expect("valid regex"));
    CODE_RE.captures(message).and_then(|c| c[1].parse().ok()).unwrap_or(0)
}

fn classify_transfer_failure(stderr: &str, path: &str) -> SandboxError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") {
        return ExpectedError::Permission(path.to_string()).into();
    }
    if lower.contains("is a directory") {
        return ExpectedError::IsADirectory(path.to_string()).into();
    }
    if lower.contains("no such file or directory") || lower.contains("not found") {
        return ExpectedError::FileNotFound(path.to_string()).into();
    }
    PodError::new(format!("tar transfer failed for '{path}': {stderr}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_entry_round_trips_through_build_and_extract() {
        let archive = build_tar_entry("hello.txt", b"hello world").unwrap();
        let extracted = extract_tar_entry(archive).unwrap();
        assert_eq!(extracted, b"hello world");
    }

    #[test]
    fn classifies_permission_denied() {
        let err = classify_transfer_failure("tar: foo.txt: Cannot open: Permission denied", "/foo.txt");
        assert!(matches!(err, SandboxError::Expected(ExpectedError::Permission(_))));
    }

    #[test]
    fn classifies_is_a_directory() {
        let err = classify_transfer_failure("tar: foo: Is a directory", "/foo");
        assert!(matches!(err, SandboxError::Expected(ExpectedError::IsADirectory(_))));
    }

    #[test]
    fn classifies_file_not_found() {
        let err = classify_transfer_failure("tar: missing.txt: No such file or directory", "/missing.txt");
        assert!(matches!(err, SandboxError::Expected(ExpectedError::FileNotFound(_))));
    }

    #[test]
    fn read_mode_text_rejects_non_utf8() {
        let invalid = vec![0xff, 0xfe, 0xfd];
        let result = String::from_utf8(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn parses_returncode_from_status_message() {
        assert_eq!(returncode_from_status_message("command terminated with non-zero exit code: 137"), 137);
        assert_eq!(returncode_from_status_message("Success"), 0);
    }
}
