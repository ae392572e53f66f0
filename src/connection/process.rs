//! Child process capture with a hard timeout
//!
//! Both connectors funnel through [`capture`]. Output is buffered as it
//! arrives so a killed process still reports what it printed.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{ConnectionError, ProcessResult};

/// How long pipes may keep draining after the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Pipes held open by a backgrounded grandchild are abandoned after this
const EXIT_DRAIN_LIMIT: Duration = Duration::from_secs(2);

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Run `command` to completion or until `timeout`.
///
/// On timeout the child is killed and [`ConnectionError::CommandTimeout`]
/// carries the partial output with a null return code.
pub async fn capture(
    mut command: Command,
    timeout: Duration,
) -> Result<ProcessResult, ConnectionError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| ConnectionError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout: Buffer = Arc::default();
    let stderr: Buffer = Arc::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stdout))));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stderr))));
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            settle(readers, EXIT_DRAIN_LIMIT).await;
            Ok(ProcessResult {
                stdout: split_lines(&take(&stdout)),
                stderr: split_lines(&take(&stderr)),
                returncode: exit_code(status),
            })
        }
        Ok(Err(source)) => {
            settle(readers, DRAIN_GRACE).await;
            Err(ConnectionError::Spawn { program, source })
        }
        Err(_) => {
            tracing::error!(
                pid = child.id(),
                program = %program,
                timeout_secs = timeout.as_secs_f64(),
                "command timed out, killing process"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill timed out process");
            }
            settle(readers, DRAIN_GRACE).await;
            Err(ConnectionError::CommandTimeout {
                timeout,
                output: ProcessResult {
                    stdout: split_lines(&take(&stdout)),
                    stderr: split_lines(&take(&stderr)),
                    returncode: None,
                },
            })
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buffer: Buffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Wait up to `grace` for each reader, aborting stragglers.
async fn settle(readers: Vec<JoinHandle<()>>, grace: Duration) {
    for mut reader in readers {
        if tokio::time::timeout(grace, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

fn take(buffer: &Buffer) -> Vec<u8> {
    let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
    std::mem::take(&mut *buf)
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

/// Decode output into lines, dropping carriage returns and the empty
/// element after a trailing newline.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(bytes).replace('\r', "");
    let text = text.strip_suffix('\n').unwrap_or(&text);
    text.split('\n').map(str::to_string).collect()
}

/// Drop ssh's "Permanently added ... to the list of known hosts" chatter.
pub fn filter_ssh_warnings(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter(|line| !line.starts_with("Warning: Permanently added"))
        .collect()
}
