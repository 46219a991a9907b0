//! Running CLI collaborators (`docker`, `kubectl`)

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::errors::ServiceError;

/// Run a command to completion and return its stdout
pub async fn run_command(
    binary: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<String, ServiceError> {
    debug!("Running {} {}", binary, args.join(" "));

    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| spawn_error(binary, e))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify_failure(binary, &stderr))
}

/// Spawn a long-running command and stream its stdout and stderr lines.
/// The process is killed when the stream is dropped.
pub fn spawn_lines(
    binary: &str,
    args: &[String],
) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
    debug!("Streaming {} {}", binary, args.join(" "));

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(binary, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ServiceError::Connectivity(format!("{} stdout unavailable", binary)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ServiceError::Connectivity(format!("{} stderr unavailable", binary)))?;

    let lines = stream::select(read_lines(stdout), read_lines(stderr)).boxed();
    Ok(ProcessLines {
        _child: child,
        lines,
    }
    .boxed())
}

fn read_lines<R>(reader: R) -> BoxStream<'static, Result<String, ServiceError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader).lines()), |lines| async move {
        let mut lines = lines?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(ServiceError::from(e)), None)),
        }
    })
    .boxed()
}

struct ProcessLines {
    _child: Child,
    lines: BoxStream<'static, Result<String, ServiceError>>,
}

impl Stream for ProcessLines {
    type Item = Result<String, ServiceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lines.poll_next_unpin(cx)
    }
}

fn spawn_error(binary: &str, err: std::io::Error) -> ServiceError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ServiceError::Connectivity(format!("{} binary not found", binary))
    } else {
        ServiceError::Connectivity(format!("failed to run {}: {}", binary, err))
    }
}

/// Map a non-zero exit into the collaborator error taxonomy
pub fn classify_failure(binary: &str, stderr: &str) -> ServiceError {
    let lower = stderr.to_lowercase();
    let message = if stderr.is_empty() {
        format!("{} exited with an error", binary)
    } else {
        stderr.to_string()
    };

    if lower.contains("no such") || lower.contains("not found") {
        ServiceError::NotFound(message)
    } else if lower.contains("cannot connect")
        || lower.contains("connection refused")
        || lower.contains("unable to connect")
        || lower.contains("is the docker daemon running")
    {
        ServiceError::Connectivity(message)
    } else {
        ServiceError::Rejected(message)
    }
}
