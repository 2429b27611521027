//! External tool runner.
//!
//! Media tools draw progress bars with carriage returns, so output is split on
//! both `\r` and `\n` and every segment goes through a caller-supplied parser.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::MediaError;

/// Most stderr characters kept in a failure description.
pub const STDERR_TAIL: usize = 500;

/// Bytes of stderr held while a tool runs; always covers [`STDERR_TAIL`] UTF-8 characters.
const STDERR_KEEP: usize = STDERR_TAIL * 8;

/// A progress observation parsed from one output segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// New percentage, if the segment carried one.
    pub percent: Option<f32>,
    pub message: String,
}

impl Progress {
    pub fn new(percent: f32, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            percent: None,
            message: message.into(),
        }
    }
}

/// Receives progress parsed from a running tool.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, progress: Progress);
}

/// Sink that ignores everything, for probes and searches.
pub struct Silent;

#[async_trait]
impl ProgressSink for Silent {
    async fn update(&self, _progress: Progress) {}
}

/// Captured output of a successful run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    /// Tail of stderr, bounded while the tool runs.
    pub stderr: String,
}

/// Splits a byte stream into trimmed, non-empty segments on `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SegmentSplitter {
    pending: Vec<u8>,
}

impl SegmentSplitter {
    /// Feed a chunk, returning every segment it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut segments = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if let Some(segment) = self.take() {
                    segments.push(segment);
                }
            } else {
                self.pending.push(byte);
            }
        }
        segments
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let segment = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!segment.is_empty()).then_some(segment)
    }
}

/// Last `max` characters of `s`.
pub fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Run `command` (program followed by its leading arguments) with `args`
/// appended. Every output segment goes to `parse`; whatever it returns goes to
/// `sink`. A non-zero exit becomes [`MediaError::ToolFailed`].
pub async fn run_tool<P>(
    tool: &str,
    command: &[String],
    args: &[String],
    mut parse: P,
    sink: &dyn ProgressSink,
) -> Result<ToolOutput, MediaError>
where
    P: FnMut(&str) -> Option<Progress>,
{
    let Some((program, leading)) = command.split_first() else {
        return Err(MediaError::Spawn {
            tool: tool.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    tracing::debug!(tool, program = %program, ?args, "Starting tool");

    let mut child = Command::new(program)
        .args(leading)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MediaError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stdout_task = tokio::spawn(pump(child.stdout.take(), tx.clone(), None));
    let stderr_task = tokio::spawn(pump(child.stderr.take(), tx, Some(STDERR_KEEP)));

    while let Some(segment) = rx.recv().await {
        if let Some(progress) = parse(&segment) {
            sink.update(progress).await;
        }
    }

    let stdout = collect(stdout_task).await?;
    let stderr = collect(stderr_task).await?;
    let status = child.wait().await?;

    if !status.success() {
        let detail = match tail(stderr.trim(), STDERR_TAIL) {
            "" => format!("exited with {status}"),
            text => text.to_string(),
        };
        tracing::warn!(tool, %status, "Tool failed");
        return Err(MediaError::ToolFailed {
            tool: tool.to_string(),
            stderr: detail,
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Forward segments of `reader` to `tx` and return what was read, or only its
/// last `keep` bytes when a limit is given.
async fn pump<R>(
    reader: Option<R>,
    tx: mpsc::UnboundedSender<String>,
    keep: Option<usize>,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut raw = Vec::new();
    let mut splitter = SegmentSplitter::default();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(keep) = keep
            && raw.len() > keep * 2
        {
            raw.drain(..raw.len() - keep);
        }
        for segment in splitter.feed(&buf[..n]) {
            let _ = tx.send(segment);
        }
    }
    if let Some(segment) = splitter.finish() {
        let _ = tx.send(segment);
    }
    if let Some(keep) = keep
        && raw.len() > keep
    {
        raw.drain(..raw.len() - keep);
    }

    Ok(String::from_utf8_lossy(&raw).into_owned())
}

async fn collect(task: JoinHandle<std::io::Result<String>>) -> Result<String, MediaError> {
    match task.await {
        Ok(result) => Ok(result?),
        Err(e) => Err(MediaError::Io(std::io::Error::other(e))),
    }
}
