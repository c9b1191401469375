//! Output capture
//!
//! Streams a child's stdout/stderr as bytes arrive instead of waiting for
//! exit, so a hung snippet still yields partial output when the timeout
//! fires. Each stream gets its own byte budget; past the budget we stop
//! storing but keep draining, because a blocked pipe would wedge the child.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long we wait for the drain tasks after the child reached a terminal
/// state. Pipes close when the process dies, so this only triggers when
/// something else still holds the write end.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Limits one supervised run honors.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// A captured stream: at most the configured budget of text, plus a flag
/// telling the caller that data was dropped rather than silently missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

/// What a supervised run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
    pub duration: Duration,
}

impl RunOutcome {
    /// Outcome for a run that was cancelled before anything started.
    pub fn cancelled() -> Self {
        Self {
            exit_code: None,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            timed_out: true,
            duration: Duration::ZERO,
        }
    }
}

/// Byte buffer that stops growing at its limit but remembers that it did.
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        if room > 0 {
            self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub(crate) fn into_stream(self) -> CapturedStream {
        CapturedStream {
            text: String::from_utf8_lossy(&self.data).into_owned(),
            truncated: self.truncated,
        }
    }
}

/// Drain a stream to EOF, keeping at most `limit` bytes.
pub(crate) async fn drain<R>(mut reader: R, limit: usize) -> CappedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buf = CappedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.push(&chunk[..n]),
            // Read errors end the stream; whatever arrived is kept.
            Err(_) => break,
        }
    }
    buf
}

/// Supervise a spawned child: drain both pipes concurrently, race natural
/// exit against the wall-clock deadline and caller cancellation, and
/// force-kill on whichever of the latter two fires first. Cancellation is
/// deliberately indistinguishable from a timeout in the outcome.
pub async fn supervise(
    mut child: Child,
    limits: RunLimits,
    cancel: &CancellationToken,
) -> std::io::Result<RunOutcome> {
    let started = Instant::now();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let budget = limits.max_output_bytes;
    let out_task = tokio::spawn(async move {
        match stdout {
            Some(pipe) => drain(pipe, budget).await,
            None => CappedBuffer::new(budget),
        }
    });
    let err_task = tokio::spawn(async move {
        match stderr {
            Some(pipe) => drain(pipe, budget).await,
            None => CappedBuffer::new(budget),
        }
    });

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status: ExitStatus = status?;
            (status.code(), false)
        }
        _ = tokio::time::sleep(limits.timeout) => {
            kill_and_reap(&mut child).await;
            (None, true)
        }
        _ = cancel.cancelled() => {
            kill_and_reap(&mut child).await;
            (None, true)
        }
    };

    // Killing the child closes its pipes, so the drain tasks finish on their
    // own; the grace period bounds us against a stuck write-end holder.
    let stdout = join_drain(out_task, budget).await;
    let stderr = join_drain(err_task, budget).await;

    Ok(RunOutcome {
        exit_code,
        stdout: stdout.into_stream(),
        stderr: stderr.into_stream(),
        timed_out,
        duration: started.elapsed(),
    })
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill supervised child");
    }
    let _ = child.wait().await;
}

async fn join_drain(task: tokio::task::JoinHandle<CappedBuffer>, budget: usize) -> CappedBuffer {
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!(error = %e, "output drain task failed");
            CappedBuffer::new(budget)
        }
        Err(_) => {
            warn!("output drain task exceeded grace period");
            let mut buf = CappedBuffer::new(budget);
            buf.truncated = true;
            buf
        }
    }
}
