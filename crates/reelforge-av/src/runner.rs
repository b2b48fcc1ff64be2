//! Progress-streaming encoder runner.
//!
//! [`EncoderProcess::spawn`] starts one [`EncoderCommand`] with stdin closed
//! and both output streams captured. [`EncoderProcess::next_progress`] reads
//! the diagnostic stream in small chunks and yields one [`Progress`] per
//! `time=HH:MM:SS.xx` timecode. [`EncoderProcess::finish`] classifies the
//! exit.
//!
//! The runner imposes no time limit; callers wrap it in their own watchdog
//! and call [`EncoderProcess::kill`] on expiry.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::builder::EncoderCommand;

/// Characters of unparsed diagnostic text kept between reads.
pub const WINDOW_CHARS: usize = 500;

/// Characters of trailing diagnostic text reported as the log or failure
/// detail.
pub const TAIL_CHARS: usize = 1000;

const READ_CHUNK: usize = 256;

fn timecode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("timecode pattern is valid")
    })
}

/// One progress observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Media time encoded so far.
    pub elapsed_secs: f64,
}

/// Trailing diagnostic output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    pub tail: String,
}

/// Why a run did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder failed (exit code {code:?}): {detail}")]
    Failed { code: Option<i32>, detail: String },

    #[error("no output from encoder")]
    NoOutput,

    #[error("I/O error reading encoder output: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// The diagnostic text associated with the failure, if any.
    pub fn detail(&self) -> &str {
        match self {
            Self::Failed { detail, .. } => detail,
            _ => "",
        }
    }
}

/// Keep only the last `n` characters of `s`.
fn keep_last_chars(s: &mut String, n: usize) {
    let count = s.chars().count();
    if count > n {
        if let Some((idx, _)) = s.char_indices().nth(count - n) {
            s.drain(..idx);
        }
    }
}

/// Incremental diagnostic-stream parser.
#[derive(Debug, Default)]
pub struct DiagnosticWindow {
    /// Unscanned text, bounded to [`WINDOW_CHARS`].
    window: String,
    /// Bytes of an incomplete UTF-8 sequence split across reads.
    carry: Vec<u8>,
    tail: String,
    saw_output: bool,
}

impl DiagnosticWindow {
    /// Feed raw bytes; returns the timecodes completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Progress> {
        if bytes.is_empty() {
            return Vec::new();
        }
        self.saw_output = true;

        self.carry.extend_from_slice(bytes);
        let text = match std::str::from_utf8(&self.carry) {
            Ok(s) => {
                let s = s.to_string();
                self.carry.clear();
                s
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end: decode the valid prefix now.
                let valid = e.valid_up_to();
                let s = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                self.carry.drain(..valid);
                s
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                s
            }
        };

        self.tail.push_str(&text);
        keep_last_chars(&mut self.tail, TAIL_CHARS);

        self.window.push_str(&text);
        let mut found = Vec::new();
        let mut consumed = 0;
        for caps in timecode_re().captures_iter(&self.window) {
            let m = caps.get(0).map_or(0, |m| m.end());
            // A fractional part may still be arriving; wait for a delimiter.
            if m == self.window.len() {
                break;
            }
            let h: f64 = caps[1].parse().unwrap_or(0.0);
            let mi: f64 = caps[2].parse().unwrap_or(0.0);
            let s: f64 = caps[3].parse().unwrap_or(0.0);
            found.push(Progress {
                elapsed_secs: h * 3600.0 + mi * 60.0 + s,
            });
            consumed = m;
        }
        self.window.drain(..consumed);
        keep_last_chars(&mut self.window, WINDOW_CHARS);
        found
    }

    pub fn saw_output(&self) -> bool {
        self.saw_output
    }

    pub fn tail(&self) -> &str {
        &self.tail
    }
}

/// A spawned encoder process.
pub struct EncoderProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    diagnostics: DiagnosticWindow,
    pending: VecDeque<Progress>,
}

impl EncoderProcess {
    /// Spawn the command with stdin closed and stdout/stderr piped.
    pub fn spawn(cmd: &EncoderCommand) -> Result<Self, RunError> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Spawn)?;

        tracing::debug!(pid = ?child.id(), command = %cmd.display(), "encoder spawned");

        Ok(Self {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            diagnostics: DiagnosticWindow::default(),
            pending: VecDeque::new(),
        })
    }

    /// OS process id, while the process is alive.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next progress event, or `None` once both streams are closed.
    pub async fn next_progress(&mut self) -> Result<Option<Progress>, RunError> {
        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];

        loop {
            if let Some(p) = self.pending.pop_front() {
                return Ok(Some(p));
            }

            let read = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => Chunk::Out(out.read(&mut out_buf).await?),
                (None, Some(err)) => Chunk::Err(err.read(&mut err_buf).await?),
                (Some(out), Some(err)) => tokio::select! {
                    n = out.read(&mut out_buf) => Chunk::Out(n?),
                    n = err.read(&mut err_buf) => Chunk::Err(n?),
                },
            };

            match read {
                Chunk::Out(0) => self.stdout = None,
                Chunk::Err(0) => self.stderr = None,
                Chunk::Out(n) => self.pending.extend(self.diagnostics.push(&out_buf[..n])),
                Chunk::Err(n) => self.pending.extend(self.diagnostics.push(&err_buf[..n])),
            }
        }
    }

    /// Drain remaining output, wait for exit and classify it.
    pub async fn finish(mut self) -> Result<RunLog, RunError> {
        while self.next_progress().await?.is_some() {}
        let status = self.child.wait().await?;
        let tail = self.diagnostics.tail().to_string();

        if !status.success() {
            return Err(RunError::Failed {
                code: status.code(),
                detail: tail,
            });
        }
        if !self.diagnostics.saw_output() {
            return Err(RunError::NoOutput);
        }
        Ok(RunLog { tail })
    }

    /// Force-terminate the process and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill encoder process");
        }
    }
}

enum Chunk {
    Out(usize),
    Err(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> EncoderCommand {
        EncoderCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            pass: None,
            writes_output: true,
        }
    }

    async fn collect(proc: &mut EncoderProcess) -> Vec<f64> {
        let mut seen = Vec::new();
        while let Some(p) = proc.next_progress().await.unwrap() {
            seen.push(p.elapsed_secs);
        }
        seen
    }

    #[test]
    fn window_extracts_timecodes_across_reads() {
        let mut w = DiagnosticWindow::default();
        assert!(w.push(b"frame=  10 fps=0.0 q=28.0 size=0kB ti").is_empty());
        let p = w.push(b"me=00:00:01.50 bitrate=N/A\rframe= 20 time=00:01:02.25 ");
        let secs: Vec<f64> = p.iter().map(|p| p.elapsed_secs).collect();
        assert_eq!(secs, vec![1.5, 62.25]);
        // Already-consumed timecodes are not reported again.
        assert!(w.push(b"speed=1x\n").is_empty());
    }

    #[test]
    fn window_waits_for_complete_fraction() {
        let mut w = DiagnosticWindow::default();
        assert!(w.push(b"time=00:00:03.4").is_empty());
        let p = w.push(b"0 bitrate");
        assert_eq!(p, vec![Progress { elapsed_secs: 3.4 }]);
    }

    #[test]
    fn window_and_tail_are_bounded() {
        let mut w = DiagnosticWindow::default();
        let noise = "x".repeat(5000);
        w.push(noise.as_bytes());
        assert_eq!(w.tail().chars().count(), TAIL_CHARS);
        assert!(w.window.chars().count() <= WINDOW_CHARS);
    }

    #[test]
    fn window_handles_split_utf8() {
        let mut w = DiagnosticWindow::default();
        let bytes = "é time=00:00:02.00 ".as_bytes();
        w.push(&bytes[..1]);
        let p = w.push(&bytes[1..]);
        assert_eq!(p.len(), 1);
        assert!(w.tail().starts_with('é'));
    }

    #[tokio::test]
    async fn success_streams_progress_and_returns_tail() {
        let mut proc = EncoderProcess::spawn(&sh(
            "printf 'frame=1 time=00:00:01.00 x\\r' >&2; printf 'frame=2 time=00:00:02.50 x\\n' >&2",
        ))
        .unwrap();
        assert!(proc.pid().is_some());
        assert_eq!(collect(&mut proc).await, vec![1.0, 2.5]);
        let log = proc.finish().await.unwrap();
        assert!(log.tail.contains("time=00:00:02.50"));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_tail() {
        let proc = EncoderProcess::spawn(&sh(
            "echo 'Output file is empty, nothing was encoded' >&2; exit 1",
        ))
        .unwrap();
        let err = proc.finish().await.unwrap_err();
        match err {
            RunError::Failed { code, detail } => {
                assert_eq!(code, Some(1));
                assert!(detail.contains("Output file is empty"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_success_is_failure() {
        let proc = EncoderProcess::spawn(&sh("exit 0")).unwrap();
        assert!(matches!(proc.finish().await, Err(RunError::NoOutput)));
    }

    #[tokio::test]
    async fn spawn_failure() {
        let cmd = EncoderCommand {
            program: PathBuf::from("/nonexistent/encoder"),
            args: vec![],
            pass: None,
            writes_output: true,
        };
        assert!(matches!(EncoderProcess::spawn(&cmd), Err(RunError::Spawn(_))));
    }

    #[tokio::test]
    async fn kill_terminates() {
        let mut proc = EncoderProcess::spawn(&sh("echo started >&2; exec sleep 30")).unwrap();
        proc.kill().await;
        let err = proc.finish().await.unwrap_err();
        assert!(matches!(err, RunError::Failed { code: None, .. }));
    }
}
