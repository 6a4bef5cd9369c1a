use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::RunnerError;
use crate::event::{Failure, FailureKind};
use crate::normalize::Normalize;
use crate::protocol::parse::{Line, MAX_FRAME_BYTES, classify_line};
use crate::runner::stream::{CancelToken, RunSink, RunStream};
use crate::session::state::RunState;

/// How long a terminated process gets before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long output already written by a cancelled process is still read.
/// Descendants may hold the pipes open, so EOF can't be awaited.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// An agent invocation: program, arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Runs an agent as a subprocess and normalizes its JSON-lines output.
///
/// stdout and stderr are read together. Lines that aren't JSON are kept (up to
/// `raw_line_cap`) for the fallback diagnostic and never stop the stream.
#[derive(Clone)]
pub struct LineStreamDriver {
    /// Engine name used in fallback messages, e.g. "Claude".
    pub label: String,
    pub normalizer: Arc<dyn Normalize>,
    pub raw_line_cap: usize,
}

impl LineStreamDriver {
    pub fn new(label: impl Into<String>, normalizer: Arc<dyn Normalize>, raw_line_cap: usize) -> Self {
        Self {
            label: label.into(),
            normalizer,
            raw_line_cap,
        }
    }

    /// Spawn `command` and return its event stream. Must be called within a
    /// tokio runtime.
    pub fn start(&self, command: LineCommand, cancel: CancelToken) -> RunStream {
        let (sink, stream) = RunStream::channel();
        tokio::spawn(drive(self.clone(), command, cancel, sink));
        stream
    }

    fn fallback(&self, state: &RunState, exit_code: Option<i32>) -> Failure {
        let label = &self.label;
        if !state.raw_lines().is_empty() {
            let preview = state.raw_lines().join(" | ");
            return Failure::new(
                FailureKind::Protocol,
                format!("{label} output (non-JSON): {preview}"),
            );
        }
        match exit_code {
            Some(code) if code != 0 => {
                Failure::remote(format!("{label} exited with code {code}"))
            }
            _ => Failure::new(FailureKind::Protocol, format!("{label} exited without output")),
        }
    }
}

async fn drive(driver: LineStreamDriver, command: LineCommand, mut cancel: CancelToken, sink: RunSink) {
    let mut state = RunState::new(driver.raw_line_cap);

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = RunnerError::Spawn {
                program: command.program.display().to_string(),
                source,
            };
            tracing::error!(error = %err, "agent process failed to start");
            if let Some(event) = state.finish_with_error(err.to_failure()) {
                sink.emit(event).await;
            }
            sink.complete(state.summary());
            return;
        }
    };
    let pid = child.id();

    let (line_tx, mut line_rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let (kill_tx, kill_rx) = oneshot::channel();
    let mut exit_rx = spawn_waiter(child, kill_rx);
    let mut kill_tx = Some(kill_tx);

    let mut cancelled = false;
    let mut consumer_gone = false;
    let mut kill_at: Option<Instant> = None;
    let mut drain_until: Option<Instant> = None;
    let mut exit: Option<Option<i32>> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled(), if !cancelled => {
                tracing::debug!(pid, "cancelling agent process");
                cancelled = true;
                if exit.is_some() {
                    drain_until = Some(Instant::now() + DRAIN_GRACE);
                } else {
                    terminate(pid);
                    kill_at = Some(Instant::now() + TERMINATE_GRACE);
                }
            }
            () = sleep_until(kill_at), if kill_at.is_some() && exit.is_none() => {
                tracing::debug!(pid, "agent ignored SIGTERM, killing");
                kill_at = None;
                if let Some(tx) = kill_tx.take() {
                    let _ = tx.send(());
                }
            }
            code = &mut exit_rx, if exit.is_none() => {
                exit = Some(code.ok().flatten());
                if cancelled {
                    drain_until = Some(Instant::now() + DRAIN_GRACE);
                }
            }
            () = sleep_until(drain_until), if drain_until.is_some() => {
                tracing::debug!(pid, "agent pipes still open after exit, stopping read");
                break;
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match classify_line(&line) {
                    Line::Json(_) if state.is_terminal() => {
                        tracing::debug!("output after terminal event ignored");
                    }
                    Line::Json(map) => {
                        let raw = Value::Object(map);
                        for event in driver.normalizer.normalize(&raw, &mut state) {
                            if !consumer_gone && !sink.emit(event).await {
                                consumer_gone = true;
                                cancelled = true;
                                if exit.is_some() {
                                    drain_until = Some(Instant::now() + DRAIN_GRACE);
                                } else {
                                    terminate(pid);
                                    kill_at = Some(Instant::now() + TERMINATE_GRACE);
                                }
                            }
                        }
                    }
                    Line::NonJson(text) => {
                        if !state.record_raw_line(&text) {
                            tracing::debug!(line = %text, "non-JSON line beyond cap dropped");
                        }
                    }
                    Line::Blank | Line::Ignored => {}
                }
            }
        }
    }

    let exit_code = match exit {
        Some(code) => code,
        None => exit_rx.await.ok().flatten(),
    };

    let terminal = if cancelled {
        state.finish_with_error(Failure::cancelled())
    } else if state.is_terminal() {
        None
    } else {
        let failure = driver.fallback(&state, exit_code);
        tracing::warn!(exit_code, message = %failure.message, "agent exited without a result");
        state.finish_with_error(failure)
    };
    if let Some(event) = terminal
        && !consumer_gone
    {
        sink.emit(event).await;
    }
    sink.complete(state.summary());
}

fn spawn_reader<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_line_capped(&mut reader, MAX_FRAME_BYTES).await {
                Ok(None) => break,
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "agent output read failed");
                    break;
                }
            }
        }
    });
}

/// Read one line of at most `max` bytes. A longer line is consumed whole and
/// replaced by a short non-JSON notice, so it lands in the diagnostics.
async fn read_line_capped<R>(reader: &mut R, max: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((total > 0).then(|| capped(line, total, max)));
        }
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        total += used;
        if total <= max {
            line.extend_from_slice(&available[..used]);
        } else if !line.is_empty() {
            line = Vec::new();
        }
        reader.consume(used);
        if done {
            return Ok(Some(capped(line, total, max)));
        }
    }
}

fn capped(line: Vec<u8>, total: usize, max: usize) -> Vec<u8> {
    if total <= max {
        return line;
    }
    tracing::warn!(bytes = total, "agent output line exceeds size limit");
    format!("[output line of {total} bytes exceeds the {max} byte limit]").into_bytes()
}

/// Owns the child: reports its exit code, or kills it on request.
fn spawn_waiter(mut child: Child, mut kill_rx: oneshot::Receiver<()>) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::debug!(error = %e, "waiting on agent process failed");
                None
            }
        };
        let _ = tx.send(code);
    });
    rx
}

fn terminate(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: kill with SIGTERM on a pid we spawned and have not yet reaped
    // only delivers a signal; no memory is touched.
    unsafe { libc::kill(pid.cast_signed(), libc::SIGTERM) };
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
