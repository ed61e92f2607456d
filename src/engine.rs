use crate::builder::CommandSpec;
use crate::job::{JobId, StreamJob};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest stderr line kept; the rest of the line is dropped.
const MAX_LINE_BYTES: usize = 1024;
/// How long to wait for the stderr reader to drain after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Last `capacity` lines of a process's stderr.
#[derive(Debug)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

type SharedTail = Arc<Mutex<DiagnosticTail>>;

fn push_line(tail: &SharedTail, line: impl Into<String>) {
    tail.lock().unwrap_or_else(PoisonError::into_inner).push(line);
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exited on its own.
    Exited { code: Option<i32> },
    /// Killed after the wall-clock limit.
    TimedOut,
    /// Stopped on request.
    Stopped { code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub diagnostic_tail: Vec<String>,
}

/// A spawned FFmpeg process. Owns the child handle exclusively.
pub struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    tail: SharedTail,
    reader: JoinHandle<()>,
    label: String,
}

pub struct Engine;

impl Engine {
    /// Starts the command as a child process.
    ///
    /// # Errors
    /// - available memory below `min_free_memory_kb`
    /// - the binary could not be executed
    pub fn spawn(
        label: &str,
        spec: &CommandSpec,
        diagnostic_lines: usize,
        min_free_memory_kb: u64,
    ) -> Result<RunningProcess, String> {
        // 1. Refuse to start when the host is almost out of memory
        if min_free_memory_kb > 0 {
            match sys_info::mem_info() {
                Ok(mem) if mem.avail < min_free_memory_kb => {
                    return Err(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to check memory usage: {}", e),
            }
        }

        // 2. Launch with stdin kept open for graceful `q`
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("[{}] exec: {}", label, spec.display());
        let mut child = cmd.spawn().map_err(|e| {
            error!("[{}] Failed to spawn {}: {}", label, spec.program, e);
            format!("failed to start {}: {}", spec.program, e)
        })?;

        // 3. Capture stderr into the bounded tail
        let tail = Arc::new(Mutex::new(DiagnosticTail::new(diagnostic_lines)));
        let reader = match child.stderr.take() {
            Some(stderr) => tokio::spawn(read_diagnostics(stderr, tail.clone(), label.to_string())),
            None => tokio::spawn(async {}),
        };

        info!("[{}] Process started (pid {:?})", label, child.id());
        Ok(RunningProcess {
            stdin: child.stdin.take(),
            child,
            tail,
            reader,
            label: label.to_string(),
        })
    }

    /// Runs `<binary> -version` and returns the first line of its output.
    pub async fn probe(binary: &str) -> Result<String, String> {
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(binary)
                .arg("-version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| format!("{} -version timed out", binary))?
        .map_err(|e| format!("failed to start {}: {}", binary, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit, enforcing `timeout` and honouring a stop
    /// request on `stop_rx`. A dropped sender is not a stop request.
    pub async fn supervise(
        mut self,
        timeout: Duration,
        stop_grace: Duration,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> RunReport {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            status = self.child.wait() => RunOutcome::Exited { code: exit_code(status) },
            _ = &mut deadline => {
                warn!("[{}] Exceeded {}s wall-clock limit, killing", self.label, timeout.as_secs());
                push_line(
                    &self.tail,
                    format!("terminated after exceeding the {}s wall-clock limit", timeout.as_secs()),
                );
                let _ = self.child.kill().await;
                RunOutcome::TimedOut
            }
            Ok(()) = &mut stop_rx => {
                let code = self.stop(stop_grace).await;
                RunOutcome::Stopped { code }
            }
        };

        // The pipe closes with the process; don't wait on stray grandchildren.
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut self.reader).await;
        self.reader.abort();

        let diagnostic_tail = self
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines();
        RunReport {
            outcome,
            diagnostic_tail,
        }
    }

    /// Asks FFmpeg to quit through stdin, sends SIGTERM halfway through
    /// `grace`, and kills it once `grace` has passed.
    async fn stop(&mut self, grace: Duration) -> Option<i32> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }
        let quit_window = grace / 2;
        if let Ok(status) = tokio::time::timeout(quit_window, self.child.wait()).await {
            info!("[{}] Process quit", self.label);
            return exit_code(status);
        }

        // a blocked input read never sees `q`
        self.terminate();
        match tokio::time::timeout(grace - quit_window, self.child.wait()).await {
            Ok(status) => {
                info!("[{}] Process terminated", self.label);
                exit_code(status)
            }
            Err(_) => {
                warn!("[{}] Did not quit within {}s, force killing", self.label, grace.as_secs());
                let _ = self.child.kill().await;
                None
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        debug!("[{}] Sending SIGTERM to {}", self.label, pid);
        // SAFETY: the pid belongs to our un-reaped child, so it cannot have been recycled
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "[{}] SIGTERM failed: {}",
                self.label,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

fn exit_code(status: std::io::Result<ExitStatus>) -> Option<i32> {
    status.ok().and_then(|s| s.code())
}

/// Splits stderr on `\r` and `\n` (FFmpeg rewrites its progress line with
/// `\r`), truncating long lines so a runaway stream cannot grow memory.
async fn read_diagnostics(mut stderr: ChildStderr, tail: SharedTail, label: String) {
    let mut chunk = [0u8; 4096];
    let mut line: Vec<u8> = Vec::new();

    let flush = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line).trim().to_string();
        line.clear();
        if !text.is_empty() {
            debug!("[{}] ffmpeg: {}", label, text);
            push_line(&tail, text);
        }
    };

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &chunk[..n] {
            match byte {
                b'\r' | b'\n' => flush(&mut line),
                other if line.len() < MAX_LINE_BYTES => line.push(other),
                _ => {}
            }
        }
    }
    flush(&mut line);
}

pub fn job_log_path(logs_dir: &Path, id: JobId) -> PathBuf {
    logs_dir.join(format!("job-{}.log", id.0))
}

/// Writes the terminal record of a job to `logs/job-<id>.log`.
pub async fn persist_job_log(logs_dir: &Path, job: &StreamJob) -> std::io::Result<PathBuf> {
    let path = job_log_path(logs_dir, job.id);
    let mut body = String::new();
    body.push_str(&format!("job: {}\n", job.id));
    body.push_str(&format!("state: {}\n", job.state));
    body.push_str(&format!("source: {}\n", job.source));
    body.push_str(&format!("destination: {}\n", job.destination));
    body.push_str(&format!("command: {}\n", job.command.display()));
    body.push_str(&format!("attempt: {}\n", job.attempt));
    if let Some(started) = job.started_at {
        body.push_str(&format!("started_at: {}\n", started.to_rfc3339()));
    }
    if let Some(ended) = job.ended_at {
        body.push_str(&format!("ended_at: {}\n", ended.to_rfc3339()));
    }
    if let Some(info) = &job.exit_info {
        if let Some(code) = info.code {
            body.push_str(&format!("exit_code: {}\n", code));
        }
        if let Some(reason) = &info.reason {
            body.push_str(&format!("reason: {}\n", reason));
        }
        body.push_str("--- diagnostic tail ---\n");
        for line in &info.diagnostic_tail {
            body.push_str(line);
            body.push('\n');
        }
    }
    fs::create_dir_all(logs_dir).await?;
    fs::write(&path, body).await?;
    Ok(path)
}
