use crate::builder::{CommandBuilder, CommandSpec};
use crate::config::SupervisorConfig;
use crate::engine::{self, Engine, RunOutcome, RunReport};
use crate::error::SubmitError;
use crate::job::{ExitInfo, FailureReason, JobId, JobState, OptionValue, StreamJob, StreamRequest};
use crate::registry::{Capacity, JobDraft, JobEvent, JobFilter, JobListing, Registry, TransitionInfo};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and is now Cancelled.
    Cancelled,
    /// A stop signal was sent; the job becomes Cancelled once the process exits.
    Stopping,
    /// Nothing to do, the job had already reached this state.
    AlreadyFinished(JobState),
}

/// Lifecycle messages, consumed in order by the scheduling loop.
enum Message {
    Submitted(JobId),
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Result<CancelOutcome, SubmitError>>,
    },
    Exited {
        id: JobId,
        report: RunReport,
    },
    Retry(JobDraft),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle used by the bot adapter and the HTTP layer.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<Registry>,
    builder: CommandBuilder,
    capacity: Capacity,
    tx: mpsc::UnboundedSender<Message>,
}

struct ActiveJob {
    stop_tx: Option<oneshot::Sender<()>>,
    cancel_requested: bool,
}

/// The scheduling loop. It is the only writer of job state transitions.
pub struct Scheduler {
    registry: Arc<Registry>,
    config: SupervisorConfig,
    logs_dir: Option<PathBuf>,
    tick: Duration,
    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::UnboundedSender<Message>,
    queue: VecDeque<JobId>,
    active: HashMap<JobId, ActiveJob>,
}

/// Creates the handle/loop pair. The loop must be spawned for jobs to run.
pub fn start(
    registry: Arc<Registry>,
    builder: CommandBuilder,
    config: SupervisorConfig,
    logs_dir: Option<PathBuf>,
    tick: Duration,
) -> (Supervisor, Scheduler) {
    let (tx, rx) = mpsc::unbounded_channel();
    let capacity = Capacity {
        max_concurrent: config.max_concurrent,
        max_queue: config.max_queue,
    };
    let supervisor = Supervisor {
        registry: registry.clone(),
        builder,
        capacity,
        tx: tx.clone(),
    };
    let scheduler = Scheduler {
        registry,
        config,
        logs_dir,
        tick,
        rx,
        tx,
        queue: VecDeque::new(),
        active: HashMap::new(),
    };
    (supervisor, scheduler)
}

impl Supervisor {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validates and queues a request. The returned job is Pending.
    pub fn submit(&self, request: StreamRequest) -> Result<StreamJob, SubmitError> {
        let command = self.builder.build(&request)?;
        self.enqueue(JobDraft::new(request, command))
    }

    fn enqueue(&self, draft: JobDraft) -> Result<StreamJob, SubmitError> {
        if self.tx.is_closed() {
            return Err(SubmitError::Unavailable);
        }
        let job = self.registry.create(draft, self.capacity)?;
        info!(
            "Job [{}] queued: {} -> {}",
            job.id, job.source, job.destination
        );
        if self.tx.send(Message::Submitted(job.id)).is_err() {
            // the loop is gone, so nothing else will ever move this job
            let _ = self
                .registry
                .transition(job.id, JobState::Cancelled, TransitionInfo::default());
            return Err(SubmitError::Unavailable);
        }
        Ok(job)
    }

    /// Cancels a job. Already finished jobs are reported, not treated as errors.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Cancel { id, reply })
            .map_err(|_| SubmitError::Unavailable)?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    pub fn get(&self, id: JobId) -> Option<StreamJob> {
        self.registry.get(id)
    }

    pub fn list(&self, filter: JobFilter) -> JobListing {
        self.registry.list(filter)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    /// Stops every running job and waits for the loop to finish.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Scheduler {
    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        // a zero period panics inside tokio
        let mut interval = tokio::time::interval(self.tick.max(Duration::from_millis(1)));
        info!(
            "Supervisor started (max_concurrent={}, max_queue={})",
            self.config.max_concurrent, self.config.max_queue
        );

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(Message::Shutdown(done)) => {
                        self.shutdown().await;
                        self.rx.close();
                        self.discard_pending_messages();
                        let _ = done.send(());
                        break;
                    }
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = interval.tick() => self.sweep(),
            }
            self.start_queued();
        }
        info!("Supervisor stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Submitted(id) => self.queue.push_back(id),
            Message::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Message::Exited { id, report } => self.on_exit(id, report),
            Message::Retry(draft) => {
                let capacity = Capacity {
                    max_concurrent: self.config.max_concurrent,
                    max_queue: self.config.max_queue,
                };
                match self.registry.create(draft, capacity) {
                    Ok(job) => {
                        info!(
                            "Job [{}] restarts job [{}] (attempt {})",
                            job.id,
                            job.retry_of.unwrap_or(job.id),
                            job.attempt
                        );
                        self.queue.push_back(job.id);
                    }
                    Err(e) => warn!("Restart dropped: {}", e),
                }
            }
            // handled by the loop itself
            Message::Shutdown(_) => {}
        }
    }

    fn cancel(&mut self, id: JobId) -> Result<CancelOutcome, SubmitError> {
        let job = self.registry.get(id).ok_or(SubmitError::NotFound(id))?;
        match job.state {
            state if state.is_terminal() => Ok(CancelOutcome::AlreadyFinished(state)),
            JobState::Pending => {
                self.queue.retain(|queued| *queued != id);
                self.finish(id, JobState::Cancelled, ExitInfo::default());
                Ok(CancelOutcome::Cancelled)
            }
            _ => {
                if let Some(active) = self.active.get_mut(&id) {
                    active.cancel_requested = true;
                    if let Some(stop_tx) = active.stop_tx.take() {
                        info!("Job [{}] stop requested", id);
                        let _ = stop_tx.send(());
                    }
                }
                Ok(CancelOutcome::Stopping)
            }
        }
    }

    /// Starts queued jobs while there are free slots, in FIFO order.
    fn start_queued(&mut self) {
        while self.active.len() < self.config.max_concurrent {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            match self.registry.get(id) {
                Some(job) if job.state == JobState::Pending => self.launch(job),
                _ => debug!("Job [{}] no longer pending, skipped", id),
            }
        }
    }

    fn launch(&mut self, job: StreamJob) {
        let label = format!("job {}", job.id);
        let process = match Engine::spawn(
            &label,
            &job.command,
            self.config.diagnostic_lines,
            self.config.min_free_memory_kb,
        ) {
            Ok(process) => process,
            Err(reason) => {
                let failed = self.finish(
                    job.id,
                    JobState::Failed,
                    ExitInfo {
                        code: None,
                        reason: Some(FailureReason::SpawnError(reason.clone())),
                        diagnostic_tail: vec![reason],
                    },
                );
                if let Some(failed) = failed {
                    self.maybe_retry(&failed);
                }
                return;
            }
        };

        let running = self.registry.transition(
            job.id,
            JobState::Running,
            TransitionInfo {
                pid: process.pid(),
                exit_info: None,
            },
        );
        if let Err(e) = running {
            // dropping the process kills it
            error!("{}", e);
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        self.active.insert(
            job.id,
            ActiveJob {
                stop_tx: Some(stop_tx),
                cancel_requested: false,
            },
        );

        let tx = self.tx.clone();
        let id = job.id;
        let timeout = effective_timeout(&job.command, &self.config);
        let grace = self.config.stop_grace();
        tokio::spawn(async move {
            let report = process.supervise(timeout, grace, stop_rx).await;
            let _ = tx.send(Message::Exited { id, report });
        });
    }

    fn on_exit(&mut self, id: JobId, report: RunReport) {
        let cancel_requested = self
            .active
            .remove(&id)
            .map_or(false, |active| active.cancel_requested);

        let (state, code, reason) = match report.outcome {
            // cancellation wins over whatever the signal made the process return
            RunOutcome::Exited { code } | RunOutcome::Stopped { code } if cancel_requested => {
                (JobState::Cancelled, code, None)
            }
            RunOutcome::TimedOut if cancel_requested => (JobState::Cancelled, None, None),
            RunOutcome::Exited { code: Some(0) } => (JobState::Completed, Some(0), None),
            RunOutcome::Exited { code } => (
                JobState::Failed,
                code,
                Some(FailureReason::ProcessExitNonZero),
            ),
            RunOutcome::TimedOut => (JobState::Failed, None, Some(FailureReason::Timeout)),
            RunOutcome::Stopped { code } => (JobState::Cancelled, code, None),
        };

        let exit_info = ExitInfo {
            code,
            reason,
            diagnostic_tail: report.diagnostic_tail,
        };
        if let Some(job) = self.finish(id, state, exit_info) {
            match job.state {
                JobState::Completed => info!("Job [{}] completed", id),
                JobState::Cancelled => info!("Job [{}] cancelled", id),
                _ => warn!(
                    "Job [{}] failed: {}",
                    id,
                    job.exit_info
                        .as_ref()
                        .and_then(|i| i.reason.as_ref())
                        .map(ToString::to_string)
                        .unwrap_or_default()
                ),
            }
            self.maybe_retry(&job);
        }
    }

    /// Applies a terminal transition and persists the job's log.
    fn finish(&mut self, id: JobId, state: JobState, exit_info: ExitInfo) -> Option<StreamJob> {
        let info = TransitionInfo {
            pid: None,
            exit_info: Some(exit_info),
        };
        match self.registry.transition(id, state, info) {
            Ok(job) => {
                if let Some(dir) = self.logs_dir.clone() {
                    let record = job.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine::persist_job_log(&dir, &record).await {
                            warn!("Failed to write log for job [{}]: {}", record.id, e);
                        }
                    });
                }
                Some(job)
            }
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    /// Schedules a fresh job for a failed one when the retry policy allows it.
    /// Timeouts are never restarted.
    fn maybe_retry(&self, job: &StreamJob) {
        let policy = &self.config.retry;
        let retryable = job.state == JobState::Failed
            && job
                .exit_info
                .as_ref()
                .is_some_and(|i| i.reason != Some(FailureReason::Timeout));
        if !retryable || job.attempt > policy.max_attempts {
            return;
        }

        let delay = policy.backoff(job.attempt - 1);
        warn!(
            "Job [{}] crashed. Retry {}/{}. Backing off for {}s.",
            job.id,
            job.attempt,
            policy.max_attempts,
            delay.as_secs()
        );
        let draft = JobDraft {
            request: StreamRequest {
                source: job.source.clone(),
                destination: job.destination.clone(),
                options: job
                    .options
                    .iter()
                    .map(|(k, v)| (k.clone(), OptionValue::Text(v.clone())))
                    .collect(),
                requested_by: job.requested_by,
            },
            command: job.command.clone(),
            attempt: job.attempt + 1,
            retry_of: Some(job.id),
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Retry(draft));
        });
    }

    fn sweep(&mut self) {
        let evicted = self
            .registry
            .evict_finished(Utc::now(), self.config.retention());
        if !evicted.is_empty() {
            debug!("Evicted {} finished jobs", evicted.len());
        }
    }

    /// Stops all running jobs and waits for their exits.
    async fn shutdown(&mut self) {
        info!("Stopping {} running jobs", self.active.len());
        let queued: Vec<JobId> = self.queue.drain(..).collect();
        for id in queued {
            self.finish(id, JobState::Cancelled, ExitInfo::default());
        }
        for active in self.active.values_mut() {
            active.cancel_requested = true;
            if let Some(stop_tx) = active.stop_tx.take() {
                let _ = stop_tx.send(());
            }
        }

        let deadline = self.config.stop_grace() + Duration::from_secs(2);
        let drained = tokio::time::timeout(deadline, async {
            while !self.active.is_empty() {
                match self.rx.recv().await {
                    Some(Message::Exited { id, report }) => self.on_exit(id, report),
                    Some(Message::Submitted(id)) => {
                        self.finish(id, JobState::Cancelled, ExitInfo::default());
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} jobs did not stop in time", self.active.len());
        }
    }

    /// Cancels jobs whose submission raced with shutdown. Runs after the
    /// channel is closed, so nothing new can arrive.
    fn discard_pending_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Submitted(id) => {
                    self.finish(id, JobState::Cancelled, ExitInfo::default());
                }
                Message::Exited { id, report } => self.on_exit(id, report),
                Message::Shutdown(done) => {
                    let _ = done.send(());
                }
                // dropping the reply reports Unavailable to the caller
                Message::Cancel { .. } | Message::Retry(_) => {}
            }
        }
    }
}

fn effective_timeout(command: &CommandSpec, config: &SupervisorConfig) -> Duration {
    if command.limits.max_run_time.is_zero() {
        config.job_timeout()
    } else {
        command.limits.max_run_time
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::builder::ResourceLimits;
    use crate::config::RetryPolicy;

    fn config(max_concurrent: usize, max_queue: usize) -> SupervisorConfig {
        SupervisorConfig {
            max_concurrent,
            max_queue,
            job_timeout_sec: 30,
            stop_grace_sec: 1,
            diagnostic_lines: 10,
            retention_sec: 3600,
            min_free_memory_kb: 0,
            max_output_size_mb: None,
            retry: RetryPolicy::default(),
        }
    }

    fn launch(program: &str, config: SupervisorConfig, logs: Option<PathBuf>) -> Supervisor {
        let builder = CommandBuilder::new(
            program,
            ResourceLimits {
                max_run_time: Duration::from_secs(30),
                max_output_size: None,
            },
        );
        let (supervisor, scheduler) = start(
            Arc::new(Registry::new(20)),
            builder,
            config,
            logs,
            Duration::from_millis(50),
        );
        tokio::spawn(scheduler.run());
        supervisor
    }

    fn sh(script: &str, max_run_time: Duration) -> JobDraft {
        JobDraft::new(
            StreamRequest::new("https://origin.example.com/live", "rtmp://live.example.com/app"),
            CommandSpec {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                limits: ResourceLimits {
                    max_run_time,
                    max_output_size: None,
                },
            },
        )
    }

    async fn wait_for(supervisor: &Supervisor, id: JobId, state: JobState) -> StreamJob {
        for _ in 0..500 {
            if let Some(job) = supervisor.get(id) {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached {}: {:?}", id, state, supervisor.get(id));
    }

    #[tokio::test]
    async fn successful_exit_completes_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mp4");
        std::fs::write(&source, b"media").unwrap();
        let supervisor = launch("true", config(2, 4), Some(dir.path().to_path_buf()));

        let request = StreamRequest::new(source.to_string_lossy(), "out.rtmp").with_option("format", "flv");
        let job = supervisor.submit(request).unwrap();
        assert_eq!(job.state, JobState::Pending);

        let done = wait_for(&supervisor, job.id, JobState::Completed).await;
        assert_eq!(done.exit_info.unwrap().code, Some(0));
        assert!(done.started_at.is_some() && done.ended_at.is_some());

        let log = dir.path().join(format!("job-{}.log", job.id));
        for _ in 0..50 {
            if log.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(std::fs::read_to_string(log).unwrap().contains("state: completed"));
    }

    /// Stands in for FFmpeg's output handling: without `-y` an existing
    /// output file triggers a prompt read from stdin.
    const OVERWRITE_PROMPT: &str = r#"
dest=""; overwrite=no
for a in "$@"; do [ "$a" = -y ] && overwrite=yes; dest="$a"; done
if [ -e "$dest" ] && [ "$overwrite" = no ]; then
  echo "File '$dest' already exists. Overwrite? [y/N]" >&2
  read answer; [ "$answer" = y ] || exit 1
fi
echo streamed > "$dest"
"#;

    #[tokio::test]
    async fn existing_file_destination_does_not_block_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mp4");
        let destination = dir.path().join("out.flv");
        std::fs::write(&source, b"media").unwrap();
        std::fs::write(&destination, b"previous run").unwrap();

        let request = StreamRequest::new(source.to_string_lossy(), destination.to_string_lossy());
        let built = CommandBuilder::new(
            "ffmpeg",
            ResourceLimits {
                max_run_time: Duration::from_secs(5),
                max_output_size: None,
            },
        )
        .build(&request)
        .unwrap();
        let mut args = vec!["-c".to_string(), OVERWRITE_PROMPT.to_string(), "ffmpeg".to_string()];
        args.extend(built.args);
        let command = CommandSpec {
            program: "sh".into(),
            args,
            limits: built.limits,
        };

        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor.enqueue(JobDraft::new(request, command)).unwrap();
        let done = wait_for(&supervisor, job.id, JobState::Completed).await;
        assert_eq!(done.exit_info.unwrap().code, Some(0));
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "streamed\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_tail() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor
            .enqueue(sh("echo 'Connection refused' >&2; exit 1", Duration::from_secs(30)))
            .unwrap();

        let failed = wait_for(&supervisor, job.id, JobState::Failed).await;
        let info = failed.exit_info.unwrap();
        assert_eq!(info.code, Some(1));
        assert_eq!(info.reason, Some(FailureReason::ProcessExitNonZero));
        assert_eq!(info.diagnostic_tail, vec!["Connection refused"]);
    }

    #[tokio::test]
    async fn timeout_fails_the_job() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor
            .enqueue(sh("echo starting >&2; exec sleep 30", Duration::from_millis(300)))
            .unwrap();

        let failed = wait_for(&supervisor, job.id, JobState::Failed).await;
        let info = failed.exit_info.unwrap();
        assert_eq!(info.reason, Some(FailureReason::Timeout));
        assert!(!info.diagnostic_tail.is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_job_ends_cancelled() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor
            .enqueue(sh("exec sleep 30", Duration::from_secs(30)))
            .unwrap();
        wait_for(&supervisor, job.id, JobState::Running).await;

        assert_eq!(supervisor.cancel(job.id).await.unwrap(), CancelOutcome::Stopping);
        let cancelled = wait_for(&supervisor, job.id, JobState::Cancelled).await;
        assert!(cancelled.exit_info.unwrap().reason.is_none());
    }

    #[tokio::test]
    async fn queue_is_fifo_and_bounded() {
        let supervisor = launch("ffmpeg", config(1, 1), None);
        let first = supervisor
            .enqueue(sh("exec sleep 30", Duration::from_secs(30)))
            .unwrap();
        let second = supervisor
            .enqueue(sh("exit 0", Duration::from_secs(30)))
            .unwrap();
        let third = supervisor.enqueue(sh("exit 0", Duration::from_secs(30)));
        assert_eq!(third.unwrap_err(), SubmitError::CapacityExceeded { limit: 1 });

        wait_for(&supervisor, first.id, JobState::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.get(second.id).unwrap().state, JobState::Pending);

        // a queued job is cancelled without ever running
        assert_eq!(
            supervisor.cancel(second.id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let cancelled = supervisor.get(second.id).unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(cancelled.started_at.is_none());

        supervisor.cancel(first.id).await.unwrap();
        wait_for(&supervisor, first.id, JobState::Cancelled).await;
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_finished_jobs() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor.enqueue(sh("exit 0", Duration::from_secs(30))).unwrap();
        wait_for(&supervisor, job.id, JobState::Completed).await;

        for _ in 0..2 {
            assert_eq!(
                supervisor.cancel(job.id).await.unwrap(),
                CancelOutcome::AlreadyFinished(JobState::Completed)
            );
        }
        assert_eq!(
            supervisor.cancel(JobId(9999)).await.unwrap_err(),
            SubmitError::NotFound(JobId(9999))
        );
    }

    #[tokio::test]
    async fn missing_binary_fails_with_spawn_error() {
        let supervisor = launch("/nonexistent/ffmpeg", config(2, 4), None);
        let job = supervisor
            .submit(StreamRequest::new(
                "https://origin.example.com/live",
                "rtmp://live.example.com/app",
            ))
            .unwrap();
        let failed = wait_for(&supervisor, job.id, JobState::Failed).await;
        assert!(failed.started_at.is_none());
        assert!(matches!(
            failed.exit_info.unwrap().reason,
            Some(FailureReason::SpawnError(_))
        ));
    }

    #[tokio::test]
    async fn validation_errors_create_nothing() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let request = StreamRequest::new("https://origin.example.com/live", "rtmp://live.example.com/app")
            .with_option("quality", "ultra");
        match supervisor.submit(request) {
            Err(SubmitError::Validation(e)) => assert_eq!(e.field, "quality"),
            other => panic!("unexpected {:?}", other.map(|j| j.id)),
        }
        assert_eq!(supervisor.list(JobFilter::default()).iter().count(), 0);
    }

    #[tokio::test]
    async fn observed_states_follow_the_lattice() {
        let supervisor = launch("ffmpeg", config(2, 10), None);
        let mut events = supervisor.subscribe();
        let scripts = ["exit 0", "exit 2", "exec sleep 30"];
        let mut ids = Vec::new();
        for script in scripts {
            ids.push(supervisor.enqueue(sh(script, Duration::from_secs(30))).unwrap().id);
        }
        supervisor.cancel(ids[2]).await.unwrap();

        let mut seen: HashMap<JobId, Vec<JobState>> = HashMap::new();
        while seen.values().filter(|s| s.last().is_some_and(|s| s.is_terminal())).count() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            seen.entry(event.job.id).or_default().push(event.job.state);
        }
        for states in seen.values() {
            assert_eq!(states[0], JobState::Pending);
            for pair in states.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{:?}", states);
            }
            assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
        }
    }

    #[tokio::test]
    async fn failed_job_is_restarted_as_new_job() {
        let mut cfg = config(2, 4);
        cfg.retry = RetryPolicy {
            max_attempts: 1,
            initial_backoff_sec: 0,
            max_backoff_sec: 0,
        };
        let supervisor = launch("ffmpeg", cfg, None);
        let first = supervisor.enqueue(sh("exit 1", Duration::from_secs(30))).unwrap();
        wait_for(&supervisor, first.id, JobState::Failed).await;

        let mut retry = None;
        for _ in 0..200 {
            retry = supervisor
                .list(JobFilter::default())
                .iter()
                .find(|job| job.retry_of == Some(first.id))
                .cloned();
            if retry.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let retry = retry.expect("restart job");
        assert_eq!(retry.attempt, 2);
        wait_for(&supervisor, retry.id, JobState::Failed).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.list(JobFilter::default()).iter().count(), 2);
        // the original stays failed
        assert_eq!(supervisor.get(first.id).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn shutdown_stops_running_jobs() {
        let supervisor = launch("ffmpeg", config(2, 4), None);
        let job = supervisor
            .enqueue(sh("exec sleep 30", Duration::from_secs(30)))
            .unwrap();
        wait_for(&supervisor, job.id, JobState::Running).await;

        supervisor.shutdown().await;
        assert_eq!(supervisor.get(job.id).unwrap().state, JobState::Cancelled);
        assert_eq!(
            supervisor.submit(StreamRequest::new(
                "https://origin.example.com/live",
                "rtmp://live.example.com/app"
            ))
            .unwrap_err(),
            SubmitError::Unavailable
        );
    }

    fn unstarted(config: SupervisorConfig, tick: Duration) -> (Supervisor, Scheduler) {
        start(
            Arc::new(Registry::new(20)),
            CommandBuilder::new("ffmpeg", ResourceLimits::default()),
            config,
            None,
            tick,
        )
    }

    #[tokio::test]
    async fn submission_racing_shutdown_is_cancelled() {
        let (supervisor, scheduler) = unstarted(config(2, 4), Duration::from_millis(50));
        let stopping = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.shutdown().await })
        };
        // the shutdown request is queued ahead of the submission
        tokio::time::sleep(Duration::from_millis(20)).await;
        let late = supervisor
            .enqueue(sh("exec sleep 30", Duration::from_secs(30)))
            .unwrap();

        tokio::spawn(scheduler.run());
        stopping.await.unwrap();

        assert_eq!(supervisor.get(late.id).unwrap().state, JobState::Cancelled);
        assert_eq!(supervisor.registry().stats().pending, 0);
    }

    #[tokio::test]
    async fn submit_without_a_scheduler_leaves_no_job_behind() {
        let (supervisor, scheduler) = unstarted(config(2, 4), Duration::from_millis(50));
        drop(scheduler);
        let err = supervisor
            .enqueue(sh("exit 0", Duration::from_secs(30)))
            .unwrap_err();
        assert_eq!(err, SubmitError::Unavailable);
        assert_eq!(supervisor.registry().stats().pending, 0);
    }

    #[tokio::test]
    async fn zero_tick_does_not_stop_the_scheduler() {
        let (supervisor, scheduler) = unstarted(config(2, 4), Duration::ZERO);
        let running = tokio::spawn(scheduler.run());
        let job = supervisor
            .enqueue(sh("exit 0", Duration::from_secs(30)))
            .unwrap();
        wait_for(&supervisor, job.id, JobState::Completed).await;
        assert!(!running.is_finished());
        supervisor.shutdown().await;
    }
}
