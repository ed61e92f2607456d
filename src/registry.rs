use crate::builder::CommandSpec;
use crate::error::RegistryError;
use crate::job::{ChatId, ExitInfo, JobId, JobState, StreamJob, StreamRequest};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// Published on every create and state transition, in the order applied.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: StreamJob,
    pub previous: Option<JobState>,
}

/// Everything needed to insert a new job.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub request: StreamRequest,
    pub command: CommandSpec,
    pub attempt: u32,
    pub retry_of: Option<JobId>,
}

impl JobDraft {
    pub fn new(request: StreamRequest, command: CommandSpec) -> Self {
        Self {
            request,
            command,
            attempt: 1,
            retry_of: None,
        }
    }
}

/// Admission limits applied by `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub max_concurrent: usize,
    pub max_queue: usize,
}

impl Capacity {
    pub fn unbounded() -> Self {
        Self {
            max_concurrent: usize::MAX,
            max_queue: usize::MAX,
        }
    }

    /// Pending jobs that cannot start right away form the queue.
    fn admits(&self, pending: usize, running: usize) -> bool {
        let free_slots = self.max_concurrent.saturating_sub(running);
        pending.saturating_add(1).saturating_sub(free_slots) <= self.max_queue
    }
}

/// Extra data recorded alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionInfo {
    pub pid: Option<u32>,
    pub exit_info: Option<ExitInfo>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub requested_by: Option<ChatId>,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &StreamJob) -> bool {
        self.state.map_or(true, |s| job.state == s)
            && self
                .requested_by
                .map_or(true, |chat| job.requested_by == Some(chat))
    }
}

/// Snapshot of the registry at the time `list` was called. Filtering is done
/// while iterating, and `iter` may be called any number of times.
#[derive(Debug, Clone)]
pub struct JobListing {
    jobs: Vec<StreamJob>,
    filter: JobFilter,
}

impl JobListing {
    pub fn iter(&self) -> impl Iterator<Item = &StreamJob> + '_ {
        let filter = self.filter;
        self.jobs.iter().filter(move |job| filter.matches(job))
    }
}

impl<'a> IntoIterator for &'a JobListing {
    type Item = &'a StreamJob;
    type IntoIter = Box<dyn Iterator<Item = &'a StreamJob> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Aggregates read by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSnapshot {
    pub pending: usize,
    pub running: usize,
    pub total: usize,
    /// Terminal outcomes currently in the sliding window.
    pub window_len: usize,
    pub window_failed: usize,
}

impl HealthSnapshot {
    pub fn failure_ratio(&self) -> f64 {
        if self.window_len == 0 {
            0.0
        } else {
            self.window_failed as f64 / self.window_len as f64
        }
    }
}

struct Inner {
    jobs: BTreeMap<JobId, StreamJob>,
    /// Most recent terminal states, oldest first.
    recent: VecDeque<JobState>,
}

/// In-memory table of stream jobs, the single source of truth for job state.
pub struct Registry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    window: usize,
    events: broadcast::Sender<JobEvent>,
}

impl Registry {
    /// `window` is the number of terminal outcomes kept for health reporting.
    pub fn new(window: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                jobs: BTreeMap::new(),
                recent: VecDeque::with_capacity(window),
            }),
            next_id: AtomicU64::new(1),
            window: window.max(1),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Inserts a new Pending job unless the wait queue is already full.
    pub fn create(&self, draft: JobDraft, capacity: Capacity) -> Result<StreamJob, RegistryError> {
        let mut inner = self.write();
        let counts = Self::aggregate(&inner);
        if !capacity.admits(counts.pending, counts.running) {
            return Err(RegistryError::CapacityExceeded {
                limit: capacity.max_queue,
            });
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let JobDraft {
            request,
            command,
            attempt,
            retry_of,
        } = draft;
        let job = StreamJob {
            id,
            source: request.source,
            destination: request.destination,
            options: request
                .options
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
            command,
            state: JobState::Pending,
            requested_by: request.requested_by,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            pid: None,
            exit_info: None,
            attempt,
            retry_of,
        };
        inner.jobs.insert(id, job.clone());
        let _ = self.events.send(JobEvent {
            job: job.clone(),
            previous: None,
        });
        debug!("Job [{}] created", id);
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<StreamJob> {
        self.read().jobs.get(&id).cloned()
    }

    pub fn list(&self, filter: JobFilter) -> JobListing {
        JobListing {
            jobs: self.read().jobs.values().cloned().collect(),
            filter,
        }
    }

    /// Applies a state change if the lattice allows it; otherwise nothing
    /// changes and the error describes the rejected move.
    pub fn transition(
        &self,
        id: JobId,
        to: JobState,
        info: TransitionInfo,
    ) -> Result<StreamJob, RegistryError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition { id, from, to });
        }

        let now = Utc::now();
        job.state = to;
        if to == JobState::Running {
            job.started_at = Some(now);
            job.pid = info.pid;
        }
        if to.is_terminal() {
            job.ended_at = Some(now);
            job.pid = None;
            job.exit_info = info.exit_info;
        }
        let snapshot = job.clone();

        if to.is_terminal() {
            if inner.recent.len() == self.window {
                inner.recent.pop_front();
            }
            inner.recent.push_back(to);
        }
        let _ = self.events.send(JobEvent {
            job: snapshot.clone(),
            previous: Some(from),
        });
        debug!("Job [{}] {} -> {}", id, from, to);
        Ok(snapshot)
    }

    /// Non-blocking aggregate read; `None` when a writer holds the lock.
    pub fn health_snapshot(&self) -> Option<HealthSnapshot> {
        let inner = match self.inner.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(Self::aggregate(&inner))
    }

    pub fn stats(&self) -> HealthSnapshot {
        Self::aggregate(&self.read())
    }

    fn aggregate(inner: &Inner) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot {
            total: inner.jobs.len(),
            window_len: inner.recent.len(),
            window_failed: inner
                .recent
                .iter()
                .filter(|s| **s == JobState::Failed)
                .count(),
            ..HealthSnapshot::default()
        };
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => snapshot.pending += 1,
                JobState::Running => snapshot.running += 1,
                _ => {}
            }
        }
        snapshot
    }

    /// Removes terminal jobs that ended more than `retention` before `now`.
    pub fn evict_finished(&self, now: DateTime<Utc>, retention: Duration) -> Vec<JobId> {
        let mut inner = self.write();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .filter(|job| {
                job.ended_at
                    .and_then(|ended| (now - ended).to_std().ok())
                    .is_some_and(|elapsed| elapsed >= retention)
            })
            .map(|job| job.id)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureReason;
    use std::collections::HashSet;

    fn draft() -> JobDraft {
        JobDraft::new(
            StreamRequest::new("https://origin.example.com/a", "rtmp://live.example.com/app"),
            CommandSpec::default(),
        )
    }

    fn finish(registry: &Registry, id: JobId, state: JobState) {
        registry
            .transition(id, JobState::Running, TransitionInfo::default())
            .unwrap();
        registry
            .transition(id, state, TransitionInfo::default())
            .unwrap();
    }

    #[test]
    fn create_yields_pending_jobs_with_unique_ids() {
        let registry = Registry::new(10);
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let job = registry.create(draft(), Capacity::unbounded()).unwrap();
            assert_eq!(job.state, JobState::Pending);
            assert!(seen.insert(job.id));
        }
    }

    #[test]
    fn ids_are_not_reused_after_eviction() {
        let registry = Registry::new(10);
        let first = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        finish(&registry, first, JobState::Completed);
        let evicted = registry.evict_finished(Utc::now(), Duration::ZERO);
        assert_eq!(evicted, vec![first]);
        let second = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        assert_ne!(first, second);
    }

    #[test]
    fn queue_depth_is_bounded() {
        let registry = Registry::new(10);
        let capacity = Capacity {
            max_concurrent: 1,
            max_queue: 2,
        };
        // one job can start immediately, two may wait
        for _ in 0..3 {
            registry.create(draft(), capacity).unwrap();
        }
        let err = registry.create(draft(), capacity).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded { limit: 2 });
        assert_eq!(registry.stats().pending, 3);
    }

    #[test]
    fn running_jobs_use_up_free_slots() {
        let registry = Registry::new(10);
        let capacity = Capacity {
            max_concurrent: 1,
            max_queue: 1,
        };
        let first = registry.create(draft(), capacity).unwrap().id;
        registry
            .transition(first, JobState::Running, TransitionInfo::default())
            .unwrap();
        registry.create(draft(), capacity).unwrap();
        assert!(registry.create(draft(), capacity).is_err());
    }

    #[test]
    fn zero_queue_still_admits_into_free_slots() {
        let registry = Registry::new(10);
        let capacity = Capacity {
            max_concurrent: 2,
            max_queue: 0,
        };
        registry.create(draft(), capacity).unwrap();
        registry.create(draft(), capacity).unwrap();
        assert!(registry.create(draft(), capacity).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let registry = Registry::new(10);
        let id = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        finish(&registry, id, JobState::Completed);

        for to in [JobState::Running, JobState::Failed, JobState::Cancelled, JobState::Pending] {
            let err = registry
                .transition(id, to, TransitionInfo::default())
                .unwrap_err();
            assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        }
        assert_eq!(registry.get(id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn transition_records_timestamps_and_exit_info() {
        let registry = Registry::new(10);
        let id = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        let running = registry
            .transition(
                id,
                JobState::Running,
                TransitionInfo {
                    pid: Some(42),
                    exit_info: None,
                },
            )
            .unwrap();
        assert_eq!(running.pid, Some(42));
        assert!(running.started_at.is_some());

        let failed = registry
            .transition(
                id,
                JobState::Failed,
                TransitionInfo {
                    pid: None,
                    exit_info: Some(ExitInfo {
                        code: Some(1),
                        reason: Some(FailureReason::ProcessExitNonZero),
                        diagnostic_tail: vec!["Connection refused".into()],
                    }),
                },
            )
            .unwrap();
        assert_eq!(failed.pid, None);
        assert!(failed.ended_at.is_some());
        assert_eq!(failed.exit_info.unwrap().code, Some(1));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let registry = Registry::new(10);
        let err = registry
            .transition(JobId(99), JobState::Running, TransitionInfo::default())
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound(JobId(99)));
    }

    #[test]
    fn listing_is_filtered_and_restartable() {
        let registry = Registry::new(10);
        let a = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        let _b = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        finish(&registry, a, JobState::Failed);

        let listing = registry.list(JobFilter::state(JobState::Failed));
        assert_eq!(listing.iter().count(), 1);
        assert_eq!(listing.iter().count(), 1);
        assert_eq!((&listing).into_iter().next().unwrap().id, a);

        // snapshot is unaffected by later writes
        registry.create(draft(), Capacity::unbounded()).unwrap();
        assert_eq!(registry.list(JobFilter::default()).iter().count(), 3);
        assert_eq!(listing.iter().count(), 1);
    }

    #[test]
    fn listing_filters_by_chat() {
        let registry = Registry::new(10);
        let mut mine = draft();
        mine.request.requested_by = Some(7);
        registry.create(mine, Capacity::unbounded()).unwrap();
        registry.create(draft(), Capacity::unbounded()).unwrap();
        let filter = JobFilter {
            state: None,
            requested_by: Some(7),
        };
        assert_eq!(registry.list(filter).iter().count(), 1);
    }

    #[test]
    fn sliding_window_keeps_last_outcomes() {
        let registry = Registry::new(3);
        for state in [JobState::Failed, JobState::Failed, JobState::Completed, JobState::Cancelled] {
            let id = registry.create(draft(), Capacity::unbounded()).unwrap().id;
            finish(&registry, id, state);
        }
        let snapshot = registry.health_snapshot().unwrap();
        assert_eq!(snapshot.window_len, 3);
        assert_eq!(snapshot.window_failed, 1);
        assert!((snapshot.failure_ratio() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn health_snapshot_does_not_block_on_writer() {
        let registry = Registry::new(3);
        let guard = registry.inner.write().unwrap();
        assert!(registry.health_snapshot().is_none());
        drop(guard);
        assert!(registry.health_snapshot().is_some());
    }

    #[test]
    fn eviction_skips_active_and_recent_jobs() {
        let registry = Registry::new(10);
        let done = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        let active = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        finish(&registry, done, JobState::Completed);

        assert!(registry
            .evict_finished(Utc::now(), Duration::from_secs(3600))
            .is_empty());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(registry.evict_finished(later, Duration::from_secs(3600)), vec![done]);
        assert!(registry.get(active).is_some());
        assert!(registry.get(done).is_none());
    }

    #[tokio::test]
    async fn events_follow_transition_order() {
        let registry = Registry::new(10);
        let mut rx = registry.subscribe();
        let id = registry.create(draft(), Capacity::unbounded()).unwrap().id;
        finish(&registry, id, JobState::Completed);

        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(rx.recv().await.unwrap().job.state);
        }
        assert_eq!(
            states,
            vec![JobState::Pending, JobState::Running, JobState::Completed]
        );
    }
}
