//! Encoder pool
//!
//! Single authority over which jobs run. Holds the ordered queue, admits the
//! next eligible job while fewer than `max_concurrent_jobs` are active, relays
//! control messages to running jobs and applies their events to the record
//! store. Nothing else writes job records.

use crate::config::{PoolConfig, TranscoderConfig};
use crate::job::{
    spawn_job, JobContext, JobControl, JobEvent, JobHandle, JobState, INTERRUPTED_REASON,
};
use crate::monitor::sample_with_timeout;
use crate::store::{JobFilter, JobPatch, JobRecord, SharedStore, StoreError};
use crate::transcode::{build_transcode_command, QueueItem};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} already finished ({state})")]
    AlreadyFinished { id: String, state: JobState },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Whether the pool may admit and continue jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Running,
    Stopped,
}

/// Point-in-time summary of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub mode: PoolMode,
    /// Administrative hold from `pause_all`
    pub held: bool,
    pub concurrency_limit: usize,
    pub active: usize,
    pub queued: usize,
    pub pause_supported: bool,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: String,
    priority: i32,
    queued_at: i64,
    seq: u64,
}

impl QueueEntry {
    /// Admission order: higher priority, then earlier `queued_at`
    fn admission_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.queued_at.cmp(&other.queued_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct PoolState {
    queue: Vec<QueueEntry>,
    active: HashMap<String, JobHandle>,
    mode: PoolMode,
    held: bool,
    next_seq: u64,
}

impl PoolState {
    fn admin_paused(&self) -> bool {
        self.mode == PoolMode::Stopped || self.held
    }

    fn push(&mut self, record: &JobRecord) {
        let entry = QueueEntry {
            id: record.id.clone(),
            priority: record.priority,
            queued_at: record.queued_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let at = self
            .queue
            .partition_point(|e| e.admission_cmp(&entry) != Ordering::Greater);
        self.queue.insert(at, entry);
    }

    fn broadcast(&self, control: JobControl) {
        for handle in self.active.values() {
            if !handle.send(control) {
                debug!(job_id = %handle.job_id(), "Job task already ended");
            }
        }
    }
}

struct PoolInner {
    store: SharedStore,
    ctx: JobContext,
    transcoder: TranscoderConfig,
    limit: usize,
    admission_interval: Duration,
    state: Mutex<PoolState>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
}

/// Queue, admission and supervision of encoding jobs
#[derive(Clone)]
pub struct EncoderPool {
    inner: Arc<PoolInner>,
}

impl EncoderPool {
    /// Create a pool in `running` mode with an empty queue
    pub fn new(
        store: SharedStore,
        ctx: JobContext,
        transcoder: TranscoderConfig,
        config: &PoolConfig,
        admission_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                store,
                ctx,
                transcoder,
                limit: config.max_concurrent_jobs.max(1) as usize,
                admission_interval,
                state: Mutex::new(PoolState {
                    queue: Vec::new(),
                    active: HashMap::new(),
                    mode: PoolMode::Running,
                    held: false,
                    next_seq: 0,
                }),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn context(&self) -> &JobContext {
        &self.inner.ctx
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.limit
    }

    /// Append a new queued job; does not wait for admission
    pub fn enqueue(&self, item: QueueItem, priority: i32) -> Result<JobRecord, PoolError> {
        let record = self
            .inner
            .store
            .create_job(JobRecord::new(item, priority))?;
        self.state().push(&record);
        info!(
            job_id = %record.id,
            priority,
            source = %record.item.source_path.display(),
            "Job queued"
        );
        Ok(record)
    }

    /// Rebuild the queue from the store after a restart
    ///
    /// Queued records are re-queued as they are. Records left in an active
    /// state are marked failed and a fresh job is queued for the same item
    /// and priority, keeping its place in the queue. Returns the number of
    /// queued jobs.
    pub fn restore(&self) -> Result<usize, PoolError> {
        let mut restored = 0;

        for record in self.inner.store.list_jobs(JobFilter::NonTerminal)? {
            if record.state == JobState::Queued {
                self.state().push(&record);
                restored += 1;
                continue;
            }

            self.inner.store.update_job(
                &record.id,
                &JobPatch::finished(JobState::Failed, INTERRUPTED_REASON),
            )?;
            self.requeue_interrupted(&record)?;
            restored += 1;
        }

        Ok(restored)
    }

    /// Queue a fresh job for an interrupted one with the same item, priority and `queued_at`
    fn requeue_interrupted(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let mut fresh = JobRecord::new(record.item.clone(), record.priority);
        fresh.queued_at = record.queued_at;
        let fresh = self.inner.store.create_job(fresh)?;
        self.state().push(&fresh);
        info!(
            previous = %record.id,
            job_id = %fresh.id,
            "Re-queued interrupted job"
        );
        Ok(fresh)
    }

    /// Admit queued jobs while the pool is running and below its limit
    ///
    /// Returns the number of jobs admitted.
    pub async fn tick(&self) -> usize {
        if !self.admission_open() {
            return 0;
        }

        // Hosts without pause support only gate new admissions on thresholds
        if !self.inner.ctx.throttler.pause_supported() && self.host_over_thresholds().await {
            debug!("Host over thresholds and pause unsupported; holding admission");
            return 0;
        }

        let mut state = self.state();
        let mut admitted = 0;

        while !state.admin_paused()
            && state.active.len() < self.inner.limit
            && !state.queue.is_empty()
        {
            let entry = state.queue[0].clone();
            match self.start(&entry) {
                Ok(handle) => {
                    state.queue.remove(0);
                    state.active.insert(entry.id, handle);
                    admitted += 1;
                }
                Err(e) => {
                    // Leave it at the head and retry on the next tick
                    warn!(job_id = %entry.id, error = %e, "Failed to admit job");
                    break;
                }
            }
        }

        admitted
    }

    fn admission_open(&self) -> bool {
        let state = self.state();
        !state.admin_paused() && state.active.len() < self.inner.limit && !state.queue.is_empty()
    }

    async fn host_over_thresholds(&self) -> bool {
        let ctx = &self.inner.ctx;
        let thresholds = ctx.thresholds.read().await.clone();
        match sample_with_timeout(ctx.sampler.clone(), ctx.timing.sample_timeout).await {
            Ok(snapshot) => ctx.throttler.evaluate(&snapshot, &thresholds).exceeded,
            Err(e) => {
                debug!(error = %e, "Admission sample failed");
                false
            }
        }
    }

    fn start(&self, entry: &QueueEntry) -> Result<JobHandle, StoreError> {
        let record = self
            .inner
            .store
            .update_job(&entry.id, &JobPatch::state(JobState::Starting))?;
        let command = build_transcode_command(&self.inner.transcoder, &record.item);
        info!(job_id = %record.id, priority = record.priority, "Job admitted");
        Ok(spawn_job(
            &record,
            command,
            self.inner.ctx.clone(),
            self.inner.events_tx.clone(),
        ))
    }

    /// Apply one job event to the store and release the slot on a terminal state
    pub fn apply_event(&self, event: JobEvent) {
        let result = self.inner.store.update_job(&event.job_id, &event.patch);
        let terminal = match &result {
            Ok(record) => record.is_terminal(),
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "Failed to record job update");
                event.patch.state.is_some_and(|s| s.is_terminal())
            }
        };

        if terminal {
            let mut state = self.state();
            if state.active.remove(&event.job_id).is_some() {
                debug!(job_id = %event.job_id, active = state.active.len(), "Job slot released");
            }
        }
    }

    /// Set the schedule mode; active jobs are paused or resumed to match
    pub fn set_mode(&self, mode: PoolMode) {
        let mut state = self.state();
        if state.mode == mode {
            return;
        }
        let was_paused = state.admin_paused();
        state.mode = mode;
        info!(mode = ?mode, "Pool mode changed");
        Self::propagate(&state, was_paused);
    }

    pub fn mode(&self) -> PoolMode {
        self.state().mode
    }

    /// Administrative hold: stop admitting and pause every active job
    pub fn pause_all(&self) {
        self.set_held(true);
    }

    /// Release the administrative hold
    pub fn resume_all(&self) {
        self.set_held(false);
    }

    pub fn is_held(&self) -> bool {
        self.state().held
    }

    fn set_held(&self, held: bool) {
        let mut state = self.state();
        if state.held == held {
            return;
        }
        let was_paused = state.admin_paused();
        state.held = held;
        info!(held, "Pool hold changed");
        Self::propagate(&state, was_paused);
    }

    fn propagate(state: &PoolState, was_paused: bool) {
        match (was_paused, state.admin_paused()) {
            (false, true) => state.broadcast(JobControl::AdminPause),
            (true, false) => state.broadcast(JobControl::AdminResume),
            _ => {}
        }
    }

    /// Cancel a job
    ///
    /// Queued jobs are cancelled immediately. Active jobs are told to
    /// terminate; their record turns `cancelled` once the process is reaped.
    pub fn cancel(&self, job_id: &str) -> Result<(), PoolError> {
        let mut state = self.state();

        if let Some(pos) = state.queue.iter().position(|e| e.id == job_id) {
            state.queue.remove(pos);
            drop(state);
            self.inner.store.update_job(
                job_id,
                &JobPatch::finished(JobState::Cancelled, "cancelled"),
            )?;
            info!(job_id, "Queued job cancelled");
            return Ok(());
        }

        if let Some(handle) = state.active.get(job_id) {
            if handle.send(JobControl::Cancel) {
                info!(job_id, "Cancel requested");
                return Ok(());
            }
        }
        drop(state);

        match self.inner.store.get_job(job_id)? {
            None => Err(PoolError::NotFound(job_id.to_string())),
            Some(record) if record.is_terminal() => Err(PoolError::AlreadyFinished {
                id: record.id,
                state: record.state,
            }),
            // Active task ended but its final event is still in flight
            Some(_) => Ok(()),
        }
    }

    /// Non-terminal jobs: active ones first, then queued ones in admission order
    pub fn list_queue(&self) -> Result<Vec<JobRecord>, PoolError> {
        let (active_ids, queued_ids): (Vec<String>, Vec<String>) = {
            let state = self.state();
            (
                state.active.keys().cloned().collect(),
                state.queue.iter().map(|e| e.id.clone()).collect(),
            )
        };

        let mut active = Vec::with_capacity(active_ids.len());
        for id in &active_ids {
            match self.inner.store.get_job(id)? {
                Some(record) if !record.is_terminal() => active.push(record),
                _ => {}
            }
        }
        active.sort_by_key(|r| (r.started_at, r.queued_at));

        let mut queued = Vec::with_capacity(queued_ids.len());
        for id in &queued_ids {
            match self.inner.store.get_job(id)? {
                Some(record) if !record.is_terminal() => queued.push(record),
                _ => {}
            }
        }

        active.extend(queued);
        Ok(active)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        PoolStatus {
            mode: state.mode,
            held: state.held,
            concurrency_limit: self.inner.limit,
            active: state.active.len(),
            queued: state.queue.len(),
            pause_supported: self.inner.ctx.throttler.pause_supported(),
        }
    }

    /// Drive the pool until `shutdown` fires
    ///
    /// Applies job events, admits on every event and on the admission
    /// interval. On shutdown every active job is stopped as interrupted, the
    /// loop waits for their final events and re-queues them.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let events = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut events) = events else {
            warn!("Pool loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.inner.admission_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(limit = self.inner.limit, "Pool started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.apply_event(event);
                    self.tick().await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => break,
            }
        }

        self.drain(&mut events).await;
        info!("Pool stopped");
    }

    async fn drain(&self, events: &mut mpsc::UnboundedReceiver<JobEvent>) {
        let interrupted: Vec<String> = {
            let state = self.state();
            state.broadcast(JobControl::Shutdown);
            state.active.keys().cloned().collect()
        };
        let grace = self.inner.ctx.timing.cancel_grace + Duration::from_secs(5);

        let drained = tokio::time::timeout(grace, async {
            while !self.state().active.is_empty() {
                match events.recv().await {
                    Some(event) => self.apply_event(event),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            let state = self.state();
            warn!(remaining = state.active.len(), "Jobs still active at shutdown");
            for handle in state.active.values() {
                handle.abort();
            }
        }

        // Jobs stopped by the shutdown go back into the queue; aborted ones
        // stay non-terminal and are picked up by `restore`
        for id in &interrupted {
            let record = match self.inner.store.get_job(id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to read interrupted job");
                    continue;
                }
            };
            if record.state == JobState::Failed
                && record.error_reason.as_deref() == Some(INTERRUPTED_REASON)
            {
                if let Err(e) = self.requeue_interrupted(&record) {
                    warn!(job_id = %id, error = %e, "Failed to re-queue interrupted job");
                }
            }
        }
    }
}
