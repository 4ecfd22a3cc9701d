//! Encoding job supervision
//!
//! Each admitted job runs as one tokio task that owns the transcoder child
//! process. The task reads progress from the child's stdout, samples the
//! process and the host on a fixed interval, stops or continues the process
//! group as thresholds and administrative pauses require, and reports every
//! change to the pool as a [`JobEvent`]. The task never writes the store
//! itself and never touches another job's process.

use crate::config::TimingConfig;
use crate::monitor::{sample_process_with_timeout, sample_with_timeout, SampleError, SharedSampler};
use crate::store::{JobPatch, JobRecord};
use crate::throttle::{
    ResourceThrottler, SharedThresholds, SignalError, SignalOutcome, ThrottleReason,
};
use crate::transcode::{ProgressTracker, TranscodeError};
use serde::{Deserialize, Serialize};
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reason recorded on jobs stopped by a daemon shutdown or left active by a previous run
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Lifecycle state of an encoding job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Starting,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Processing => "processing",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// States in which the job owns an OS process and a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Processing | JobState::Paused
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Queued, Starting)
                | (Starting, Processing)
                | (Starting, Failed)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Paused, Processing)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intervals used by a job's monitor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    /// Sampling and evaluation tick
    pub interval: Duration,
    /// Upper bound for one resource sample
    pub sample_timeout: Duration,
    /// Wait after terminate before a forced kill
    pub cancel_grace: Duration,
    /// Minimum time between two throttle flips; zero disables
    pub min_dwell: Duration,
}

impl MonitorTiming {
    pub fn from_config(timing: &TimingConfig) -> Self {
        Self {
            interval: Duration::from_secs(timing.monitor_interval_secs),
            sample_timeout: Duration::from_millis(timing.sample_timeout_ms),
            cancel_grace: Duration::from_secs(timing.cancel_grace_secs),
            min_dwell: Duration::from_secs(timing.min_dwell_secs),
        }
    }
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}

/// Everything a job needs from its surroundings
#[derive(Clone)]
pub struct JobContext {
    pub sampler: SharedSampler,
    pub throttler: Arc<ResourceThrottler>,
    pub thresholds: SharedThresholds,
    pub timing: MonitorTiming,
}

/// Messages the pool sends to a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    /// Explicit user cancellation; the job ends `cancelled`
    Cancel,
    /// Daemon shutdown; the job ends `failed` as interrupted so it can be re-queued
    Shutdown,
    AdminPause,
    AdminResume,
}

/// An update a job reports to the pool
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub patch: JobPatch,
}

/// The pool's handle on a running job
pub struct JobHandle {
    job_id: String,
    control_tx: mpsc::UnboundedSender<JobControl>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Deliver a control message; false when the job task has ended
    pub fn send(&self, control: JobControl) -> bool {
        self.control_tx.send(control).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the supervision task; `kill_on_drop` reaps the child
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the supervision task for an admitted job
///
/// The record must already be in `starting`. The task spawns `command`,
/// reports `processing` (or `failed` when the spawn fails) and supervises the
/// child until it reaches a terminal state.
pub fn spawn_job(
    record: &JobRecord,
    command: Command,
    ctx: JobContext,
    events: mpsc::UnboundedSender<JobEvent>,
) -> JobHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let job = EncodingJob {
        id: record.id.clone(),
        ctx,
        events,
        progress: ProgressTracker::new(record.item.duration_secs),
        state: JobState::Starting,
        admin_paused: false,
        throttle_paused: false,
        throttle_reason: ThrottleReason::None,
        stopped: false,
        last_flip: None,
    };
    let task = tokio::spawn(job.run(command, control_rx));

    JobHandle {
        job_id: record.id.clone(),
        control_tx,
        task,
    }
}

/// How the supervised child ended
enum Exit {
    Exited(io::Result<ExitStatus>),
    /// Stopped on request; carries the exit status when one was observed
    Stopped {
        control: JobControl,
        status: Option<ExitStatus>,
    },
}

struct EncodingJob {
    id: String,
    ctx: JobContext,
    events: mpsc::UnboundedSender<JobEvent>,
    progress: ProgressTracker,
    state: JobState,
    /// Held by the schedule or an operator
    admin_paused: bool,
    /// Held by resource thresholds
    throttle_paused: bool,
    throttle_reason: ThrottleReason,
    /// Whether the process group is currently stopped
    stopped: bool,
    last_flip: Option<Instant>,
}

impl EncodingJob {
    async fn run(mut self, mut command: Command, mut control_rx: mpsc::UnboundedReceiver<JobControl>) {
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = TranscodeError::Spawn(e);
                warn!(job_id = %self.id, error = %error, "Transcoder failed to start");
                self.finish(JobState::Failed, Some(error.to_string()));
                return;
            }
        };

        let pid = child.id();
        let nice_level = self.ctx.thresholds.read().await.nice_level;
        if let Some(pid) = pid {
            match self.ctx.throttler.apply_priority(pid, nice_level) {
                Ok(()) => debug!(job_id = %self.id, pid, nice_level, "Priority applied"),
                Err(e) => debug!(job_id = %self.id, pid, error = %e, "Could not apply priority"),
            }
        }

        self.state = JobState::Processing;
        let mut patch = JobPatch::state(JobState::Processing);
        patch.pid = pid;
        self.emit(patch);
        info!(job_id = %self.id, pid = ?pid, "Transcoder started");

        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut ticker = tokio::time::interval(self.ctx.timing.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut control_open = true;

        let exit = loop {
            tokio::select! {
                status = child.wait() => break Exit::Exited(status),

                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Ok(Some(line)) => {
                        if let Some(percent) = self.progress.observe(&line) {
                            self.emit(JobPatch::default().with_progress(percent));
                        }
                    }
                    Ok(None) => stdout = None,
                    Err(e) => {
                        debug!(job_id = %self.id, error = %e, "Progress stream closed");
                        stdout = None;
                    }
                },

                control = control_rx.recv(), if control_open => match control {
                    Some(control @ (JobControl::Cancel | JobControl::Shutdown)) => {
                        // Already exited: record what actually happened
                        if let Ok(Some(status)) = child.try_wait() {
                            break Exit::Exited(Ok(status));
                        }
                        let status = self.stop_child(&mut child, pid).await;
                        break Exit::Stopped { control, status };
                    }
                    Some(JobControl::AdminPause) => self.set_admin_paused(true, pid),
                    Some(JobControl::AdminResume) => self.set_admin_paused(false, pid),
                    None => control_open = false,
                },

                _ = ticker.tick() => {
                    if let Some(pid) = pid {
                        self.on_tick(pid).await;
                    }
                }
            }
        };

        if let Some(pid) = pid {
            self.ctx.throttler.release(pid);
        }

        match exit {
            Exit::Exited(Ok(status)) if status.success() => {
                info!(job_id = %self.id, "Transcode completed");
                self.finish(JobState::Completed, None);
            }
            Exit::Exited(Ok(status)) => {
                let error = TranscodeError::from_status(status);
                warn!(job_id = %self.id, error = %error, "Transcode failed");
                self.finish(JobState::Failed, Some(error.to_string()));
            }
            Exit::Exited(Err(e)) => {
                warn!(job_id = %self.id, error = %e, "Lost track of transcoder");
                self.finish(
                    JobState::Failed,
                    Some(format!("Failed to wait for transcoder: {}", e)),
                );
            }
            // Output was complete and the transcoder exited cleanly on terminate
            Exit::Stopped { status: Some(status), .. }
                if status.success() && self.progress.percent() >= 100.0 =>
            {
                info!(job_id = %self.id, "Transcode completed while stopping");
                self.finish(JobState::Completed, None);
            }
            Exit::Stopped { control: JobControl::Shutdown, .. } => {
                info!(job_id = %self.id, "Transcode interrupted by shutdown");
                self.finish(JobState::Failed, Some(INTERRUPTED_REASON.to_string()));
            }
            Exit::Stopped { .. } => {
                info!(job_id = %self.id, "Transcode cancelled");
                self.finish(JobState::Cancelled, Some("cancelled".to_string()));
            }
        }
    }

    /// One monitor tick: sample, evaluate, reconcile, report
    async fn on_tick(&mut self, pid: u32) {
        let timeout = self.ctx.timing.sample_timeout;
        let mut patch = JobPatch::default();

        match sample_process_with_timeout(self.ctx.sampler.clone(), pid, timeout).await {
            Ok(usage) => patch.last_usage = Some(usage),
            Err(SampleError::ProcessNotFound(_)) => {
                // Exited between ticks; the wait branch records the outcome
                debug!(job_id = %self.id, pid, "Transcoder process no longer visible");
                return;
            }
            Err(e) => debug!(job_id = %self.id, pid, error = %e, "Process sample failed"),
        }

        let thresholds = self.ctx.thresholds.read().await.clone();
        match sample_with_timeout(self.ctx.sampler.clone(), timeout).await {
            Ok(snapshot) => {
                let decision = self.ctx.throttler.evaluate(&snapshot, &thresholds);
                if decision.exceeded != self.throttle_paused && self.dwell_elapsed() {
                    self.throttle_paused = decision.exceeded;
                    self.last_flip = Some(Instant::now());
                    if decision.exceeded {
                        info!(job_id = %self.id, reason = %decision.reason, "Resource threshold exceeded");
                    } else {
                        info!(job_id = %self.id, "Resource usage back under thresholds");
                    }
                }
                if self.throttle_paused && decision.exceeded {
                    self.throttle_reason = decision.reason;
                }
            }
            Err(e) => {
                // Keep the previous decision for this tick
                warn!(job_id = %self.id, error = %e, "Host sample failed");
            }
        }

        self.reconcile(pid, patch);
    }

    fn dwell_elapsed(&self) -> bool {
        self.last_flip
            .map_or(true, |at| at.elapsed() >= self.ctx.timing.min_dwell)
    }

    fn set_admin_paused(&mut self, paused: bool, pid: Option<u32>) {
        if self.admin_paused == paused {
            return;
        }
        self.admin_paused = paused;
        debug!(job_id = %self.id, admin_paused = paused, "Administrative pause changed");
        match pid {
            Some(pid) => self.reconcile(pid, JobPatch::default()),
            None => self.emit(JobPatch::default().with_admin_paused(paused)),
        }
    }

    /// Bring the process group in line with `admin_paused || throttle_paused`
    fn reconcile(&mut self, pid: u32, mut patch: JobPatch) {
        let want_stopped = self.admin_paused || self.throttle_paused;

        if want_stopped != self.stopped {
            let result = if want_stopped {
                self.ctx.throttler.pause(pid)
            } else {
                self.ctx.throttler.resume(pid)
            };
            match result {
                Ok(SignalOutcome::Applied) | Ok(SignalOutcome::AlreadyInState) => {
                    self.stopped = want_stopped;
                }
                // Unsupported host: keep running unthrottled
                Ok(SignalOutcome::Skipped) => {}
                Err(SignalError::ProcessNotFound(_)) => {
                    debug!(job_id = %self.id, pid, "Transcoder exited before signal");
                }
                Err(e) => warn!(job_id = %self.id, pid, error = %e, "Failed to signal transcoder"),
            }
        }

        let state = if self.stopped {
            JobState::Paused
        } else {
            JobState::Processing
        };
        if state != self.state {
            info!(job_id = %self.id, from = %self.state, to = %state, "Job state changed");
            self.state = state;
            patch.state = Some(state);
        }

        let reason = if self.throttle_paused {
            self.throttle_reason
        } else {
            ThrottleReason::None
        };
        patch.throttle_reason = Some(reason);
        patch.admin_paused = Some(self.admin_paused);
        self.emit(patch);
    }

    /// Terminate the group, continue it if stopped, then wait out the grace period
    ///
    /// Returns the exit status when the child was reaped.
    async fn stop_child(&mut self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        let throttler = self.ctx.throttler.clone();
        let mut signalled = false;

        if let Some(pid) = pid {
            match throttler.terminate(pid) {
                Ok(()) => signalled = true,
                Err(e) => debug!(job_id = %self.id, pid, error = %e, "Terminate signal failed"),
            }
            if self.stopped {
                // A stopped group cannot act on SIGTERM
                if let Err(e) = throttler.resume(pid) {
                    debug!(job_id = %self.id, pid, error = %e, "Continue before terminate failed");
                }
                self.stopped = false;
            }
        }

        if signalled {
            match tokio::time::timeout(self.ctx.timing.cancel_grace, child.wait()).await {
                Ok(status) => return status.ok(),
                Err(_) => {
                    warn!(job_id = %self.id, grace = ?self.ctx.timing.cancel_grace, "Transcoder ignored terminate; killing");
                }
            }
        }

        if let Some(pid) = pid {
            if throttler.kill(pid).is_ok() {
                return child.wait().await.ok();
            }
        }
        if let Err(e) = child.kill().await {
            debug!(job_id = %self.id, error = %e, "Forced kill failed");
        }
        None
    }

    fn finish(&mut self, state: JobState, error_reason: Option<String>) {
        self.state = state;
        let mut patch = JobPatch::state(state);
        patch.error_reason = error_reason;
        if state == JobState::Completed {
            patch.progress = Some(100.0);
        }
        self.emit(patch);
    }

    fn emit(&self, patch: JobPatch) {
        let event = JobEvent {
            job_id: self.id.clone(),
            patch,
        };
        if self.events.send(event).is_err() {
            debug!(job_id = %self.id, "Pool is gone; dropping job event");
        }
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::{JobStore, MemoryJobStore};
    use crate::testing::{
        fast_timing, shell_transcoder, test_context, ControlCall, RecordingControl,
        ScriptedSampler,
    };
    use crate::transcode::{build_transcode_command, QueueItem};

    struct Harness {
        store: MemoryJobStore,
        record: JobRecord,
        handle: JobHandle,
        events: mpsc::UnboundedReceiver<JobEvent>,
        states: Vec<JobState>,
        progress_at: Vec<(JobState, f32)>,
    }

    impl Harness {
        fn start(script: &str, duration: Option<f64>, ctx: JobContext) -> Self {
            let store = MemoryJobStore::new();
            let mut item = QueueItem::new("/in/movie.mp4", "/out/movie.mkv", "test")
                .with_profile_args(vec![script.to_string()]);
            item.duration_secs = duration;
            let record = store.create_job(JobRecord::new(item, 0)).unwrap();
            let record = store
                .update_job(&record.id, &JobPatch::state(JobState::Starting))
                .unwrap();

            let (tx, events) = mpsc::unbounded_channel();
            let command = build_transcode_command(&shell_transcoder(), &record.item);
            let handle = spawn_job(&record, command, ctx, tx);

            Self {
                store,
                record,
                handle,
                events,
                states: vec![JobState::Starting],
                progress_at: Vec::new(),
            }
        }

        /// Apply events to the store until `until` holds for the current record
        async fn pump_until(&mut self, until: impl Fn(&JobRecord) -> bool) -> JobRecord {
            let deadline = Duration::from_secs(10);
            tokio::time::timeout(deadline, async {
                loop {
                    let current = self.store.get_job(&self.record.id).unwrap().unwrap();
                    if until(&current) {
                        return current;
                    }
                    let event = self.events.recv().await.expect("job task ended early");
                    let updated = self.store.update_job(&event.job_id, &event.patch).unwrap();
                    if event.patch.state.is_some() && self.states.last() != Some(&updated.state) {
                        self.states.push(updated.state);
                        self.progress_at.push((updated.state, updated.progress));
                    }
                }
            })
            .await
            .expect("job did not reach expected state in time")
        }

        async fn finish(&mut self) -> JobRecord {
            self.pump_until(|r| r.is_terminal()).await
        }
    }

    #[test]
    fn test_transition_table() {
        use JobState::*;

        assert!(Queued.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Processing));
        assert!(Paused.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Processing));
        assert!(!Starting.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        for state in [Queued, Starting, Processing, Paused] {
            assert!(state.can_transition_to(Cancelled));
        }
        for state in [Completed, Failed, Cancelled] {
            assert!(!state.can_transition_to(Cancelled));
            assert!(state.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_successful_run_reports_progress_and_completes() {
        let control = Arc::new(RecordingControl::new());
        let ctx = test_context(ScriptedSampler::idle(), control.clone(), fast_timing());
        let mut h = Harness::start(
            "echo out_time_us=1000000; echo progress=continue; sleep 0.2; echo progress=end",
            Some(2.0),
            ctx,
        );

        let mid = h.pump_until(|r| r.progress >= 50.0).await;
        assert!(mid.pid.is_some());

        let done = h.finish().await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.pid.is_none());
        assert!(done.finished_at.is_some());
        assert_eq!(h.states[..3], [JobState::Starting, JobState::Processing, JobState::Completed]);

        let pid = mid.pid.unwrap();
        assert_eq!(control.calls()[0], ControlCall::Priority(pid, 10));
        assert!(h.handle.job_id() == h.record.id);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_job() {
        let ctx = test_context(ScriptedSampler::idle(), Arc::new(RecordingControl::new()), fast_timing());
        let mut h = Harness::start("exit 3", None, ctx);

        let done = h.finish().await;
        assert_eq!(done.state, JobState::Failed);
        assert!(done.error_reason.unwrap().contains('3'));
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_from_starting() {
        let ctx = test_context(ScriptedSampler::idle(), Arc::new(RecordingControl::new()), fast_timing());
        let store = MemoryJobStore::new();
        let record = store
            .create_job(JobRecord::new(QueueItem::new("a", "b", "p"), 0))
            .unwrap();
        store
            .update_job(&record.id, &JobPatch::state(JobState::Starting))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = Command::new("/nonexistent/transcoder-binary");
        let _handle = spawn_job(&record, command, ctx, tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.patch.state, Some(JobState::Failed));
        let failed = store.update_job(&record.id, &event.patch).unwrap();
        assert!(failed.error_reason.unwrap().contains("spawn"));
    }

    #[tokio::test]
    async fn test_throttle_pause_then_resume_trace() {
        let control = Arc::new(RecordingControl::real());
        let sampler = ScriptedSampler::cpu(&[10.0, 95.0, 95.0, 10.0]);
        let ctx = test_context(sampler, control.clone(), fast_timing());
        let mut h = Harness::start(
            "echo out_time_us=500000; sleep 0.6; echo out_time_us=1500000; echo progress=end",
            Some(2.0),
            ctx,
        );

        let paused = h.pump_until(|r| r.state == JobState::Paused).await;
        assert_eq!(paused.throttle_reason, ThrottleReason::Cpu);
        let progress_before = paused.progress;

        let resumed = h.pump_until(|r| r.state == JobState::Processing).await;
        assert_eq!(resumed.throttle_reason, ThrottleReason::None);
        assert!(resumed.progress >= progress_before);

        let done = h.finish().await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(
            h.states,
            vec![
                JobState::Starting,
                JobState::Processing,
                JobState::Paused,
                JobState::Processing,
                JobState::Completed,
            ]
        );
        let progress: Vec<f32> = h.progress_at.iter().map(|(_, p)| *p).collect();
        assert!(progress.windows(2).all(|w| w[1] >= w[0]));

        let pid = paused.pid.unwrap();
        let calls = control.calls();
        assert_eq!(calls.iter().filter(|c| **c == ControlCall::Stop(pid)).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == ControlCall::Cont(pid)).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_host_sample_holds_previous_decision() {
        let control = Arc::new(RecordingControl::real());
        let sampler = ScriptedSampler::script(vec![Some(95.0), None]);
        let ctx = test_context(sampler, control.clone(), fast_timing());
        let mut h = Harness::start("sleep 30", None, ctx);

        h.pump_until(|r| r.state == JobState::Paused).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = h.events.try_recv() {
            let updated = h.store.update_job(&event.job_id, &event.patch).unwrap();
            assert_eq!(updated.state, JobState::Paused);
        }

        assert!(h.handle.send(JobControl::Cancel));
        let done = h.finish().await;
        assert_eq!(done.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_timed_out_host_sample_holds_previous_decision() {
        let control = Arc::new(RecordingControl::real());
        // First host sample says busy; later ones would say idle but never arrive in time
        let sampler =
            ScriptedSampler::cpu(&[95.0, 5.0]).slow_after(1, Duration::from_millis(400));
        let timing = MonitorTiming {
            sample_timeout: Duration::from_millis(100),
            ..fast_timing()
        };
        let ctx = test_context(sampler, control.clone(), timing);
        let mut h = Harness::start("sleep 30", None, ctx);

        let paused = h.pump_until(|r| r.state == JobState::Paused).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(event) = h.events.try_recv() {
            let updated = h.store.update_job(&event.job_id, &event.patch).unwrap();
            assert_eq!(updated.state, JobState::Paused);
        }
        assert!(!control.calls().contains(&ControlCall::Cont(paused.pid.unwrap())));

        h.handle.send(JobControl::Cancel);
        assert_eq!(h.finish().await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_vanished_process_keeps_loop_alive() {
        let control = Arc::new(RecordingControl::new());
        let sampler = ScriptedSampler::cpu(&[95.0]).process_gone();
        let ctx = test_context(sampler, control.clone(), fast_timing());
        let mut h = Harness::start("sleep 0.4; echo progress=end", None, ctx);

        let done = h.finish().await;
        assert_eq!(done.state, JobState::Completed);
        assert!(done.last_usage.is_none());
        assert!(!h.states.contains(&JobState::Paused));
        assert!(!control
            .calls()
            .iter()
            .any(|c| matches!(c, ControlCall::Stop(_))));
    }

    #[tokio::test]
    async fn test_shutdown_records_interrupted_failure() {
        let control = Arc::new(RecordingControl::real());
        let ctx = test_context(ScriptedSampler::idle(), control.clone(), fast_timing());
        let mut h = Harness::start("sleep 30", None, ctx);

        let running = h.pump_until(|r| r.state == JobState::Processing).await;
        h.handle.send(JobControl::Shutdown);
        let done = h.finish().await;
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.error_reason.as_deref(), Some(INTERRUPTED_REASON));
        assert!(control.calls().contains(&ControlCall::Terminate(running.pid.unwrap())));
    }

    #[tokio::test]
    async fn test_finished_output_on_cancel_records_completed() {
        let control = Arc::new(RecordingControl::real());
        let ctx = test_context(ScriptedSampler::idle(), control, fast_timing());
        // Output is done; the process only lingers until asked to leave
        let mut h = Harness::start(
            "echo progress=end; trap 'exit 0' TERM; while true; do sleep 0.05; done",
            None,
            ctx,
        );

        h.pump_until(|r| r.progress >= 100.0).await;
        h.handle.send(JobControl::Cancel);
        let done = h.finish().await;
        assert_eq!(done.state, JobState::Completed);
        assert!(done.error_reason.is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_finished_output_stays_cancelled() {
        let ctx = test_context(
            ScriptedSampler::idle(),
            Arc::new(RecordingControl::real()),
            fast_timing(),
        );
        let mut h = Harness::start(
            "trap 'exit 0' TERM; while true; do sleep 0.05; done",
            None,
            ctx,
        );

        h.pump_until(|r| r.state == JobState::Processing).await;
        h.handle.send(JobControl::Cancel);
        assert_eq!(h.finish().await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_min_dwell_suppresses_quick_resume() {
        let control = Arc::new(RecordingControl::real());
        let sampler = ScriptedSampler::cpu(&[95.0, 10.0]);
        let timing = MonitorTiming {
            min_dwell: Duration::from_secs(60),
            ..fast_timing()
        };
        let ctx = test_context(sampler, control.clone(), timing);
        let mut h = Harness::start("sleep 30", None, ctx);

        let paused = h.pump_until(|r| r.state == JobState::Paused).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let pid = paused.pid.unwrap();
        assert!(!control.calls().contains(&ControlCall::Cont(pid)));

        h.handle.send(JobControl::Cancel);
        assert_eq!(h.finish().await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_admin_resume_does_not_override_throttle() {
        let control = Arc::new(RecordingControl::real());
        let ctx = test_context(ScriptedSampler::cpu(&[95.0]), control, fast_timing());
        let mut h = Harness::start("sleep 30", None, ctx);

        h.pump_until(|r| r.state == JobState::Paused).await;
        h.handle.send(JobControl::AdminPause);
        h.pump_until(|r| r.admin_paused).await;
        h.handle.send(JobControl::AdminResume);
        let record = h.pump_until(|r| !r.admin_paused).await;
        assert_eq!(record.state, JobState::Paused);
        assert_eq!(record.throttle_reason, ThrottleReason::Cpu);

        h.handle.send(JobControl::Cancel);
        assert_eq!(h.finish().await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_admin_pause_and_resume() {
        let control = Arc::new(RecordingControl::real());
        let ctx = test_context(ScriptedSampler::idle(), control, fast_timing());
        let mut h = Harness::start("sleep 30", None, ctx);

        h.pump_until(|r| r.state == JobState::Processing).await;
        h.handle.send(JobControl::AdminPause);
        let paused = h.pump_until(|r| r.state == JobState::Paused).await;
        assert!(paused.admin_paused);
        assert_eq!(paused.throttle_reason, ThrottleReason::None);

        h.handle.send(JobControl::AdminResume);
        h.pump_until(|r| r.state == JobState::Processing).await;

        h.handle.send(JobControl::Cancel);
        assert_eq!(h.finish().await.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_paused_continues_then_terminates() {
        let control = Arc::new(RecordingControl::real());
        let ctx = test_context(ScriptedSampler::idle(), control.clone(), fast_timing());
        let mut h = Harness::start("sleep 30", None, ctx);

        h.pump_until(|r| r.state == JobState::Processing).await;
        h.handle.send(JobControl::AdminPause);
        let paused = h.pump_until(|r| r.state == JobState::Paused).await;
        let pid = paused.pid.unwrap();

        h.handle.send(JobControl::Cancel);
        let done = h.finish().await;
        assert_eq!(done.state, JobState::Cancelled);
        assert!(done.pid.is_none());

        let calls = control.calls();
        let terminate = calls.iter().position(|c| *c == ControlCall::Terminate(pid)).unwrap();
        let cont = calls.iter().rposition(|c| *c == ControlCall::Cont(pid)).unwrap();
        assert!(cont > terminate);
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill_after_grace() {
        let control = Arc::new(RecordingControl::real());
        let timing = MonitorTiming {
            cancel_grace: Duration::from_millis(200),
            ..fast_timing()
        };
        let ctx = test_context(ScriptedSampler::idle(), control.clone(), timing);
        let mut h = Harness::start("trap '' TERM; while true; do sleep 0.05; done", None, ctx);

        let running = h.pump_until(|r| r.state == JobState::Processing).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.handle.send(JobControl::Cancel);
        let done = h.finish().await;
        assert_eq!(done.state, JobState::Cancelled);
        assert!(control.calls().contains(&ControlCall::Kill(running.pid.unwrap())));
    }

    #[tokio::test]
    async fn test_unsupported_signals_run_unthrottled() {
        let control = Arc::new(RecordingControl::unsupported());
        let ctx = test_context(ScriptedSampler::cpu(&[95.0]), control, fast_timing());
        let throttler = ctx.throttler.clone();
        let mut h = Harness::start("sleep 0.3", None, ctx);

        let done = h.finish().await;
        assert_eq!(done.state, JobState::Completed);
        assert!(!h.states.contains(&JobState::Paused));
        assert!(!throttler.pause_supported());
    }
}
