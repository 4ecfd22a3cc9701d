//! Job record store
//!
//! Records are the persisted view of every job. The pool is the only writer;
//! each update is a read-modify-write of one record that enforces the job
//! state machine. Two backends: in-memory, and one JSON file per job in a
//! state directory.

use crate::job::JobState;
use crate::monitor::ProcessUsage;
use crate::throttle::ThrottleReason;
use crate::transcode::QueueItem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error type for record store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    /// The patch asked for a transition the state machine forbids
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted state of one encoding job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Unique job identifier (UUID)
    pub id: String,
    /// What to transcode
    pub item: QueueItem,
    /// Higher runs first
    pub priority: i32,
    pub state: JobState,
    /// Percent complete, 0-100, never decreases
    pub progress: f32,
    /// Unix timestamps (milliseconds)
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Transcoder PID; present only while the job holds a process
    pub pid: Option<u32>,
    /// Most recent per-process usage sample
    pub last_usage: Option<ProcessUsage>,
    /// Resource currently holding the job paused, `none` when not throttled
    pub throttle_reason: ThrottleReason,
    /// Held by a schedule or operator pause
    pub admin_paused: bool,
    /// Why the job failed or was cancelled
    pub error_reason: Option<String>,
}

impl JobRecord {
    /// A fresh queued record
    pub fn new(item: QueueItem, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item,
            priority,
            state: JobState::Queued,
            progress: 0.0,
            queued_at: current_timestamp_ms(),
            started_at: None,
            finished_at: None,
            pid: None,
            last_usage: None,
            throttle_reason: ThrottleReason::None,
            admin_paused: false,
            error_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a partial update
    ///
    /// State changes must be legal transitions; re-asserting the current
    /// state is a no-op. Entering a terminal state stamps `finished_at` and
    /// drops the PID, and `completed` pins progress to 100.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<(), StoreError> {
        if let Some(next) = patch.state {
            if next != self.state {
                if !self.state.can_transition_to(next) {
                    return Err(StoreError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.state,
                        to: next,
                    });
                }
                self.state = next;
                let now = current_timestamp_ms();
                if next == JobState::Starting {
                    self.started_at.get_or_insert(now);
                }
                if next.is_terminal() {
                    self.finished_at = Some(now);
                }
            }
        }

        if let Some(progress) = patch.progress {
            let progress = progress.clamp(0.0, 100.0);
            if progress > self.progress {
                self.progress = progress;
            }
        }
        if let Some(pid) = patch.pid {
            self.pid = Some(pid);
        }
        if let Some(usage) = patch.last_usage {
            self.last_usage = Some(usage);
        }
        if let Some(reason) = patch.throttle_reason {
            self.throttle_reason = reason;
        }
        if let Some(admin_paused) = patch.admin_paused {
            self.admin_paused = admin_paused;
        }
        if let Some(reason) = &patch.error_reason {
            self.error_reason = Some(reason.clone());
        }

        if self.state.is_terminal() {
            self.pid = None;
            self.throttle_reason = ThrottleReason::None;
            self.admin_paused = false;
        }
        if self.state == JobState::Completed {
            self.progress = 100.0;
        }

        Ok(())
    }
}

/// Partial update of a [`JobRecord`]; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub progress: Option<f32>,
    pub pid: Option<u32>,
    pub last_usage: Option<ProcessUsage>,
    pub throttle_reason: Option<ThrottleReason>,
    pub admin_paused: Option<bool>,
    pub error_reason: Option<String>,
}

impl JobPatch {
    /// Patch that only changes state
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// Patch that moves the job to a terminal failure state with a reason
    pub fn finished(state: JobState, reason: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            error_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_usage(mut self, usage: ProcessUsage) -> Self {
        self.last_usage = Some(usage);
        self
    }

    pub fn with_throttle_reason(mut self, reason: ThrottleReason) -> Self {
        self.throttle_reason = Some(reason);
        self
    }

    pub fn with_admin_paused(mut self, admin_paused: bool) -> Self {
        self.admin_paused = Some(admin_paused);
        self
    }
}

/// Selection for [`JobStore::list_jobs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    NonTerminal,
    InState(JobState),
}

impl JobFilter {
    pub fn matches(&self, record: &JobRecord) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::NonTerminal => !record.is_terminal(),
            JobFilter::InState(state) => record.state == *state,
        }
    }
}

/// Durable record store with get/update-by-id semantics
pub trait JobStore: Send + Sync {
    /// Insert a new record
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, StoreError>;

    /// Apply a patch to one record and return the updated record
    fn update_job(&self, id: &str, patch: &JobPatch) -> Result<JobRecord, StoreError>;

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Matching records ordered by `queued_at`
    fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StoreError>;
}

pub type SharedStore = Arc<dyn JobStore>;

fn sort_records(records: &mut [JobRecord]) {
    records.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
}

/// Record store held in process memory
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn update_job(&self, id: &str, patch: &JobPatch) -> Result<JobRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Apply to a copy so a rejected patch leaves the record untouched
        let mut updated = record.clone();
        updated.apply(patch)?;
        *record = updated.clone();
        Ok(updated)
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(id).cloned())
    }

    fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<JobRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut matching);
        Ok(matching)
    }
}

/// Record store keeping one `{id}.json` file per job in a state directory
#[derive(Debug)]
pub struct FileJobStore {
    state_dir: PathBuf,
    // Serialises read-modify-write cycles across callers
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Open (creating if needed) a state directory
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    /// Write through a temp file and rename so readers never see a partial record
    fn write_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp_path = self.state_dir.join(format!(".{}.json.tmp", record.id));
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, self.record_path(&record.id))?;
        Ok(())
    }

    fn read_record(path: &Path) -> Result<JobRecord, StoreError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl JobStore for FileJobStore {
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.record_path(&record.id).exists() {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.write_record(&record)?;
        Ok(record)
    }

    fn update_job(&self, id: &str, patch: &JobPatch) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(id);
        let mut record = match Self::read_record(&path) {
            Ok(record) => record,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e),
        };
        record.apply(patch)?;
        self.write_record(&record)?;
        Ok(record)
    }

    fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        match Self::read_record(&self.record_path(id)) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();

            // Only .json files; temp files end in .tmp
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match Self::read_record(&path) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }

        sort_records(&mut records);
        Ok(records)
    }
}

/// Current timestamp in milliseconds since the Unix epoch
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
