//! Orchestrator facade
//!
//! Wires monitor, throttler, record store, pool and scheduler together and
//! exposes the operations an API layer needs: snapshots, threshold and
//! schedule settings, manual start/stop, and queue management. Owns the
//! background tasks behind a broadcast shutdown channel.

use crate::config::{Config, ConfigError, ScheduleConfig, ThresholdConfig, ValidationError};
use crate::job::{JobContext, MonitorTiming};
use crate::monitor::{
    sample_with_timeout, ResourceSnapshot, SampleError, SharedSampler, SystemMonitor,
};
use crate::pool::{EncoderPool, PoolError, PoolStatus};
use crate::scheduler::{Scheduler, SharedSchedule};
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{bind_status_listener, run_status_server, ServerError};
use crate::store::{FileJobStore, JobRecord, MemoryJobStore, SharedStore, StoreError};
use crate::throttle::{
    platform_control, ProcessControl, ResourceThrottler, SharedThresholds, ThrottleDecision,
};
use crate::transcode::QueueItem;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Error type for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid settings: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Sampling failed: {0}")]
    Sample(#[from] SampleError),

    #[error("Status server error: {0}")]
    Server(#[from] ServerError),
}

/// Schedule settings plus what they currently mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub config: ScheduleConfig,
    pub within_schedule: bool,
    pub manual_override: bool,
}

struct OrchestratorInner {
    config: Config,
    sampler: SharedSampler,
    thresholds: SharedThresholds,
    schedule: SharedSchedule,
    sample_timeout: Duration,
    pool: EncoderPool,
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Resource-aware encoding orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Run startup checks, then build the orchestrator
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Build the orchestrator without startup checks
    ///
    /// Useful for testing when the transcoder is not installed.
    pub fn new_without_checks(config: Config) -> Result<Self, OrchestratorError> {
        let store: SharedStore = match &config.pool.state_dir {
            Some(dir) => Arc::new(FileJobStore::open(dir)?),
            None => Arc::new(MemoryJobStore::new()),
        };
        Self::with_components(
            config,
            Arc::new(SystemMonitor::new()),
            platform_control(),
            store,
        )
    }

    /// Build from explicit components and restore the queue from `store`
    pub fn with_components(
        config: Config,
        sampler: SharedSampler,
        control: Arc<dyn ProcessControl>,
        store: SharedStore,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let thresholds: SharedThresholds = Arc::new(RwLock::new(config.resources.clone()));
        let schedule: SharedSchedule = Arc::new(RwLock::new(config.schedule.clone()));
        let timing = MonitorTiming::from_config(&config.timing);

        let ctx = JobContext {
            sampler: sampler.clone(),
            throttler: Arc::new(ResourceThrottler::new(control)),
            thresholds: thresholds.clone(),
            timing,
        };
        let pool = EncoderPool::new(
            store,
            ctx,
            config.transcoder.clone(),
            &config.pool,
            Duration::from_secs(config.timing.admission_interval_secs),
        );
        let restored = pool.restore()?;
        if restored > 0 {
            info!(restored, "Restored queued jobs");
        }

        let scheduler = Arc::new(Scheduler::new(
            schedule.clone(),
            pool.clone(),
            Duration::from_secs(config.timing.schedule_tick_secs),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                sample_timeout: timing.sample_timeout,
                config,
                sampler,
                thresholds,
                schedule,
                pool,
                scheduler,
                shutdown_tx,
            }),
        })
    }

    /// Configuration the orchestrator was started with
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pool(&self) -> &EncoderPool {
        &self.inner.pool
    }

    /// Current host resource snapshot
    pub async fn get_current_snapshot(&self) -> Result<ResourceSnapshot, OrchestratorError> {
        Ok(sample_with_timeout(self.inner.sampler.clone(), self.inner.sample_timeout).await?)
    }

    /// Evaluate the current snapshot against `config`, or the live settings when `None`
    pub async fn check_thresholds(
        &self,
        config: Option<ThresholdConfig>,
    ) -> Result<ThrottleDecision, OrchestratorError> {
        let config = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => self.inner.thresholds.read().await.clone(),
        };
        let snapshot = self.get_current_snapshot().await?;
        Ok(self
            .inner
            .pool
            .context()
            .throttler
            .evaluate(&snapshot, &config))
    }

    pub async fn get_resource_settings(&self) -> ThresholdConfig {
        self.inner.thresholds.read().await.clone()
    }

    /// Replace the threshold settings
    ///
    /// Running jobs pick up new thresholds on their next tick; the nice level
    /// applies to jobs started afterwards. Invalid settings are rejected and
    /// the previous ones kept.
    pub async fn update_resource_settings(
        &self,
        settings: ThresholdConfig,
    ) -> Result<ThresholdConfig, OrchestratorError> {
        settings.validate()?;
        *self.inner.thresholds.write().await = settings.clone();
        info!(
            cpu = settings.cpu_threshold,
            memory = settings.memory_threshold,
            gpu = settings.gpu_threshold,
            nice = settings.nice_level,
            enabled = settings.enable_throttling,
            "Resource settings updated"
        );
        Ok(settings)
    }

    pub async fn get_schedule(&self) -> ScheduleStatus {
        let config = self.inner.schedule.read().await.clone();
        ScheduleStatus {
            manual_override: config.manual_override,
            within_schedule: self.inner.scheduler.within_window().await,
            config,
        }
    }

    /// Replace the schedule and re-evaluate the pool mode immediately
    ///
    /// The manual override is not part of the update; it keeps its current
    /// value. Invalid schedules are rejected and the previous one kept.
    pub async fn update_schedule(
        &self,
        mut config: ScheduleConfig,
    ) -> Result<ScheduleStatus, OrchestratorError> {
        {
            let mut current = self.inner.schedule.write().await;
            config.manual_override = current.manual_override;
            if let Err(e) = config.validate() {
                warn!(error = %e, "Rejected schedule update");
                return Err(e.into());
            }
            *current = config;
        }
        info!("Schedule updated");
        self.inner.scheduler.evaluate().await;
        Ok(self.get_schedule().await)
    }

    /// Set the manual override so the pool runs outside the window
    pub async fn start_now(&self) -> ScheduleStatus {
        self.set_manual_override(true).await
    }

    /// Clear the manual override; the window decides again
    pub async fn stop_now(&self) -> ScheduleStatus {
        self.set_manual_override(false).await
    }

    async fn set_manual_override(&self, value: bool) -> ScheduleStatus {
        {
            let mut schedule = self.inner.schedule.write().await;
            if !schedule.enabled {
                info!(manual_override = value, "Schedule disabled; override has no effect");
            }
            schedule.manual_override = value;
        }
        self.inner.scheduler.evaluate().await;
        self.get_schedule().await
    }

    /// Queue item for `source` with an output path derived from the transcoder settings
    pub fn queue_item(&self, source: impl Into<PathBuf>, profile: &str) -> QueueItem {
        QueueItem::for_source(source, profile, &self.inner.config.transcoder)
    }

    pub fn enqueue(&self, item: QueueItem, priority: i32) -> Result<JobRecord, OrchestratorError> {
        Ok(self.inner.pool.enqueue(item, priority)?)
    }

    pub fn cancel(&self, job_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.inner.pool.cancel(job_id)?)
    }

    /// Active jobs first, then queued jobs in admission order
    pub fn list_queue(&self) -> Result<Vec<JobRecord>, OrchestratorError> {
        Ok(self.inner.pool.list_queue()?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, OrchestratorError> {
        Ok(self.inner.pool.store().get_job(job_id)?)
    }

    /// Administrative pause of admission and every active job
    pub fn pause_all(&self) {
        self.inner.pool.pause_all();
    }

    pub fn resume_all(&self) {
        self.inner.pool.resume_all();
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// Ask [`Orchestrator::run`] to stop
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
    }

    /// Run the pool, scheduler and status server until Ctrl-C or [`Orchestrator::shutdown`]
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        let listener = if self.inner.config.status.enabled {
            Some(bind_status_listener(&self.inner.config.status.bind).await?)
        } else {
            None
        };

        let mut stop = self.inner.shutdown_tx.subscribe();

        let pool = self.inner.pool.clone();
        let pool_shutdown = self.inner.shutdown_tx.subscribe();
        let pool_task = tokio::spawn(async move { pool.run(pool_shutdown).await });

        // Apply the schedule before the first admission tick matters
        self.inner.scheduler.evaluate().await;
        let scheduler = self.inner.scheduler.clone();
        let scheduler_shutdown = self.inner.shutdown_tx.subscribe();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let server_task = listener.map(|listener| {
            let orchestrator = self.clone();
            let server_shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = run_status_server(listener, orchestrator, server_shutdown).await {
                    warn!(error = %e, "Status server stopped");
                }
            })
        });

        info!("Orchestrator running");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
                self.shutdown();
            }
            _ = stop.recv() => {}
        }

        let tasks = [
            ("pool", Some(pool_task)),
            ("scheduler", Some(scheduler_task)),
            ("status server", server_task),
        ];
        for (name, task) in tasks {
            let Some(task) = task else { continue };
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }
}
