//! Transcode Orchestrator
//!
//! Background service that queues transcoding jobs, runs them under a
//! concurrency limit and a time-of-day schedule, and pauses them while the
//! host is busy.

pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod startup;
pub mod status_server;
pub mod store;
pub mod throttle;
pub mod transcode;

#[cfg(test)]
mod testing;

pub use transcode_orchestrator_config as config;
pub use transcode_orchestrator_config::Config;
pub use job::{JobContext, JobControl, JobEvent, JobHandle, JobState, MonitorTiming};
pub use monitor::{
    GpuMetrics, MemoryMetrics, ProcessUsage, ResourceSampler, ResourceSnapshot, SampleError,
    SharedSampler, SystemMonitor,
};
pub use orchestrator::{Orchestrator, OrchestratorError, ScheduleStatus};
pub use pool::{EncoderPool, PoolError, PoolMode, PoolStatus};
pub use scheduler::{desired_mode, ScheduleWindow, Scheduler};
pub use startup::{check_transcoder_available, run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError, StatusReport};
pub use store::{FileJobStore, JobFilter, JobPatch, JobRecord, JobStore, MemoryJobStore, StoreError};
pub use throttle::{
    ProcessControl, ResourceThrottler, SignalError, ThrottleDecision, ThrottleReason,
};
pub use transcode::{QueueItem, TranscodeError};
