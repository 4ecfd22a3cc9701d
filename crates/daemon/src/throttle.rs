//! Resource throttler
//!
//! Turns a snapshot plus threshold configuration into a pause/resume decision
//! and applies process-level controls: scheduling priority, stop/continue and
//! terminate. Signals go to the transcoder's process group so helper
//! processes it spawned are included.

use crate::config::ThresholdConfig;
use crate::monitor::ResourceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Live threshold configuration shared by the facade and running jobs
pub type SharedThresholds = Arc<tokio::sync::RwLock<ThresholdConfig>>;

/// Which resource caused a throttle decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    Cpu,
    Memory,
    Gpu,
    None,
}

impl std::fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleReason::Cpu => write!(f, "cpu"),
            ThrottleReason::Memory => write!(f, "memory"),
            ThrottleReason::Gpu => write!(f, "gpu"),
            ThrottleReason::None => write!(f, "none"),
        }
    }
}

/// Result of evaluating a snapshot against thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDecision {
    pub exceeded: bool,
    pub reason: ThrottleReason,
}

impl ThrottleDecision {
    /// Decision that never throttles
    pub const fn clear() -> Self {
        Self {
            exceeded: false,
            reason: ThrottleReason::None,
        }
    }
}

/// Evaluate a snapshot against the threshold configuration
///
/// Exceeded when any of cpu/memory/gpu is strictly above its threshold; the
/// reason is the first exceeded resource in the order cpu, memory, gpu. A
/// snapshot without GPU metrics never exceeds on GPU.
pub fn evaluate(snapshot: &ResourceSnapshot, config: &ThresholdConfig) -> ThrottleDecision {
    if !config.enable_throttling {
        return ThrottleDecision::clear();
    }

    let reason = if snapshot.cpu_percent > config.cpu_threshold {
        ThrottleReason::Cpu
    } else if snapshot.memory.percent > config.memory_threshold {
        ThrottleReason::Memory
    } else if snapshot
        .gpu
        .as_ref()
        .is_some_and(|gpu| gpu.utilization_percent > config.gpu_threshold)
    {
        ThrottleReason::Gpu
    } else {
        return ThrottleDecision::clear();
    };

    ThrottleDecision {
        exceeded: true,
        reason,
    }
}

/// Error type for process control operations
#[derive(Debug, Error)]
pub enum SignalError {
    /// The host cannot deliver this control
    #[error("Process control is not supported on this host")]
    Unsupported,

    /// The target process no longer exists
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    /// The OS rejected the request
    #[error("Failed to control process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Platform backend for process-level controls
pub trait ProcessControl: Send + Sync {
    /// Set the scheduling priority (nice level) of the process group led by `pid`
    fn set_priority(&self, pid: u32, nice: i32) -> Result<(), SignalError>;

    /// Stop the process group led by `pid`
    fn stop(&self, pid: u32) -> Result<(), SignalError>;

    /// Continue the process group led by `pid`
    fn cont(&self, pid: u32) -> Result<(), SignalError>;

    /// Ask the process group led by `pid` to terminate
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;

    /// Forcefully kill the process group led by `pid`
    fn kill(&self, pid: u32) -> Result<(), SignalError>;
}

/// Signal-based backend for Unix hosts
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessControl;

#[cfg(unix)]
mod unix {
    use super::{ProcessControl, SignalError, UnixProcessControl};
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    fn errno_error(pid: u32, errno: Errno) -> SignalError {
        match errno {
            Errno::ESRCH => SignalError::ProcessNotFound(pid),
            Errno::ENOSYS | Errno::EINVAL => SignalError::Unsupported,
            other => SignalError::Failed {
                pid,
                reason: other.desc().to_string(),
            },
        }
    }

    fn signal_group(pid: u32, signal: Signal) -> Result<(), SignalError> {
        let target = Pid::from_raw(pid as i32);
        match killpg(target, signal) {
            Ok(()) => Ok(()),
            // Not a group leader (or the group is gone); address the PID itself
            Err(Errno::ESRCH) => kill(target, signal).map_err(|e| errno_error(pid, e)),
            Err(e) => Err(errno_error(pid, e)),
        }
    }

    fn renice(group: bool, pid: u32, nice: i32) -> Result<(), Errno> {
        let who = pid as libc::id_t;
        // SAFETY: setpriority takes plain integers and touches no memory we own
        let rc = unsafe {
            if group {
                libc::setpriority(libc::PRIO_PGRP, who, nice)
            } else {
                libc::setpriority(libc::PRIO_PROCESS, who, nice)
            }
        };
        if rc == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    impl ProcessControl for UnixProcessControl {
        fn set_priority(&self, pid: u32, nice: i32) -> Result<(), SignalError> {
            match renice(true, pid, nice) {
                // Not a group leader; renice the PID itself
                Err(Errno::ESRCH) => renice(false, pid, nice),
                other => other,
            }
            .map_err(|e| errno_error(pid, e))
        }

        fn stop(&self, pid: u32) -> Result<(), SignalError> {
            signal_group(pid, Signal::SIGSTOP)
        }

        fn cont(&self, pid: u32) -> Result<(), SignalError> {
            signal_group(pid, Signal::SIGCONT)
        }

        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            signal_group(pid, Signal::SIGTERM)
        }

        fn kill(&self, pid: u32) -> Result<(), SignalError> {
            signal_group(pid, Signal::SIGKILL)
        }
    }
}

/// Backend for hosts without stop/continue signals
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProcessControl;

impl ProcessControl for UnsupportedProcessControl {
    fn set_priority(&self, _pid: u32, _nice: i32) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    fn stop(&self, _pid: u32) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    fn cont(&self, _pid: u32) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    fn terminate(&self, _pid: u32) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    fn kill(&self, _pid: u32) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }
}

/// The process control backend for the current platform
pub fn platform_control() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessControl)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedProcessControl)
    }
}

/// What a pause/resume request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered
    Applied,
    /// The process was already in the requested state
    AlreadyInState,
    /// Pause/resume is disabled on this host
    Skipped,
}

/// Applies priority and pause/resume controls on top of a [`ProcessControl`]
///
/// Pause and resume are idempotent: the throttler remembers which PIDs it
/// stopped. When the backend reports pause as unsupported the capability is
/// latched off for the rest of the process lifetime and a single warning is
/// logged.
pub struct ResourceThrottler {
    control: Arc<dyn ProcessControl>,
    paused: Mutex<HashSet<u32>>,
    pause_supported: AtomicBool,
}

impl ResourceThrottler {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            paused: Mutex::new(HashSet::new()),
            pause_supported: AtomicBool::new(true),
        }
    }

    /// Throttler using the current platform's backend
    pub fn for_platform() -> Self {
        Self::new(platform_control())
    }

    /// Evaluate thresholds; see [`evaluate`]
    pub fn evaluate(&self, snapshot: &ResourceSnapshot, config: &ThresholdConfig) -> ThrottleDecision {
        evaluate(snapshot, config)
    }

    /// Whether pause/resume is still considered available
    pub fn pause_supported(&self) -> bool {
        self.pause_supported.load(Ordering::SeqCst)
    }

    /// Whether the throttler currently holds `pid` stopped
    pub fn is_paused(&self, pid: u32) -> bool {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pid)
    }

    /// Apply the nice level to a freshly started process
    pub fn apply_priority(&self, pid: u32, nice_level: i32) -> Result<(), SignalError> {
        self.control.set_priority(pid, nice_level)
    }

    /// Stop a process group; no-op if already stopped by this throttler
    pub fn pause(&self, pid: u32) -> Result<SignalOutcome, SignalError> {
        if !self.pause_supported() {
            return Ok(SignalOutcome::Skipped);
        }

        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if paused.contains(&pid) {
            return Ok(SignalOutcome::AlreadyInState);
        }

        match self.control.stop(pid) {
            Ok(()) => {
                paused.insert(pid);
                debug!(pid, "Process group stopped");
                Ok(SignalOutcome::Applied)
            }
            Err(SignalError::Unsupported) => {
                self.disable_pause();
                Ok(SignalOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Continue a process group; no-op if not stopped by this throttler
    pub fn resume(&self, pid: u32) -> Result<SignalOutcome, SignalError> {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if !paused.contains(&pid) {
            return Ok(SignalOutcome::AlreadyInState);
        }

        match self.control.cont(pid) {
            Ok(()) => {
                paused.remove(&pid);
                debug!(pid, "Process group continued");
                Ok(SignalOutcome::Applied)
            }
            Err(SignalError::ProcessNotFound(_)) => {
                paused.remove(&pid);
                Err(SignalError::ProcessNotFound(pid))
            }
            Err(SignalError::Unsupported) => {
                self.disable_pause();
                Ok(SignalOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a terminate request to the process group
    pub fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        self.control.terminate(pid)
    }

    /// Forcefully kill the process group
    pub fn kill(&self, pid: u32) -> Result<(), SignalError> {
        self.control.kill(pid)
    }

    /// Forget a PID once its process has been reaped
    pub fn release(&self, pid: u32) {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    fn disable_pause(&self) {
        if self.pause_supported.swap(false, Ordering::SeqCst) {
            warn!("Pause/resume signals are not supported on this host; jobs will run unthrottled");
        }
    }
}
