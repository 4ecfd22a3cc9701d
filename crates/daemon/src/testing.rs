//! Shared test doubles: a scripted resource sampler and a recording process control

use crate::config::{ThresholdConfig, TranscoderConfig};
use crate::job::{JobContext, MonitorTiming};
use crate::monitor::{MemoryMetrics, ProcessUsage, ResourceSampler, ResourceSnapshot, SampleError};
use crate::throttle::{ProcessControl, ResourceThrottler, SignalError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build a snapshot with the given overall CPU and a calm memory reading
pub fn snapshot_with_cpu(cpu_percent: f32) -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent,
        per_core_percent: vec![cpu_percent; 4],
        memory: MemoryMetrics {
            total_mb: 16_384,
            available_mb: 12_288,
            used_mb: 4_096,
            percent: 25.0,
        },
        ..Default::default()
    }
}

/// Sampler that replays a script of host CPU readings
///
/// `None` entries fail the whole sample. Once the script runs out the last
/// entry repeats.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<Option<f32>>>,
    last: Mutex<Option<f32>>,
    host_samples: AtomicUsize,
    /// Host samples after the first `n` block for the given duration
    slow_after: Option<(usize, Duration)>,
    process_gone: bool,
}

impl ScriptedSampler {
    pub fn script(entries: Vec<Option<f32>>) -> Self {
        Self {
            script: Mutex::new(entries.into()),
            last: Mutex::new(Some(5.0)),
            host_samples: AtomicUsize::new(0),
            slow_after: None,
            process_gone: false,
        }
    }

    /// Block every host sample after the first `count` for `delay`
    pub fn slow_after(mut self, count: usize, delay: Duration) -> Self {
        self.slow_after = Some((count, delay));
        self
    }

    /// Report every sampled process as already exited
    pub fn process_gone(mut self) -> Self {
        self.process_gone = true;
        self
    }

    pub fn cpu(values: &[f32]) -> Self {
        Self::script(values.iter().copied().map(Some).collect())
    }

    pub fn idle() -> Self {
        Self::cpu(&[5.0])
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> Result<ResourceSnapshot, SampleError> {
        let taken = self.host_samples.fetch_add(1, Ordering::SeqCst);
        if let Some((count, delay)) = self.slow_after {
            if taken >= count {
                std::thread::sleep(delay);
            }
        }

        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(entry) = next {
            *last = entry;
        }
        match *last {
            Some(cpu) => Ok(snapshot_with_cpu(cpu)),
            None => Err(SampleError::Unavailable("scripted failure".to_string())),
        }
    }

    fn sample_process(&self, pid: u32) -> Result<ProcessUsage, SampleError> {
        if self.process_gone {
            return Err(SampleError::ProcessNotFound(pid));
        }
        Ok(ProcessUsage {
            cpu_percent: 12.5,
            memory_mb: 256.0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    Priority(u32, i32),
    Stop(u32),
    Cont(u32),
    Terminate(u32),
    Kill(u32),
}

/// Process control that records every call and optionally delegates to a real backend
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
    delegate: Option<Arc<dyn ProcessControl>>,
    supported: bool,
}

impl RecordingControl {
    /// Records and reports success without touching any process
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delegate: None,
            supported: true,
        }
    }

    /// Records and reports every control as unsupported
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// Records and forwards to the platform backend
    pub fn real() -> Self {
        Self {
            delegate: Some(crate::throttle::platform_control()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(
        &self,
        call: ControlCall,
        forward: impl FnOnce(&dyn ProcessControl) -> Result<(), SignalError>,
    ) -> Result<(), SignalError> {
        self.calls.lock().unwrap().push(call);
        if !self.supported {
            return Err(SignalError::Unsupported);
        }
        match &self.delegate {
            Some(delegate) => forward(delegate.as_ref()),
            None => Ok(()),
        }
    }
}

impl ProcessControl for RecordingControl {
    fn set_priority(&self, pid: u32, nice: i32) -> Result<(), SignalError> {
        self.record(ControlCall::Priority(pid, nice), |c| c.set_priority(pid, nice))
    }

    fn stop(&self, pid: u32) -> Result<(), SignalError> {
        self.record(ControlCall::Stop(pid), |c| c.stop(pid))
    }

    fn cont(&self, pid: u32) -> Result<(), SignalError> {
        self.record(ControlCall::Cont(pid), |c| c.cont(pid))
    }

    fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        self.record(ControlCall::Terminate(pid), |c| c.terminate(pid))
    }

    fn kill(&self, pid: u32) -> Result<(), SignalError> {
        self.record(ControlCall::Kill(pid), |c| c.kill(pid))
    }
}

/// Fast timings so supervision tests finish quickly
pub fn fast_timing() -> MonitorTiming {
    MonitorTiming {
        interval: Duration::from_millis(50),
        sample_timeout: Duration::from_millis(500),
        cancel_grace: Duration::from_secs(2),
        min_dwell: Duration::ZERO,
    }
}

pub fn test_context(
    sampler: ScriptedSampler,
    control: Arc<RecordingControl>,
    timing: MonitorTiming,
) -> JobContext {
    JobContext {
        sampler: Arc::new(sampler),
        throttler: Arc::new(ResourceThrottler::new(control)),
        thresholds: Arc::new(tokio::sync::RwLock::new(ThresholdConfig::default())),
        timing,
    }
}

/// Transcoder configuration that runs each item's single profile argument as a shell script
pub fn shell_transcoder() -> TranscoderConfig {
    TranscoderConfig {
        binary: "sh".to_string(),
        args: vec!["-c".to_string(), "{profile_args}".to_string()],
        ..Default::default()
    }
}
