//! Scheduler
//!
//! Derives the desired pool mode from the schedule configuration and the
//! wall clock on a fixed tick. Nothing is stored between ticks apart from
//! whether the schedule was enabled last time.

use crate::config::{parse_clock_time, ScheduleConfig, ScheduleTimezone, ValidationError};
use crate::pool::{EncoderPool, PoolMode};
use chrono::{Datelike, NaiveDateTime, NaiveTime};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Live schedule configuration shared with the facade
pub type SharedSchedule = Arc<RwLock<ScheduleConfig>>;

/// Parsed day/time window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    days: BTreeSet<u8>,
    start: NaiveTime,
    end: NaiveTime,
}

impl ScheduleWindow {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self, ValidationError> {
        cfg.validate()?;
        let parse = |field: &'static str, value: &str| {
            parse_clock_time(value).ok_or_else(|| ValidationError::InvalidTime {
                field,
                value: value.to_string(),
            })
        };
        Ok(Self {
            days: cfg.days_of_week.clone(),
            start: parse("start_time", &cfg.start_time)?,
            end: parse("end_time", &cfg.end_time)?,
        })
    }

    /// Whether `now` falls in the window
    ///
    /// The weekday of `now` must be in the day set, and the time of day in
    /// `[start, end)`. A start after the end wraps past midnight; the
    /// after-midnight part is still checked against the current weekday.
    /// Equal start and end is an empty window.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        let weekday = now.weekday().num_days_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }

        let time = now.time();
        if self.start < self.end {
            self.start <= time && time < self.end
        } else if self.start > self.end {
            time >= self.start || time < self.end
        } else {
            false
        }
    }
}

/// Pool mode the schedule asks for, or `None` when the schedule is disabled
/// (or unusable) and the pool is under manual control
pub fn desired_mode(cfg: &ScheduleConfig, now: NaiveDateTime) -> Option<PoolMode> {
    if !cfg.enabled {
        return None;
    }
    if cfg.manual_override {
        return Some(PoolMode::Running);
    }

    match ScheduleWindow::from_config(cfg) {
        Ok(window) if window.contains(now) => Some(PoolMode::Running),
        Ok(_) => Some(PoolMode::Stopped),
        Err(e) => {
            debug!(error = %e, "Schedule unusable; leaving pool mode alone");
            None
        }
    }
}

/// Current wall-clock time in the schedule's timezone
pub fn schedule_now(cfg: &ScheduleConfig) -> NaiveDateTime {
    ScheduleTimezone::parse(&cfg.timezone)
        .unwrap_or(ScheduleTimezone::Local)
        .now()
}

/// Drives the pool between running and stopped
pub struct Scheduler {
    schedule: SharedSchedule,
    pool: EncoderPool,
    tick_interval: Duration,
    was_enabled: AtomicBool,
}

impl Scheduler {
    pub fn new(schedule: SharedSchedule, pool: EncoderPool, tick_interval: Duration) -> Self {
        Self {
            schedule,
            pool,
            tick_interval,
            was_enabled: AtomicBool::new(false),
        }
    }

    /// Whether the current time is inside the configured window
    pub async fn within_window(&self) -> bool {
        let cfg = self.schedule.read().await.clone();
        ScheduleWindow::from_config(&cfg)
            .map(|window| window.contains(schedule_now(&cfg)))
            .unwrap_or(false)
    }

    /// Evaluate the schedule now and apply the resulting mode
    pub async fn evaluate(&self) -> Option<PoolMode> {
        let cfg = self.schedule.read().await.clone();
        let now = schedule_now(&cfg);
        self.apply_at(&cfg, now)
    }

    /// Apply the schedule for a given wall-clock time
    ///
    /// Turning the schedule off hands the pool back to manual control once,
    /// in `running` mode.
    pub fn apply_at(&self, cfg: &ScheduleConfig, now: NaiveDateTime) -> Option<PoolMode> {
        let was_enabled = self.was_enabled.swap(cfg.enabled, Ordering::SeqCst);

        match desired_mode(cfg, now) {
            Some(mode) => {
                if self.pool.mode() != mode {
                    info!(mode = ?mode, manual_override = cfg.manual_override, "Schedule changed pool mode");
                }
                self.pool.set_mode(mode);
                Some(mode)
            }
            None if was_enabled && !cfg.enabled => {
                info!("Schedule disabled; pool back under manual control");
                self.pool.set_mode(PoolMode::Running);
                Some(PoolMode::Running)
            }
            None => None,
        }
    }

    /// Tick until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::store::MemoryJobStore;
    use crate::testing::{fast_timing, shell_transcoder, test_context, RecordingControl, ScriptedSampler};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    /// 2024-01-01 is a Monday
    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn schedule(start: &str, end: &str) -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            start_time: start.to_string(),
            end_time: end.to_string(),
            ..Default::default()
        }
    }

    fn window(start: &str, end: &str) -> ScheduleWindow {
        ScheduleWindow::from_config(&schedule(start, end)).unwrap()
    }

    fn test_scheduler(cfg: ScheduleConfig) -> (Scheduler, EncoderPool) {
        let pool = EncoderPool::new(
            Arc::new(MemoryJobStore::new()),
            test_context(ScriptedSampler::idle(), Arc::new(RecordingControl::new()), fast_timing()),
            shell_transcoder(),
            &PoolConfig::default(),
            Duration::from_millis(20),
        );
        let scheduler = Scheduler::new(
            Arc::new(RwLock::new(cfg)),
            pool.clone(),
            Duration::from_millis(20),
        );
        (scheduler, pool)
    }

    #[test]
    fn test_window_wraps_past_midnight() {
        let w = window("22:00", "06:00");
        assert!(w.contains(at(1, 23, 30)));
        assert!(!w.contains(at(1, 9, 0)));
        assert!(w.contains(at(1, 5, 59)));
        assert!(w.contains(at(1, 22, 0)));
        assert!(!w.contains(at(1, 6, 0)));
    }

    #[test]
    fn test_daytime_window() {
        let w = window("09:00", "17:00");
        assert!(w.contains(at(3, 9, 0)));
        assert!(w.contains(at(3, 16, 59)));
        assert!(!w.contains(at(3, 17, 0)));
        assert!(!w.contains(at(3, 8, 59)));
    }

    #[test]
    fn test_equal_start_and_end_is_empty() {
        let w = window("12:00", "12:00");
        assert!(!w.contains(at(1, 12, 0)));
        assert!(!w.contains(at(1, 0, 0)));
    }

    #[test]
    fn test_weekday_uses_current_day_after_midnight() {
        let mut cfg = schedule("22:00", "06:00");
        cfg.days_of_week = [0].into_iter().collect();
        let w = ScheduleWindow::from_config(&cfg).unwrap();

        assert!(w.contains(at(1, 23, 30)));
        // Tuesday 02:00 belongs to Monday night's window but Tuesday is not enabled
        assert!(!w.contains(at(2, 2, 0)));
        // Monday 02:00 is enabled
        assert!(w.contains(at(1, 2, 0)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = schedule("25:00", "06:00");
        assert!(ScheduleWindow::from_config(&cfg).is_err());
        assert_eq!(desired_mode(&cfg, at(1, 23, 0)), None);
    }

    #[test]
    fn test_manual_override_precedence() {
        let mut cfg = schedule("22:00", "06:00");
        let outside = at(1, 12, 0);

        cfg.manual_override = true;
        assert_eq!(desired_mode(&cfg, outside), Some(PoolMode::Running));

        cfg.manual_override = false;
        assert_eq!(desired_mode(&cfg, outside), Some(PoolMode::Stopped));
        assert_eq!(desired_mode(&cfg, at(1, 23, 0)), Some(PoolMode::Running));
    }

    #[test]
    fn test_disabled_schedule_ignores_override() {
        let mut cfg = schedule("22:00", "06:00");
        cfg.enabled = false;
        cfg.manual_override = true;
        assert_eq!(desired_mode(&cfg, at(1, 12, 0)), None);
    }

    #[tokio::test]
    async fn test_scheduler_drives_pool_mode() {
        let (scheduler, pool) = test_scheduler(schedule("22:00", "06:00"));

        assert_eq!(scheduler.apply_at(&schedule("22:00", "06:00"), at(1, 12, 0)), Some(PoolMode::Stopped));
        assert_eq!(pool.mode(), PoolMode::Stopped);

        assert_eq!(scheduler.apply_at(&schedule("22:00", "06:00"), at(1, 23, 0)), Some(PoolMode::Running));
        assert_eq!(pool.mode(), PoolMode::Running);

        // Window ends: stop again
        scheduler.apply_at(&schedule("22:00", "06:00"), at(2, 6, 0));
        assert_eq!(pool.mode(), PoolMode::Stopped);
    }

    #[tokio::test]
    async fn test_disabling_schedule_returns_pool_to_running_once() {
        let (scheduler, pool) = test_scheduler(schedule("22:00", "06:00"));
        scheduler.apply_at(&schedule("22:00", "06:00"), at(1, 12, 0));
        assert_eq!(pool.mode(), PoolMode::Stopped);

        let mut disabled = schedule("22:00", "06:00");
        disabled.enabled = false;
        assert_eq!(scheduler.apply_at(&disabled, at(1, 12, 0)), Some(PoolMode::Running));
        assert_eq!(pool.mode(), PoolMode::Running);

        // Later ticks leave a manually stopped pool alone
        pool.set_mode(PoolMode::Stopped);
        assert_eq!(scheduler.apply_at(&disabled, at(1, 12, 0)), None);
        assert_eq!(pool.mode(), PoolMode::Stopped);
    }

    #[tokio::test]
    async fn test_run_loop_applies_live_config() {
        // Empty window: always outside
        let cfg = schedule("12:00", "12:00");
        let (scheduler, pool) = test_scheduler(cfg);
        let scheduler = Arc::new(scheduler);

        let (tx, rx) = broadcast::channel(1);
        let runner = scheduler.clone();
        let task = tokio::spawn(async move { runner.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.mode(), PoolMode::Stopped);
        assert!(!scheduler.within_window().await);

        scheduler.schedule.write().await.manual_override = true;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.mode(), PoolMode::Running);

        tx.send(()).unwrap();
        task.await.unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_window_membership(
            start_min in 0u32..1440,
            end_min in 0u32..1440,
            now_min in 0u32..1440,
            day in 1u32..8,
        ) {
            let fmt = |m: u32| format!("{:02}:{:02}", m / 60, m % 60);
            let w = window(&fmt(start_min), &fmt(end_min));
            let now = at(day, now_min / 60, now_min % 60);

            let expected = if start_min < end_min {
                start_min <= now_min && now_min < end_min
            } else if start_min > end_min {
                now_min >= start_min || now_min < end_min
            } else {
                false
            };
            prop_assert_eq!(w.contains(now), expected);
        }
    }
}
