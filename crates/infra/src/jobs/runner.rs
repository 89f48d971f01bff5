//! Generic scheduling engine shared by every job.
//!
//! A runner owns one job and loops: sleep, gate, process, re-arm. A slow
//! iteration pushes the next one back because the delay is only armed after
//! `process` returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use migrator_core::BackoffCounter;

use super::DEFAULT_BACKOFF_SECS;
use super::shutdown::ShutdownSignal;
use super::window::{WindowGate, check_window};
use crate::config::JobSettings;

/// How the next run should be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Backoff delay if the counter is active, otherwise the default delay.
    Default,
    /// Fixed delay, ignoring backoff.
    After(Duration),
}

/// One kind of recurring work.
#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &'static str;

    fn settings(&self) -> &JobSettings;

    fn default_delay(&self) -> Duration {
        self.settings().default_delay
    }

    /// Escalating delays (seconds) after consecutive empty runs.
    fn backoff_periods(&self) -> &[u64] {
        &DEFAULT_BACKOFF_SECS
    }

    /// Run one iteration. Every exit path yields a [`Reschedule`].
    async fn process(&mut self, backoff: &mut BackoffCounter) -> Reschedule;
}

/// Result of the pre-run checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Shutdown,
    Disabled,
    Closed { opens_at: DateTime<Utc> },
    Run,
}

pub fn should_run(settings: &JobSettings, shutting_down: bool, now: DateTime<Utc>) -> Gate {
    if shutting_down {
        return Gate::Shutdown;
    }
    if !settings.enabled {
        return Gate::Disabled;
    }
    match settings.window.as_ref().map(|window| check_window(now, window)) {
        Some(WindowGate::OpensAt(opens_at)) => Gate::Closed { opens_at },
        Some(WindowGate::Open) | None => Gate::Run,
    }
}

pub fn rearm_delay(decision: Reschedule, backoff: &BackoffCounter, default: Duration) -> Duration {
    match decision {
        Reschedule::After(delay) => delay,
        Reschedule::Default if backoff.is_active() => backoff.current_delay(),
        Reschedule::Default => default,
    }
}

/// Wall-clock source for the off-peak gate.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Drives a [`Job`] until shutdown (or until it turns out to be disabled).
pub struct JobRunner {
    job: Box<dyn Job>,
    shutdown: ShutdownSignal,
    clock: Clock,
}

impl JobRunner {
    pub fn new(job: Box<dyn Job>, shutdown: ShutdownSignal) -> Self {
        Self {
            job,
            shutdown,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run(mut self, initial_delay: Duration) {
        let name = self.job.name();
        let mut backoff = BackoffCounter::from_secs(self.job.backoff_periods());
        let mut delay = initial_delay;

        loop {
            if !self.sleep(delay).await {
                break;
            }

            let now = (self.clock)();
            match should_run(self.job.settings(), self.shutdown.is_triggered(), now) {
                Gate::Shutdown => break,
                Gate::Disabled => {
                    info!(job = name, "job disabled; not re-arming until restart");
                    break;
                }
                Gate::Closed { opens_at } => {
                    delay = (opens_at - now).to_std().unwrap_or(Duration::ZERO);
                    debug!(job = name, %opens_at, "outside off-peak window");
                    continue;
                }
                Gate::Run => {}
            }

            let decision = self.job.process(&mut backoff).await;
            delay = rearm_delay(decision, &backoff, self.job.default_delay());

            if self.shutdown.is_triggered() {
                break;
            }
            debug!(
                job = name,
                delay_secs = delay.as_secs(),
                backoff = backoff.count(),
                "job re-armed"
            );
        }

        info!(job = name, "job runner stopped");
    }

    /// Sleep for `delay`; `false` if shutdown fired first.
    async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use crate::config::WindowSettings;
    use crate::jobs::shutdown::ShutdownTrigger;

    fn enabled(default_delay: Duration) -> JobSettings {
        JobSettings {
            enabled: true,
            window: None,
            default_delay,
        }
    }

    /// Records when it ran; stops the process after `limit` runs.
    struct Probe {
        settings: JobSettings,
        runs: Arc<Mutex<Vec<Instant>>>,
        limit: usize,
        stop: Arc<ShutdownTrigger>,
        empty: bool,
        decision: Reschedule,
    }

    #[async_trait]
    impl Job for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn settings(&self) -> &JobSettings {
            &self.settings
        }

        fn backoff_periods(&self) -> &[u64] {
            &[10, 30, 60, 300]
        }

        async fn process(&mut self, backoff: &mut BackoffCounter) -> Reschedule {
            let mut runs = self.runs.lock().unwrap();
            runs.push(Instant::now());
            if self.empty {
                backoff.increment();
            }
            if runs.len() >= self.limit {
                self.stop.trigger();
            }
            self.decision
        }
    }

    type Runs = Arc<Mutex<Vec<Instant>>>;

    fn probe(
        settings: JobSettings,
        limit: usize,
        empty: bool,
        decision: Reschedule,
    ) -> (Probe, Runs, Arc<ShutdownTrigger>) {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(ShutdownTrigger::new());
        let job = Probe {
            settings,
            runs: runs.clone(),
            limit,
            stop: stop.clone(),
            empty,
            decision,
        };
        (job, runs, stop)
    }

    fn gaps(runs: &[Instant]) -> Vec<u64> {
        runs.windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }

    #[test]
    fn gate_checks_shutdown_before_enablement() {
        let mut settings = enabled(Duration::from_secs(1));
        settings.enabled = false;
        assert_eq!(should_run(&settings, true, Utc::now()), Gate::Shutdown);
        assert_eq!(should_run(&settings, false, Utc::now()), Gate::Disabled);
    }

    #[test]
    fn gate_reports_closed_window() {
        use chrono::TimeZone;
        let mut settings = enabled(Duration::from_secs(1));
        settings.window = Some(WindowSettings {
            start_hour: 22,
            start_minute: 0,
            end_hour: 6,
            end_minute: 0,
            time_zone: chrono_tz::America::New_York,
        });
        // Wednesday 12:00 in New York
        let now = Utc.with_ymd_and_hms(2024, 3, 13, 16, 0, 0).unwrap();
        assert!(matches!(
            should_run(&settings, false, now),
            Gate::Closed { .. }
        ));
    }

    #[test]
    fn rearm_prefers_backoff_over_default() {
        let mut backoff = BackoffCounter::from_secs(&[10, 30]);
        let default = Duration::from_secs(3600);
        assert_eq!(rearm_delay(Reschedule::Default, &backoff, default), default);

        backoff.increment();
        assert_eq!(
            rearm_delay(Reschedule::Default, &backoff, default),
            Duration::from_secs(10)
        );
        assert_eq!(
            rearm_delay(Reschedule::After(Duration::from_secs(300)), &backoff, default),
            Duration::from_secs(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_with_default_delay() {
        let (job, runs, stop) =
            probe(enabled(Duration::from_secs(7)), 3, false, Reschedule::Default);
        let started = Instant::now();
        JobRunner::new(Box::new(job), stop.signal())
            .run(Duration::from_secs(5))
            .await;

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!((runs[0] - started).as_secs(), 5);
        assert_eq!(gaps(&runs), vec![7, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_runs_escalate_through_backoff() {
        let (job, runs, stop) = probe(enabled(Duration::ZERO), 6, true, Reschedule::Default);
        JobRunner::new(Box::new(job), stop.signal())
            .run(Duration::ZERO)
            .await;

        assert_eq!(gaps(&runs.lock().unwrap()), vec![10, 30, 60, 300, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_delay_overrides_backoff() {
        let decision = Reschedule::After(Duration::from_secs(300));
        let (job, runs, stop) = probe(enabled(Duration::ZERO), 3, true, decision);
        JobRunner::new(Box::new(job), stop.signal())
            .run(Duration::ZERO)
            .await;

        assert_eq!(gaps(&runs.lock().unwrap()), vec![300, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_window_sleeps_until_it_opens_then_runs() {
        use chrono::TimeZone;
        use chrono_tz::America::New_York;

        let mut settings = enabled(Duration::from_secs(60));
        settings.window = Some(WindowSettings {
            start_hour: 22,
            start_minute: 0,
            end_hour: 6,
            end_minute: 0,
            time_zone: New_York,
        });
        let (job, runs, stop) = probe(settings, 1, false, Reschedule::Default);

        // Wednesday 21:00 in New York, advancing with the paused tokio clock.
        let base = New_York
            .with_ymd_and_hms(2024, 3, 13, 21, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let started = Instant::now();
        let clock: Clock = Arc::new(move || {
            base + chrono::Duration::from_std(Instant::now() - started).unwrap()
        });

        JobRunner::new(Box::new(job), stop.signal())
            .with_clock(clock)
            .run(Duration::ZERO)
            .await;

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0] - started, Duration::from_secs(3_600));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_job_never_runs() {
        let mut settings = enabled(Duration::from_secs(1));
        settings.enabled = false;
        let (job, runs, stop) = probe(settings, 1, false, Reschedule::Default);
        JobRunner::new(Box::new(job), stop.signal())
            .run(Duration::ZERO)
            .await;

        assert!(runs.lock().unwrap().is_empty());
        assert!(!stop.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_sleep_stops_without_running() {
        let (job, runs, stop) =
            probe(enabled(Duration::from_secs(1)), 10, false, Reschedule::Default);
        let runner = tokio::spawn(
            JobRunner::new(Box::new(job), stop.signal()).run(Duration::from_secs(60)),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        stop.trigger();
        runner.await.unwrap();
        assert!(runs.lock().unwrap().is_empty());
    }
}
