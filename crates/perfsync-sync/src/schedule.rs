//! Sequential run-loop and its two trigger policies.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use perfsync_core::RunReport;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Run at a fixed local time of day. A failed run waits for the next day.
    DailyAnchor { trigger_time: NaiveTime },
    /// Run again a fixed delay after the previous run ended.
    FixedBackoff {
        success_delay: Duration,
        failure_delay: Duration,
    },
}

impl SchedulePolicy {
    /// Wall-clock time of the next run, given when the last one ended.
    /// Saturates at `NaiveDateTime::MAX` instead of overflowing.
    pub fn next_trigger(&self, finished_at: NaiveDateTime, succeeded: bool) -> NaiveDateTime {
        let later = match *self {
            Self::DailyAnchor { trigger_time } => {
                let today = finished_at.date().and_time(trigger_time);
                if today > finished_at {
                    Some(today)
                } else {
                    today.checked_add_signed(TimeDelta::days(1))
                }
            }
            Self::FixedBackoff {
                success_delay,
                failure_delay,
            } => {
                let delay = if succeeded { success_delay } else { failure_delay };
                TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|delta| finished_at.checked_add_signed(delta))
            }
        };
        later.unwrap_or(NaiveDateTime::MAX)
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyAnchor { trigger_time } => {
                write!(f, "daily-anchor at {}", trigger_time.format("%H:%M"))
            }
            Self::FixedBackoff {
                success_delay,
                failure_delay,
            } => write!(
                f,
                "fixed-backoff ({}s after success, {}s after failure)",
                success_delay.as_secs(),
                failure_delay.as_secs()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub runs: usize,
    pub failures: usize,
}

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub struct RunLoop {
    policy: SchedulePolicy,
    poll_interval: Duration,
    clock: Clock,
}

impl RunLoop {
    pub fn new(policy: SchedulePolicy, poll_interval: Duration) -> Self {
        Self {
            policy,
            poll_interval,
            clock: Arc::new(|| Local::now().naive_local()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Runs `job` once immediately, even if `stop` is already set, then on
    /// every trigger until `stop` turns true or its sender is dropped. A run in
    /// progress always completes.
    pub async fn run<F, Fut>(&self, mut job: F, mut stop: watch::Receiver<bool>) -> LoopStats
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RunReport>,
    {
        let mut stats = LoopStats::default();
        info!(policy = %self.policy, "run loop started; Ctrl+C to stop");

        loop {
            let report = job().await;
            stats.runs += 1;
            let succeeded = report.outcome.is_success();
            if !succeeded {
                stats.failures += 1;
                warn!(run_id = %report.run_id, "run failed; waiting for next trigger");
            }
            if *stop.borrow() {
                break;
            }

            let next = self.policy.next_trigger((self.clock)(), succeeded);
            info!(next_run = %next.format("%Y-%m-%d %H:%M:%S"), "next run scheduled");

            loop {
                let now = (self.clock)();
                if now >= next {
                    break;
                }
                let remaining = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(remaining.min(self.poll_interval)) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            info!(runs = stats.runs, "stop requested; run loop exiting");
                            return stats;
                        }
                    }
                }
            }
        }

        info!(runs = stats.runs, "run loop stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use perfsync_core::{RunOutcome, RunStage};
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Mutex;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn report(outcome: RunOutcome) -> RunReport {
        let mut report = RunReport::begin(Utc::now());
        report.outcome = outcome;
        report
    }

    fn failed() -> RunOutcome {
        RunOutcome::Failed {
            stage: RunStage::Upsert,
            message: "forced".into(),
        }
    }

    #[test]
    fn daily_anchor_picks_today_or_tomorrow() {
        let policy = SchedulePolicy::DailyAnchor {
            trigger_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        assert_eq!(policy.next_trigger(at(5, 30), true), at(6, 0));
        assert_eq!(
            policy.next_trigger(at(6, 0), true),
            at(6, 0) + chrono::Duration::days(1)
        );
        assert_eq!(
            policy.next_trigger(at(7, 0), false),
            at(6, 0) + chrono::Duration::days(1)
        );
    }

    #[test]
    fn fixed_backoff_depends_on_outcome() {
        let policy = SchedulePolicy::FixedBackoff {
            success_delay: Duration::from_secs(120),
            failure_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.next_trigger(at(7, 0), true), at(7, 2));
        assert_eq!(policy.next_trigger(at(7, 0), false), at(7, 1));
    }

    #[test]
    fn oversized_delay_saturates_instead_of_overflowing() {
        let policy = SchedulePolicy::FixedBackoff {
            success_delay: Duration::from_secs(100_000_000_000_000),
            failure_delay: Duration::from_secs(u64::MAX),
        };
        assert_eq!(policy.next_trigger(at(0, 0), true), NaiveDateTime::MAX);
        assert_eq!(policy.next_trigger(at(0, 0), false), NaiveDateTime::MAX);

        let daily = SchedulePolicy::DailyAnchor {
            trigger_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        };
        assert_eq!(
            daily.next_trigger(NaiveDateTime::MAX, true),
            NaiveDateTime::MAX
        );
    }

    #[tokio::test]
    async fn failed_run_does_not_prevent_the_next_one() {
        let run_loop = RunLoop::new(
            SchedulePolicy::FixedBackoff {
                success_delay: Duration::from_millis(5),
                failure_delay: Duration::from_millis(5),
            },
            Duration::from_millis(1),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let calls = Rc::new(Cell::new(0usize));
        let job_calls = calls.clone();

        let stats = run_loop
            .run(
                move || {
                    let n = job_calls.get() + 1;
                    job_calls.set(n);
                    if n == 3 {
                        let _ = stop_tx.send(true);
                    }
                    async move {
                        if n == 1 {
                            report(failed())
                        } else {
                            report(RunOutcome::Succeeded)
                        }
                    }
                },
                stop_rx,
            )
            .await;

        assert_eq!(stats, LoopStats { runs: 3, failures: 1 });
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn daily_anchor_waits_for_trigger_after_first_run() {
        // Each clock read advances ten minutes from 05:00.
        let ticks = Arc::new(Mutex::new(0i64));
        let clock_ticks = ticks.clone();
        let clock: Clock = Arc::new(move || {
            let mut t = clock_ticks.lock().unwrap();
            *t += 1;
            at(5, 0) + chrono::Duration::minutes(10 * *t)
        });
        let run_loop = RunLoop::new(
            SchedulePolicy::DailyAnchor {
                trigger_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            },
            Duration::from_millis(1),
        )
        .with_clock(clock);

        let (stop_tx, stop_rx) = watch::channel(false);
        let clock_at_run = Rc::new(Mutex::new(Vec::new()));
        let seen = clock_at_run.clone();
        let reads = ticks.clone();
        let stats = run_loop
            .run(
                move || {
                    let t = *reads.lock().unwrap();
                    seen.lock().unwrap().push(t);
                    if seen.lock().unwrap().len() == 2 {
                        let _ = stop_tx.send(true);
                    }
                    async { report(RunOutcome::Succeeded) }
                },
                stop_rx,
            )
            .await;

        assert_eq!(stats.runs, 2);
        let seen = clock_at_run.lock().unwrap().clone();
        // First run happens before any clock read; the second only once the
        // clock has passed 06:00 (tick 6).
        assert_eq!(seen[0], 0);
        assert!(seen[1] >= 6, "second run at tick {}", seen[1]);
    }

    #[tokio::test]
    async fn stop_while_idle_exits_without_another_run() {
        let run_loop = RunLoop::new(
            SchedulePolicy::FixedBackoff {
                success_delay: Duration::from_secs(3600),
                failure_delay: Duration::from_secs(3600),
            },
            Duration::from_secs(60),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let runs = Rc::new(Cell::new(0usize));
        let counter = runs.clone();

        let stopper = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = stop_tx.send(true);
            // Keep the sender alive until the loop has observed the change.
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        let looped = run_loop.run(
            move || {
                counter.set(counter.get() + 1);
                async { report(RunOutcome::Empty) }
            },
            stop_rx,
        );
        let (stats, ()) = tokio::join!(looped, stopper);

        assert_eq!(stats.runs, 1);
        assert_eq!(runs.get(), 1);
    }

    #[tokio::test]
    async fn already_stopped_loop_still_runs_once() {
        let run_loop = RunLoop::new(
            SchedulePolicy::FixedBackoff {
                success_delay: Duration::from_secs(1),
                failure_delay: Duration::from_secs(1),
            },
            Duration::from_millis(1),
        );
        let (_stop_tx, stop_rx) = watch::channel(true);
        let stats = run_loop
            .run(|| async { report(RunOutcome::Succeeded) }, stop_rx)
            .await;
        assert_eq!(stats.runs, 1);
    }
}
