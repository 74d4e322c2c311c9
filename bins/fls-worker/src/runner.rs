//! Top-level poll loop.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use fls_common::LoopConfig;
use futures_util::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::worker::PassOutcome;

const MIN_IDLE_SLEEP: Duration = Duration::from_secs(1);

/// One unit of work for the loop.
#[async_trait]
pub trait Pass: Send + Sync {
    async fn run_once(&self) -> Result<PassOutcome>;
}

/// Doubling delay between failed passes, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Idle sleep with uniform jitter, never shorter than one second.
pub fn idle_delay(config: &LoopConfig) -> Duration {
    let base = config.idle_sleep.as_secs_f64();
    let jitter = config.idle_jitter.as_secs_f64();
    let offset = if jitter > 0.0 {
        rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        0.0
    };
    Duration::from_secs_f64((base + offset).max(0.0)).max(MIN_IDLE_SLEEP)
}

/// Run passes until `shutdown` fires.
///
/// The token is only observed between passes and while sleeping, so a job
/// that has been claimed is always finished or released before returning.
pub async fn run_until_shutdown<P>(pass: &P, config: &LoopConfig, shutdown: CancellationToken)
where
    P: Pass + ?Sized,
{
    let mut backoff = Backoff::new(config.error_sleep, config.max_backoff);

    while !shutdown.is_cancelled() {
        let result = AssertUnwindSafe(pass.run_once()).catch_unwind().await;

        let delay = match result {
            Ok(Ok(outcome)) if outcome.did_work() => {
                backoff.reset();
                continue;
            }
            Ok(Ok(PassOutcome::Idle)) => idle_delay(config),
            Ok(Ok(outcome)) => {
                let delay = backoff.next_delay();
                warn!(outcome = outcome.as_str(), delay_secs = delay.as_secs(), "backing off");
                delay
            }
            Ok(Err(e)) => {
                let delay = backoff.next_delay();
                error!(kind = e.kind().as_str(), error = %e, delay_secs = delay.as_secs(), "pass failed");
                delay
            }
            Err(_) => {
                let delay = backoff.next_delay();
                error!(delay_secs = delay.as_secs(), "pass panicked");
                delay
            }
        };

        debug!(delay_ms = delay.as_millis() as u64, "sleeping");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn loop_config(error_secs: u64, max_secs: u64) -> LoopConfig {
        LoopConfig {
            error_sleep: Duration::from_secs(error_secs),
            max_backoff: Duration::from_secs(max_secs),
            ..LoopConfig::default()
        }
    }

    enum Step {
        Fail,
        Outcome(PassOutcome),
    }

    /// Replays a script, then cancels the loop.
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Instant>>,
        shutdown: CancellationToken,
    }

    impl Scripted {
        fn new(steps: Vec<Step>, shutdown: CancellationToken) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
                shutdown,
            }
        }

        fn gaps(&self) -> Vec<u64> {
            let calls = self.calls.lock().unwrap();
            calls
                .windows(2)
                .map(|w| (w[1] - w[0]).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl Pass for Scripted {
        async fn run_once(&self) -> Result<PassOutcome> {
            self.calls.lock().unwrap().push(Instant::now());
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Fail) => Err(WorkerError::Auth),
                Some(Step::Outcome(outcome)) => Ok(outcome),
                None => {
                    self.shutdown.cancel();
                    Ok(PassOutcome::Idle)
                }
            }
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(300));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 300, 300]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_idle_delay_bounds() {
        let config = LoopConfig::default();
        for _ in 0..200 {
            let delay = idle_delay(&config);
            assert!(delay >= Duration::from_secs(12), "{:?}", delay);
            assert!(delay <= Duration::from_secs(18), "{:?}", delay);
        }

        let tight = LoopConfig {
            idle_sleep: Duration::from_secs(1),
            idle_jitter: Duration::from_secs(3),
            ..LoopConfig::default()
        };
        for _ in 0..200 {
            assert!(idle_delay(&tight) >= MIN_IDLE_SLEEP);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_and_success_resets() {
        let shutdown = CancellationToken::new();
        let pass = Scripted::new(
            vec![
                Step::Fail,
                Step::Fail,
                Step::Outcome(PassOutcome::Cancelled { submission_id: 4 }),
                Step::Outcome(PassOutcome::Reported {
                    submission_id: 5,
                    passed: true,
                }),
                Step::Fail,
            ],
            shutdown.clone(),
        );

        run_until_shutdown(&pass, &loop_config(60, 200), shutdown).await;

        assert_eq!(pass.gaps(), vec![60, 120, 200, 0, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_loops_immediately() {
        let shutdown = CancellationToken::new();
        let pass = Scripted::new(
            vec![
                Step::Outcome(PassOutcome::Contended),
                Step::Outcome(PassOutcome::Contended),
            ],
            shutdown.clone(),
        );

        run_until_shutdown(&pass, &loop_config(60, 300), shutdown).await;

        assert_eq!(pass.gaps(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let shutdown = CancellationToken::new();
        let pass = Scripted::new(
            (0..100).map(|_| Step::Outcome(PassOutcome::Idle)).collect(),
            CancellationToken::new(),
        );

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        run_until_shutdown(&pass, &LoopConfig::default(), shutdown).await;

        assert_eq!(started.elapsed().as_secs(), 5);
        assert_eq!(pass.calls.lock().unwrap().len(), 1);
    }

    struct Exploding;

    #[async_trait]
    impl Pass for Exploding {
        async fn run_once(&self) -> Result<PassOutcome> {
            panic!("pass exploded");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_pass_does_not_kill_the_loop() {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(61)).await;
            trigger.cancel();
        });

        run_until_shutdown(&Exploding, &loop_config(60, 300), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
