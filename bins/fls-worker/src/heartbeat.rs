//! Liveness pings while a job is building or grading.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ControlPlane;
use crate::metrics;

/// Background task that pings the control plane every `interval`.
///
/// Failures are logged and dropped. Stopping cancels the task and waits at
/// most `stop_timeout` for it before aborting.
pub struct Heartbeat {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl Heartbeat {
    pub fn start<C>(api: Arc<C>, interval: Duration, stop_timeout: Duration) -> Self
    where
        C: ControlPlane + ?Sized + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // a slow ping must not be followed by a burst of catch-up pings
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    result = api.heartbeat() => {
                        if let Err(e) = result {
                            debug!(error = %e, "heartbeat failed");
                            metrics::record_heartbeat_failure();
                        }
                    }
                }
            }
        });

        Self {
            token,
            handle: Some(handle),
            stop_timeout,
        }
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(self.stop_timeout, &mut handle).await.is_err() {
                debug!("heartbeat did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeControlPlane};

    #[tokio::test(start_paused = true)]
    async fn test_pings_on_interval_until_stopped() {
        let api = Arc::new(FakeControlPlane::new(vec![]));
        let heartbeat = Heartbeat::start(api.clone(), Duration::from_secs(20), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(45)).await;
        heartbeat.stop().await;
        let pings = api.count(|c| matches!(c, Call::Heartbeat));
        assert_eq!(pings, 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.count(|c| matches!(c, Call::Heartbeat)), pings);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_task() {
        let api = Arc::new(FakeControlPlane::new(vec![]).failing_heartbeat());
        let heartbeat = Heartbeat::start(api.clone(), Duration::from_secs(20), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(65)).await;
        heartbeat.stop().await;

        assert_eq!(api.count(|c| matches!(c, Call::Heartbeat)), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ping_does_not_burst() {
        let api = Arc::new(FakeControlPlane::new(vec![]).slow_first_heartbeat(Duration::from_secs(65)));
        let heartbeat = Heartbeat::start(api.clone(), Duration::from_secs(20), Duration::from_secs(2));

        // first ping answers at 65s, the next goes out then and again at 85s
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(api.count(|c| matches!(c, Call::Heartbeat)), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        heartbeat.stop().await;
        assert_eq!(api.count(|c| matches!(c, Call::Heartbeat)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_wait_for_a_hung_ping() {
        let api = Arc::new(FakeControlPlane::new(vec![]).hanging_heartbeat());
        let heartbeat = Heartbeat::start(api.clone(), Duration::from_secs(20), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = tokio::time::Instant::now();
        heartbeat.stop().await;

        assert!(before.elapsed() <= Duration::from_secs(2));
    }
}
