//! Generic status polling with backoff, per-check timeouts, and cancellation.

use crate::error::{GenlyError, Result, TimeoutKind};
use crate::progress::Progress;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a single status check observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The result is available.
    Ready(T),
    /// Still working; check again later.
    Pending,
    /// The provider reported a terminal failure.
    Failed(String),
}

/// Polling budget and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    /// Maximum number of status checks.
    pub max_attempts: u32,
    /// Delay after the first pending check.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each pending check.
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Deadline for one status check.
    pub check_timeout: Duration,
    /// Progress reported before the first check.
    pub progress_floor: u8,
    /// Progress approached as attempts run out.
    pub progress_ceiling: u8,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 180,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 1.2,
            max_delay: Duration::from_secs(5),
            check_timeout: Duration::from_secs(10),
            progress_floor: 50,
            progress_ceiling: 95,
        }
    }
}

impl PollOptions {
    /// Fixed-interval polling.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            backoff_multiplier: 1.0,
            max_delay: interval,
            ..Self::default()
        }
    }

    /// Sets the per-check timeout.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Sets the progress range covered by polling.
    pub fn with_progress_range(mut self, floor: u8, ceiling: u8) -> Self {
        self.progress_floor = floor.min(ceiling);
        self.progress_ceiling = ceiling;
        self
    }

    /// The delay after each pending check, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let multiplier = self.backoff_multiplier.max(1.0);
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(d.mul_f64(multiplier).min(self.max_delay))
        })
    }

    fn progress_at(&self, attempt: u32) -> u8 {
        let span = self.progress_ceiling.saturating_sub(self.progress_floor) as u32;
        let step = span * attempt / self.max_attempts.max(1);
        self.progress_floor.saturating_add(step as u8)
    }
}

/// Snapshot of a polling loop, carried into the debug logs.
#[derive(Debug, Clone, Copy)]
pub struct PollState {
    /// Checks performed so far.
    pub attempt: u32,
    /// Maximum number of checks.
    pub max_attempts: u32,
    /// Delay before the next check.
    pub delay: Duration,
    /// When polling began.
    pub started_at: Instant,
}

/// Calls `check` until it reports `Ready`, a terminal failure, or the budget runs out.
///
/// Errors and per-check timeouts count as attempts and are retried. Only
/// `PollOutcome::Failed` and cancellation end the loop early.
pub async fn poll<T, F, Fut>(
    provider: &'static str,
    options: &PollOptions,
    progress: &Progress,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>>>,
{
    let mut delays = options.delays();
    let mut state = PollState {
        attempt: 0,
        max_attempts: options.max_attempts,
        delay: options.initial_delay,
        started_at: Instant::now(),
    };
    let mut last_error: Option<String> = None;

    progress.report(options.progress_floor);

    while state.attempt < state.max_attempts {
        state.attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenlyError::Cancelled),
            outcome = tokio::time::timeout(options.check_timeout, check(state.attempt)) => outcome,
        };

        match outcome {
            Ok(Ok(PollOutcome::Ready(value))) => {
                tracing::debug!(
                    provider,
                    attempt = state.attempt,
                    elapsed_ms = state.started_at.elapsed().as_millis() as u64,
                    "poll complete"
                );
                return Ok(value);
            }
            Ok(Ok(PollOutcome::Failed(reason))) => {
                tracing::debug!(provider, attempt = state.attempt, %reason, "poll reported failure");
                return Err(GenlyError::Provider {
                    provider,
                    status: None,
                    message: reason,
                });
            }
            Ok(Ok(PollOutcome::Pending)) => {}
            Ok(Err(GenlyError::Cancelled)) => return Err(GenlyError::Cancelled),
            Ok(Err(e)) => {
                tracing::warn!(provider, attempt = state.attempt, error = %e, "status check failed, retrying");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                tracing::warn!(
                    provider,
                    attempt = state.attempt,
                    timeout_ms = options.check_timeout.as_millis() as u64,
                    "status check timed out, retrying"
                );
                last_error = Some("status check timed out".to_string());
            }
        }

        progress.report(options.progress_at(state.attempt));

        if state.attempt >= state.max_attempts {
            break;
        }

        state.delay = delays.next().unwrap_or(options.max_delay);
        tracing::debug!(
            provider,
            attempt = state.attempt,
            max_attempts = state.max_attempts,
            delay_ms = state.delay.as_millis() as u64,
            elapsed_ms = state.started_at.elapsed().as_millis() as u64,
            "polling"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenlyError::Cancelled),
            _ = tokio::time::sleep(state.delay) => {}
        }
    }

    let elapsed = state.started_at.elapsed();
    tracing::warn!(
        provider,
        attempts = state.attempt,
        elapsed_ms = elapsed.as_millis() as u64,
        last_error = last_error.as_deref().unwrap_or("none"),
        "polling budget exhausted"
    );
    Err(GenlyError::Timeout {
        operation: TimeoutKind::Polling,
        after: elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast_options(max_attempts: u32) -> PollOptions {
        PollOptions {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            check_timeout: Duration::from_secs(1),
            progress_floor: 50,
            progress_ceiling: 95,
        }
    }

    #[test]
    fn test_delays_are_non_decreasing_and_capped() {
        let options = PollOptions::default();
        let delays: Vec<Duration> = options.delays().take(20).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delays() {
        let options = PollOptions::fixed(120, Duration::from_secs(5));
        assert!(options.delays().take(10).all(|d| d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_ready() {
        let options = fast_options(10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let value = poll("test", &options, &Progress::none(), &CancellationToken::new(), |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok(if n <= 3 {
                    PollOutcome::Pending
                } else {
                    PollOutcome::Ready("done")
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three sleeps: 100 + 200 + 400 ms.
        let expected: Duration = options.delays().take(3).sum();
        assert_eq!(expected, Duration::from_millis(700));
        assert_eq!(start.elapsed(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_exactly_max_attempts() {
        let options = fast_options(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = poll::<(), _, _>("test", &options, &Progress::none(), &CancellationToken::new(), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollOutcome::Pending) }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            GenlyError::Timeout {
                operation: TimeoutKind::Polling,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_swallowed() {
        let options = fast_options(10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = poll("test", &options, &Progress::none(), &CancellationToken::new(), |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match n {
                    1 => Err(GenlyError::Provider {
                        provider: "runware",
                        status: Some(502),
                        message: "bad gateway".into(),
                    }),
                    2 => Err(GenlyError::Decode("garbage".into())),
                    _ => Ok(PollOutcome::Ready(n)),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_counts_as_attempt() {
        let options = fast_options(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = poll("test", &options, &Progress::none(), &CancellationToken::new(), |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(PollOutcome::Ready(n))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_is_terminal() {
        let options = fast_options(10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = poll::<(), _, _>("test", &options, &Progress::none(), &CancellationToken::new(), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollOutcome::Failed("content policy".into())) }
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("content policy"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let options = fast_options(100);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let trigger = cancel.clone();

        let err = poll::<(), _, _>("test", &options, &Progress::none(), &cancel, |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                trigger.cancel();
            }
            async { Ok(PollOutcome::Pending) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, GenlyError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_and_below_completion() {
        let options = fast_options(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(move |p| sink.lock().unwrap().push(p));

        let _ = poll::<(), _, _>("test", &options, &progress, &CancellationToken::new(), |_| async {
            Ok(PollOutcome::Pending)
        })
        .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], 50);
        assert!(seen.windows(2).all(|w| w[1] > w[0]));
        assert!(seen.iter().all(|p| *p < 100));
    }
}
