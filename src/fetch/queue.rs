//! Bounded-concurrency fetch queue with bounded, backed-off retries.
//!
//! Every resource runs through the lifecycle
//! `Pending -> InFlight -> (Done | Retrying(n) -> Pending | Failed)`,
//! with `Skipped` for identities rejected up front and `Cancelled` for tasks
//! that never started (or stopped waiting) after cancellation was requested.

use super::{FetchError, Fetcher, RemoteResource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Retry and concurrency settings for a [`FetchQueue`].
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Maximum number of attempts in flight at once.
    pub concurrency: usize,
    /// Attempts per resource before it is reported as failed.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single attempt.
    pub task_timeout: Duration,
}

impl FetchPolicy {
    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based): `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            task_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    /// Waiting out the backoff after `n` failed attempts.
    Retrying(u32),
    Failed,
    Done,
    Skipped,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Done | TaskState::Skipped | TaskState::Cancelled
        )
    }
}

/// Final state of one resource.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub identity: String,
    pub state: TaskState,
    pub attempts: u32,
    pub bytes: u64,
    pub last_error: Option<String>,
}

/// Per-run summary. Terminal failures are kept apart from successes.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub done: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub cancelled: Vec<String>,
    pub bytes: u64,
}

impl FetchReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome.state {
            TaskState::Done => {
                self.bytes += outcome.bytes;
                self.done.push(outcome.identity);
            }
            TaskState::Skipped => self.skipped.push(outcome.identity),
            TaskState::Cancelled => self.cancelled.push(outcome.identity),
            _ => self.failed.push((
                outcome.identity,
                outcome.last_error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    /// Truth that every non-skipped resource was fetched.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

/// Drains a set of [`RemoteResource`]s through a [`Fetcher`].
pub struct FetchQueue {
    policy: FetchPolicy,
    accept: Option<fn(&str) -> bool>,
}

impl FetchQueue {
    pub fn new(policy: FetchPolicy) -> Self {
        Self {
            policy,
            accept: None,
        }
    }

    /// Only identities for which `accept` holds are fetched; the others are
    /// reported as skipped without touching the network.
    pub fn with_identity_filter(mut self, accept: fn(&str) -> bool) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Runs every resource to a terminal state and returns the report once
    /// nothing is pending or in flight.
    #[tracing::instrument(skip_all, fields(resources = resources.len(), concurrency = self.policy.concurrency))]
    pub async fn run<F>(
        &self,
        fetcher: Arc<F>,
        resources: Vec<RemoteResource>,
        cancel: CancellationToken,
    ) -> FetchReport
    where
        F: Fetcher + ?Sized + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.policy.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = FetchReport::default();

        for resource in resources {
            let accepted = self.accept.is_none_or(|accept| accept(&resource.identity));
            if !accepted {
                info!(identity = %resource.identity, "Skipping, not a valid identity");
                report.record(TaskOutcome {
                    identity: resource.identity,
                    state: TaskState::Skipped,
                    attempts: 0,
                    bytes: 0,
                    last_error: None,
                });
                continue;
            }

            let span = tracing::info_span!("fetch", identity = %resource.identity);
            let task = FetchTask {
                resource,
                policy: self.policy.clone(),
                semaphore: semaphore.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(task.run(fetcher.clone()).instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!(error = %e, "Fetch task aborted"),
            }
        }

        info!(
            done = report.done.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            bytes = report.bytes,
            "Fetch queue drained"
        );
        report
    }
}

/// Runs a one-off request under `policy`: each attempt is bounded by
/// `task_timeout` and failed attempts are retried with the same backoff as
/// queued resources. Cancellation is observed before an attempt starts and
/// during backoff, never mid-attempt.
pub async fn retry<T, F, Fut>(
    policy: &FetchPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        attempt += 1;
        let err = match tokio::time::timeout(policy.task_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => FetchError::Timeout(policy.task_timeout),
        };
        if attempt >= policy.max_attempts.max(1) {
            error!(error = %err, attempts = attempt, "Giving up on request");
            return Err(err);
        }
        warn!(error = %err, attempt, "Request failed, will retry");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(policy.backoff(attempt)) => {}
        }
    }
}

struct FetchTask {
    resource: RemoteResource,
    policy: FetchPolicy,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl FetchTask {
    async fn run<F: Fetcher + ?Sized>(self, fetcher: Arc<F>) -> TaskOutcome {
        let mut state = TaskState::Pending;
        let mut permit: Option<OwnedSemaphorePermit> = None;
        let mut attempts = 0;
        let mut bytes = 0;
        let mut last_error = None;

        while !state.is_terminal() {
            state = match state {
                TaskState::Pending => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => TaskState::Cancelled,
                        acquired = self.semaphore.clone().acquire_owned() => match acquired {
                            Ok(p) => {
                                permit = Some(p);
                                TaskState::InFlight
                            }
                            Err(_) => TaskState::Cancelled,
                        },
                    }
                }
                TaskState::InFlight => {
                    attempts += 1;
                    debug!(attempt = attempts, url = %self.resource.url, "Fetching");
                    let result = self.attempt(fetcher.as_ref()).await;
                    permit.take();
                    match result {
                        Ok(n) => {
                            bytes = n;
                            info!(bytes = n, attempts, "Fetched");
                            TaskState::Done
                        }
                        Err(e) if attempts >= self.policy.max_attempts => {
                            error!(error = %e, attempts, "Giving up on resource");
                            last_error = Some(e.to_string());
                            TaskState::Failed
                        }
                        Err(e) => {
                            warn!(error = %e, attempt = attempts, "Fetch failed, will retry");
                            last_error = Some(e.to_string());
                            TaskState::Retrying(attempts)
                        }
                    }
                }
                TaskState::Retrying(n) => {
                    let delay = self.policy.backoff(n);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => TaskState::Cancelled,
                        _ = tokio::time::sleep(delay) => TaskState::Pending,
                    }
                }
                terminal => terminal,
            };
        }

        TaskOutcome {
            identity: self.resource.identity,
            state,
            attempts,
            bytes,
            last_error,
        }
    }

    async fn attempt<F: Fetcher + ?Sized>(&self, fetcher: &F) -> Result<u64, FetchError> {
        let timeout = self.policy.task_timeout;
        tokio::time::timeout(timeout, fetcher.fetch(&self.resource))
            .await
            .unwrap_or(Err(FetchError::Timeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails each identity a configured number of times, then succeeds.
    #[derive(Default)]
    struct FlakyFetcher {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FlakyFetcher {
        fn failing(identity: &str, times: u32) -> Self {
            let fetcher = Self::default();
            fetcher
                .failures
                .lock()
                .unwrap()
                .insert(identity.to_string(), times);
            fetcher
        }

        fn calls(&self, identity: &str) -> u32 {
            *self.calls.lock().unwrap().get(identity).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, resource: &RemoteResource) -> Result<u64, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            *self
                .calls
                .lock()
                .unwrap()
                .entry(resource.identity.clone())
                .or_default() += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&resource.identity) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(FetchError::Status {
                        url: resource.url.clone(),
                        status: 503,
                    })
                }
                _ => Ok(10),
            }
        }
    }

    fn resource(identity: &str) -> RemoteResource {
        RemoteResource {
            identity: identity.to_string(),
            url: format!("https://example.invalid/{identity}"),
            destination: PathBuf::from(format!("/tmp/{identity}")),
        }
    }

    fn fast_policy(concurrency: usize, max_attempts: u32) -> FetchPolicy {
        FetchPolicy {
            concurrency,
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            task_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = FetchPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            ..FetchPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let fetcher = Arc::new(FlakyFetcher::failing("06", 2));
        let queue = FetchQueue::new(fast_policy(2, 5));

        let report = queue
            .run(fetcher.clone(), vec![resource("06")], CancellationToken::new())
            .await;

        assert_eq!(report.done, vec!["06".to_string()]);
        assert!(report.is_complete());
        assert_eq!(fetcher.calls("06"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_after_max_attempts() {
        let fetcher = Arc::new(FlakyFetcher::failing("01", u32::MAX));
        let queue = FetchQueue::new(fast_policy(2, 3));

        let report = queue
            .run(
                fetcher.clone(),
                vec![resource("01"), resource("02")],
                CancellationToken::new(),
            )
            .await;

        assert_eq!(fetcher.calls("01"), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "01");
        assert!(report.failed[0].1.contains("503"));
        assert_eq!(report.done, vec!["02".to_string()]);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let queue = FetchQueue::new(fast_policy(3, 1));
        let resources = (0..20).map(|i| resource(&format!("{i:02}"))).collect();

        let report = queue
            .run(fetcher.clone(), resources, CancellationToken::new())
            .await;

        assert_eq!(report.done.len(), 20);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_filtered_identities_never_reach_fetcher() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let queue =
            FetchQueue::new(fast_policy(2, 1)).with_identity_filter(crate::geo::is_state_fips);

        let report = queue
            .run(
                fetcher.clone(),
                vec![resource("03"), resource("06")],
                CancellationToken::new(),
            )
            .await;

        assert_eq!(report.skipped, vec!["03".to_string()]);
        assert_eq!(report.done, vec!["06".to_string()]);
        assert_eq!(fetcher.calls("03"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queue_starts_nothing() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let queue = FetchQueue::new(fast_policy(2, 1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = queue
            .run(fetcher.clone(), vec![resource("01"), resource("02")], cancel)
            .await;

        assert_eq!(report.cancelled.len(), 2);
        assert_eq!(fetcher.calls("01") + fetcher.calls("02"), 0);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        struct Stalled;

        #[async_trait]
        impl Fetcher for Stalled {
            async fn fetch(&self, _: &RemoteResource) -> Result<u64, FetchError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(0)
            }
        }

        let queue = FetchQueue::new(FetchPolicy {
            task_timeout: Duration::from_millis(10),
            ..fast_policy(1, 2)
        });
        let report = queue
            .run(Arc::new(Stalled), vec![resource("01")], CancellationToken::new())
            .await;

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_drains_in_flight_and_stops_backoff() {
        /// `slow` succeeds after a while; every other identity fails at once.
        struct SlowOrFailing;

        #[async_trait]
        impl Fetcher for SlowOrFailing {
            async fn fetch(&self, resource: &RemoteResource) -> Result<u64, FetchError> {
                if resource.identity == "slow" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(7)
                } else {
                    Err(FetchError::Status {
                        url: resource.url.clone(),
                        status: 503,
                    })
                }
            }
        }

        let queue = FetchQueue::new(FetchPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            ..fast_policy(2, 5)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = queue
            .run(
                Arc::new(SlowOrFailing),
                vec![resource("slow"), resource("flaky")],
                cancel,
            )
            .await;

        assert_eq!(report.done, vec!["slow".to_string()]);
        assert_eq!(report.bytes, 7);
        assert_eq!(report.cancelled, vec!["flaky".to_string()]);
        assert!(report.failed.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry(&fast_policy(1, 4), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::Status {
                        url: "https://example.invalid/o".to_string(),
                        status: 500,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry(&fast_policy(1, 3), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FetchError::Status {
                    url: "https://example.invalid/o".to_string(),
                    status: 503,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry(&fast_policy(1, 3), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
