//! Usage: Asynchronous execution service (worker-permit pool, retries, cancellation).
//!
//! - Each submission runs as its own tokio task; a worker permit is held only while one network
//!   attempt is running, never while a request sleeps or waits on a refresh.
//! - Listeners run in submission order on the terminal outcome, before the handle resolves.

use super::request::{Request, RequestListener};
use super::retry::{RetryAction, RetryPolicy};
use crate::shared::error::RequestError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Runs requests asynchronously, consulting the retry policy after each failed attempt.
pub trait ExecutionService: Send + Sync + 'static {
    fn submit<R: Request>(
        &self,
        request: Arc<R>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
        listeners: Vec<Arc<dyn RequestListener<R::Output>>>,
    ) -> RequestHandle<R::Output>;
}

/// Caller side of a submission. Dropping it does not cancel the request.
#[derive(Debug)]
pub struct RequestHandle<T> {
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> RequestHandle<T> {
    /// A handle that resolves to `error` without anything being executed.
    pub(crate) fn rejected(error: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            cancel: CancellationToken::new(),
            outcome: rx,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn outcome(self) -> Result<T, RequestError> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Transport(
                "request task ended without an outcome".to_string(),
            )),
        }
    }
}

/// Tokio-backed `ExecutionService`. Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    permits: Arc<Semaphore>,
    worker_count: usize,
    shutdown: CancellationToken,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COUNT)
    }
}

impl TaskExecutor {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            permits: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Cancels every request submitted through this executor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl ExecutionService for TaskExecutor {
    fn submit<R: Request>(
        &self,
        request: Arc<R>,
        retry_policy: Option<Arc<dyn RetryPolicy>>,
        listeners: Vec<Arc<dyn RequestListener<R::Output>>>,
    ) -> RequestHandle<R::Output> {
        let cancel = self.shutdown.child_token();
        let (tx, rx) = oneshot::channel();
        let run = RequestRun {
            request,
            retry_policy,
            permits: Arc::clone(&self.permits),
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            let result = run.run().await;
            match &result {
                Ok(output) => {
                    for listener in &listeners {
                        listener.on_request_success(output);
                    }
                }
                Err(err) => {
                    for listener in &listeners {
                        listener.on_request_failure(err);
                    }
                }
            }
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        });

        RequestHandle {
            cancel,
            outcome: rx,
        }
    }
}

struct RequestRun<R: Request> {
    request: Arc<R>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<R: Request> RequestRun<R> {
    async fn run(&self) -> Result<R::Output, RequestError> {
        let label = self.request.label();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.attempt_once().await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if matches!(err, RequestError::Cancelled) {
                return Err(self.cancelled());
            }

            let Some(policy) = self.retry_policy.as_ref() else {
                return Err(err);
            };
            let mut decision = policy.should_retry(&err);
            tracing::debug!(
                request = label,
                attempt,
                code = err.code(),
                remaining = decision.remaining_attempts,
                decision = decision.describe(),
                "request attempt failed"
            );

            // A pending refresh resolves into a follow-up decision.
            loop {
                if decision.is_abandon() {
                    return Err(err);
                }
                match decision.action {
                    RetryAction::Abandon => return Err(err),
                    RetryAction::RetryAfterDelay(delay) => {
                        if !self.pause(delay).await {
                            return Err(self.cancelled());
                        }
                        break;
                    }
                    RetryAction::RetryPendingRefresh(ticket) => {
                        let outcome = tokio::select! {
                            _ = self.cancel.cancelled() => return Err(self.cancelled()),
                            outcome = ticket.resolved() => outcome,
                        };
                        decision = policy.on_refresh_resolved(&outcome);
                    }
                }
            }
        }
    }

    async fn attempt_once(&self) -> Result<R::Output, RequestError> {
        if self.cancel.is_cancelled() {
            return Err(RequestError::Cancelled);
        }
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RequestError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| RequestError::Cancelled)?,
        };
        if let Some(policy) = self.retry_policy.as_ref() {
            policy.on_attempt_start();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RequestError::Cancelled),
            result = self.request.execute_network_call() => result,
        }
    }

    /// Returns `false` if cancelled while waiting.
    async fn pause(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn cancelled(&self) -> RequestError {
        if let Some(policy) = self.retry_policy.as_ref() {
            policy.on_cancelled();
        }
        tracing::debug!(request = self.request.label(), "request cancelled");
        RequestError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::retry::{RefreshOutcome, RetryDecision};
    use crate::shared::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        calls: AtomicU32,
        results: Mutex<Vec<Result<u32, RequestError>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(results: Vec<Result<u32, RequestError>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                results: Mutex::new(results),
                delay: Duration::ZERO,
            }
        }
    }

    impl Request for Scripted {
        type Output = u32;

        fn execute_network_call(&self) -> BoxFuture<'_, Result<u32, RequestError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let mut results = self.results.lock().unwrap();
                if results.is_empty() {
                    Ok(0)
                } else {
                    results.remove(0)
                }
            })
        }
    }

    struct RetryOnce {
        used: AtomicU32,
    }

    impl RetryPolicy for RetryOnce {
        fn should_retry(&self, _error: &RequestError) -> RetryDecision {
            if self.used.fetch_add(1, Ordering::SeqCst) == 0 {
                RetryDecision::retry_after(Duration::from_millis(1), 1)
            } else {
                RetryDecision::abandon()
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RequestListener<u32> for Recorder {
        fn on_request_success(&self, output: &u32) {
            self.events.lock().unwrap().push(format!("ok:{output}"));
        }

        fn on_request_failure(&self, error: &RequestError) {
            self.events.lock().unwrap().push(format!("err:{}", error.code()));
        }
    }

    #[tokio::test]
    async fn success_notifies_listeners_in_order() {
        let executor = TaskExecutor::new(2);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let request = Arc::new(Scripted::new(vec![Ok(7)]));

        let listeners: Vec<Arc<dyn RequestListener<u32>>> = vec![first.clone(), second.clone()];
        let handle = executor.submit(Arc::clone(&request), None, listeners);

        assert_eq!(handle.outcome().await, Ok(7));
        assert_eq!(*first.events.lock().unwrap(), vec!["ok:7".to_string()]);
        assert_eq!(*second.events.lock().unwrap(), vec!["ok:7".to_string()]);
    }

    #[tokio::test]
    async fn failure_without_policy_is_not_retried() {
        let executor = TaskExecutor::default();
        let request = Arc::new(Scripted::new(vec![Err(RequestError::from_status(401, ""))]));

        let result = executor
            .submit(Arc::clone(&request), None, Vec::new())
            .outcome()
            .await;

        assert!(matches!(result, Err(RequestError::Unauthorized { .. })));
        assert_eq!(request.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_delay_reexecutes() {
        let executor = TaskExecutor::default();
        let request = Arc::new(Scripted::new(vec![
            Err(RequestError::from_status(503, "busy")),
            Ok(9),
        ]));
        let policy: Arc<dyn RetryPolicy> = Arc::new(RetryOnce {
            used: AtomicU32::new(0),
        });

        let result = executor
            .submit(Arc::clone(&request), Some(policy), Vec::new())
            .outcome()
            .await;

        assert_eq!(result, Ok(9));
        assert_eq!(request.calls.load(Ordering::SeqCst), 2);
    }

    struct CountingStarts {
        starts: AtomicU32,
        inner: RetryOnce,
    }

    impl RetryPolicy for CountingStarts {
        fn on_attempt_start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn should_retry(&self, error: &RequestError) -> RetryDecision {
            self.inner.should_retry(error)
        }
    }

    #[tokio::test]
    async fn policy_is_told_about_every_attempt() {
        let executor = TaskExecutor::default();
        let request = Arc::new(Scripted::new(vec![
            Err(RequestError::from_status(401, "expired")),
            Ok(3),
        ]));
        let policy = Arc::new(CountingStarts {
            starts: AtomicU32::new(0),
            inner: RetryOnce {
                used: AtomicU32::new(0),
            },
        });
        let as_policy: Arc<dyn RetryPolicy> = policy.clone();

        let result = executor
            .submit(Arc::clone(&request), Some(as_policy), Vec::new())
            .outcome()
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(policy.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandon_surfaces_last_attempt_error() {
        let executor = TaskExecutor::default();
        let request = Arc::new(Scripted::new(vec![
            Err(RequestError::from_status(503, "first")),
            Err(RequestError::from_status(503, "second")),
        ]));
        let policy: Arc<dyn RetryPolicy> = Arc::new(RetryOnce {
            used: AtomicU32::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn RequestListener<u32>>> = vec![recorder.clone()];

        let result = executor
            .submit(Arc::clone(&request), Some(policy), listeners)
            .outcome()
            .await;

        assert_eq!(result, Err(RequestError::from_status(503, "second")));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["err:HTTP_STATUS_ERROR".to_string()]
        );
    }

    #[tokio::test]
    async fn cancel_during_attempt_completes_with_cancelled() {
        let executor = TaskExecutor::default();
        let mut scripted = Scripted::new(vec![Ok(1)]);
        scripted.delay = Duration::from_secs(30);
        let request = Arc::new(scripted);

        let handle = executor.submit(Arc::clone(&request), None, Vec::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert_eq!(handle.outcome().await, Err(RequestError::Cancelled));
    }

    struct PendingForever {
        cancelled: AtomicU32,
        ticket: Mutex<Option<crate::dispatch::retry::RefreshTicket>>,
    }

    impl RetryPolicy for PendingForever {
        fn should_retry(&self, _error: &RequestError) -> RetryDecision {
            let ticket = self.ticket.lock().unwrap().clone().unwrap();
            RetryDecision::wait_for_refresh(ticket, 1)
        }

        fn on_refresh_resolved(&self, _outcome: &RefreshOutcome) -> RetryDecision {
            RetryDecision::retry_after(Duration::ZERO, 1)
        }

        fn on_cancelled(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancel_while_waiting_on_refresh_is_not_retried() {
        let executor = TaskExecutor::default();
        let (tx, rx) = tokio::sync::watch::channel(None);
        let policy = Arc::new(PendingForever {
            cancelled: AtomicU32::new(0),
            ticket: Mutex::new(Some(crate::dispatch::retry::RefreshTicket::new(rx))),
        });
        let request = Arc::new(Scripted::new(vec![Err(RequestError::from_status(401, ""))]));

        let handle = executor.submit(
            Arc::clone(&request),
            Some(policy.clone() as Arc<dyn RetryPolicy>),
            Vec::new(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = handle.outcome().await;
        tx.send_replace(Some(RefreshOutcome::Refreshed { generation: 2 }));

        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(request.calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiting_requests_release_worker_permits() {
        // One worker: a request parked on a refresh must not block the next submission.
        let executor = TaskExecutor::new(1);
        let (tx, rx) = tokio::sync::watch::channel(None);
        let policy = Arc::new(PendingForever {
            cancelled: AtomicU32::new(0),
            ticket: Mutex::new(Some(crate::dispatch::retry::RefreshTicket::new(rx))),
        });
        let parked = Arc::new(Scripted::new(vec![Err(RequestError::from_status(401, ""))]));
        let parked_handle = executor.submit(
            Arc::clone(&parked),
            Some(policy as Arc<dyn RetryPolicy>),
            Vec::new(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = Arc::new(Scripted::new(vec![Ok(5)]));
        let other_result = tokio::time::timeout(
            Duration::from_secs(5),
            executor.submit(other, None, Vec::new()).outcome(),
        )
        .await
        .expect("second request must not wait for the parked one");
        assert_eq!(other_result, Ok(5));

        tx.send_replace(Some(RefreshOutcome::Refreshed { generation: 2 }));
        assert_eq!(parked_handle.outcome().await, Ok(0));
        assert_eq!(parked.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_requests() {
        let executor = TaskExecutor::new(1);
        let mut scripted = Scripted::new(vec![Ok(1)]);
        scripted.delay = Duration::from_secs(30);

        let handle = executor.submit(Arc::new(scripted), None, Vec::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        executor.shutdown();

        assert_eq!(handle.outcome().await, Err(RequestError::Cancelled));
    }
}
