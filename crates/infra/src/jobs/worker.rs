//! Polling job worker.
//!
//! One worker drives one [`JobType`]. Each tick:
//!
//! 1. find due jobs (`PENDING`, `next_run_at` unset or past)
//! 2. claim each with a compare-and-swap; a lost claim is skipped
//! 3. run the handler under a timeout
//! 4. commit the handler's changes together with the finished job, or
//!    schedule a retry / mark the job failed
//! 5. emit a best-effort notification
//!
//! Claims and results are stamped with the clock at the moment they happen, not
//! the tick's start, so a slow batch never hands out already-expired leases or
//! schedules retries in the past. The final write is fenced on the claim: if the
//! sweeper released the job and someone else claimed it meanwhile, the write is
//! dropped and counted in [`TickReport::lost_leases`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffPolicy, RetryDecision};
use super::error::JobError;
use super::types::{Job, JobType};
use crate::notifications::{self, Notification, NotificationSink};
use crate::store::{ChangeSet, JobStore, OrderStore, StoreError};

/// Kind-specific job logic.
///
/// On success the handler returns the order/payment rows to write; an empty
/// change set means the effect was already in place.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, job: &Job) -> Result<ChangeSet, JobError>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Upper bound for one handler execution (gateway call included).
    pub execution_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            execution_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs another poller claimed first.
    pub lost_claims: usize,
    /// Jobs whose lease was released while they ran; their result was dropped.
    pub lost_leases: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Skipped,
    Retried,
    Failed,
    LostClaim,
    LostLease,
}

pub struct JobWorker {
    name: String,
    jobs: Arc<dyn JobStore>,
    orders: Arc<dyn OrderStore>,
    handler: Arc<dyn JobHandler>,
    notifier: Arc<dyn NotificationSink>,
    policy: BackoffPolicy,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        name: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        orders: Arc<dyn OrderStore>,
        handler: Arc<dyn JobHandler>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            name: name.into(),
            jobs,
            orders,
            handler,
            notifier,
            policy: BackoffPolicy::default(),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process every job of this worker's type that is due at `now`.
    ///
    /// `now` only selects the batch; each claim and result uses the current time.
    ///
    /// Jobs in a batch run sequentially. A store failure on one job is logged
    /// and the job is left for the lease sweeper; the rest of the batch continues.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let job_type = self.handler.job_type();
        let due = self
            .jobs
            .find_due(job_type, now, self.config.batch_size)
            .await?;

        let mut report = TickReport::default();
        for job in due {
            let job_id = job.id;
            match self.process(job).await {
                Ok(outcome) => {
                    if outcome != Outcome::LostClaim {
                        report.claimed += 1;
                    }
                    match outcome {
                        Outcome::Succeeded => report.succeeded += 1,
                        Outcome::Skipped => report.skipped += 1,
                        Outcome::Retried => report.retried += 1,
                        Outcome::Failed => report.failed += 1,
                        Outcome::LostClaim => report.lost_claims += 1,
                        Outcome::LostLease => report.lost_leases += 1,
                    }
                }
                Err(err) => {
                    error!(worker = %self.name, job_id = %job_id, error = %err, "job bookkeeping failed");
                }
            }
        }

        if report != TickReport::default() {
            info!(
                worker = %self.name,
                claimed = report.claimed,
                succeeded = report.succeeded,
                skipped = report.skipped,
                retried = report.retried,
                failed = report.failed,
                lost_claims = report.lost_claims,
                lost_leases = report.lost_leases,
                "tick finished"
            );
        }
        Ok(report)
    }

    /// One tick at the current time, logging instead of returning errors.
    pub async fn run_once(&self) -> TickReport {
        match self.tick(Utc::now()).await {
            Ok(report) => report,
            Err(err) => {
                error!(worker = %self.name, error = %err, "failed to load due jobs");
                TickReport::default()
            }
        }
    }

    async fn process(&self, job: Job) -> Result<Outcome, StoreError> {
        let Some(job) = self.jobs.claim(job.id, Utc::now()).await? else {
            debug!(worker = %self.name, job_id = %job.id, "job claimed elsewhere");
            return Ok(Outcome::LostClaim);
        };
        debug!(
            worker = %self.name,
            job_id = %job.id,
            order_id = %job.order_id,
            attempts = job.attempts,
            "claimed job"
        );

        let result = match tokio::time::timeout(
            self.config.execution_timeout,
            self.handler.execute(&job),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(self.config.execution_timeout)),
        };

        let err = match result {
            Ok(changes) => {
                let skipped = changes.is_empty();
                let mut finished = job.clone();
                finished.mark_succeeded(Utc::now());
                match self.orders.commit(changes.with_job(finished)).await {
                    Ok(()) => return Ok(self.record_success(&job, skipped).await),
                    Err(err) => JobError::Store(err),
                }
            }
            Err(err) => err,
        };
        self.record_failure(job, err, Utc::now()).await
    }

    async fn record_success(&self, job: &Job, skipped: bool) -> Outcome {
        info!(
            worker = %self.name,
            job_id = %job.id,
            order_id = %job.order_id,
            skipped,
            "job succeeded"
        );
        self.emit(Notification::JobSucceeded {
            job_id: job.id,
            job_type: job.job_type(),
            order_id: job.order_id,
            skipped,
        })
        .await;
        if skipped {
            Outcome::Skipped
        } else {
            Outcome::Succeeded
        }
    }

    async fn record_failure(
        &self,
        mut job: Job,
        err: JobError,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        let attempts = job.attempts + 1;
        let message = err.to_string();

        match self.policy.decide(&err, attempts) {
            RetryDecision::RetryAfter(delay) => {
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(1));
                let next_run_at = now + delay;
                job.schedule_retry(message.clone(), next_run_at, now);
                if let Some(lost) = self.write_back(&job).await? {
                    return Ok(lost);
                }

                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    order_id = %job.order_id,
                    attempts = job.attempts,
                    next_run_at = %next_run_at,
                    error = %message,
                    "job failed, retry scheduled"
                );
                self.emit(Notification::JobRetryScheduled {
                    job_id: job.id,
                    job_type: job.job_type(),
                    order_id: job.order_id,
                    attempts: job.attempts,
                    next_run_at,
                    error: message,
                })
                .await;
                Ok(Outcome::Retried)
            }
            RetryDecision::GiveUp => {
                job.mark_failed(message.clone(), now);
                if let Some(lost) = self.write_back(&job).await? {
                    return Ok(lost);
                }

                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    order_id = %job.order_id,
                    attempts = job.attempts,
                    error = %message,
                    "job failed permanently"
                );
                self.emit(Notification::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type(),
                    order_id: job.order_id,
                    attempts: job.attempts,
                    error: message,
                })
                .await;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Store a failed attempt. A conflict means the lease moved on without us.
    async fn write_back(&self, job: &Job) -> Result<Option<Outcome>, StoreError> {
        match self.jobs.update(job).await {
            Ok(()) => Ok(None),
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    order_id = %job.order_id,
                    reason = %reason,
                    "job lease lost, result dropped"
                );
                Ok(Some(Outcome::LostLease))
            }
            Err(err) => Err(err),
        }
    }

    async fn emit(&self, notification: Notification) {
        notifications::emit(self.notifier.as_ref(), notification).await;
    }

    /// Run [`JobWorker::run_once`] every `poll_interval` until shut down.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let name = self.name.clone();
        let interval = self.config.poll_interval;
        spawn_periodic(name, interval, move || {
            let worker = Arc::clone(&self);
            async move {
                worker.run_once().await;
            }
        })
    }
}

/// Handle to a running periodic task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(task = %self.name, error = %err, "background task panicked");
        }
    }
}

/// Spawn a task that awaits `tick()` on a fixed-delay timer until shutdown.
///
/// A tick in progress is never interrupted; shutdown is observed between ticks.
pub(crate) fn spawn_periodic<F, Fut>(name: String, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task_name = name.clone();

    let join = tokio::spawn(async move {
        info!(task = %task_name, interval_secs = interval.as_secs_f64(), "background task started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(task = %task_name, "background task stopped");
    });

    WorkerHandle {
        name,
        shutdown,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use fulfillment_core::OrderId;

    use crate::gateways::GatewayError;
    use crate::jobs::JobStatus;
    use crate::notifications::{InMemoryNotificationSink, NotifyError};
    use crate::store::InMemoryFulfillmentStore;

    /// Replays scripted results, then succeeds with an empty change set.
    struct ScriptedHandler {
        results: Mutex<Vec<Result<ChangeSet, JobError>>>,
        calls: Mutex<usize>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn new(results: Vec<Result<ChangeSet, JobError>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        fn job_type(&self) -> JobType {
            JobType::Shipping
        }

        async fn execute(&self, _job: &Job) -> Result<ChangeSet, JobError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(ChangeSet::new())
            } else {
                results.remove(0)
            }
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify(&self, _: Notification) -> Result<(), NotifyError> {
            Err(NotifyError("down".into()))
        }
    }

    fn unavailable() -> JobError {
        JobError::Gateway(GatewayError::Http {
            status: 503,
            body: "unavailable".into(),
        })
    }

    fn worker(
        store: &Arc<InMemoryFulfillmentStore>,
        handler: Arc<ScriptedHandler>,
        sink: Arc<dyn NotificationSink>,
    ) -> JobWorker {
        JobWorker::new("shipping-worker", store.clone(), store.clone(), handler, sink)
    }

    #[tokio::test]
    async fn retryable_failure_schedules_next_attempt() {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let id = store.enqueue(Job::shipping(OrderId::new(), now)).await.unwrap();
        let handler = Arc::new(ScriptedHandler::new(vec![Err(unavailable())]));
        let sink = Arc::new(InMemoryNotificationSink::new());

        let report = worker(&store, handler, sink.clone()).tick(now).await.unwrap();
        let after = Utc::now();
        assert_eq!(report.retried, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        let next_run_at = job.next_run_at.unwrap();
        assert!(next_run_at >= now + ChronoDuration::minutes(1));
        assert!(next_run_at <= after + ChronoDuration::minutes(1));
        assert_eq!(next_run_at, job.updated_at + ChronoDuration::minutes(1));
        assert!(job.last_error.unwrap().contains("503"));
        assert!(matches!(
            sink.sent().as_slice(),
            [Notification::JobRetryScheduled { attempts: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn seventh_failure_is_terminal() {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let mut job = Job::shipping(OrderId::new(), now);
        job.attempts = 6;
        let id = store.enqueue(job).await.unwrap();
        let handler = Arc::new(ScriptedHandler::new(vec![Err(unavailable())]));

        let report = worker(&store, handler, Arc::new(InMemoryNotificationSink::new()))
            .tick(now)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 7);
        assert!(job.next_run_at.is_none());
    }

    #[tokio::test]
    async fn not_due_jobs_are_left_alone() {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let mut job = Job::shipping(OrderId::new(), now);
        job.next_run_at = Some(now + ChronoDuration::minutes(1));
        store.enqueue(job).await.unwrap();
        let handler = Arc::new(ScriptedHandler::new(vec![]));

        let report = worker(&store, handler.clone(), Arc::new(InMemoryNotificationSink::new()))
            .tick(now)
            .await
            .unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn notification_failures_do_not_affect_the_job() {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let id = store.enqueue(Job::shipping(OrderId::new(), now)).await.unwrap();
        let handler = Arc::new(ScriptedHandler::new(vec![]));

        let report = worker(&store, handler, Arc::new(FailingSink)).tick(now).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_retries() {
        let store = InMemoryFulfillmentStore::arc();
        let now = Utc::now();
        let id = store.enqueue(Job::shipping(OrderId::new(), now)).await.unwrap();
        let mut handler = ScriptedHandler::new(vec![]);
        handler.delay = Some(Duration::from_millis(200));

        let report = worker(&store, Arc::new(handler), Arc::new(InMemoryNotificationSink::new()))
            .with_config(WorkerConfig {
                execution_timeout: Duration::from_millis(20),
                ..WorkerConfig::default()
            })
            .tick(now)
            .await
            .unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn each_job_in_a_slow_batch_gets_its_own_clock() {
        let store = InMemoryFulfillmentStore::arc();
        let tick_start = Utc::now();
        for _ in 0..3 {
            store.enqueue(Job::shipping(OrderId::new(), tick_start)).await.unwrap();
        }
        let mut handler =
            ScriptedHandler::new(vec![Err(unavailable()), Err(unavailable()), Err(unavailable())]);
        handler.delay = Some(Duration::from_millis(300));
        let backoff = Duration::from_millis(500);

        let report = worker(&store, Arc::new(handler), Arc::new(InMemoryNotificationSink::new()))
            .with_policy(BackoffPolicy::new(vec![backoff], 7))
            .tick(tick_start)
            .await
            .unwrap();
        assert_eq!(report.retried, 3);

        let later = Utc::now() + ChronoDuration::hours(1);
        let mut jobs = store.find_due(JobType::Shipping, later, 10).await.unwrap();
        assert_eq!(jobs.len(), 3);
        jobs.sort_by_key(|job| job.claimed_at);

        let backoff = ChronoDuration::from_std(backoff).unwrap();
        for job in &jobs {
            let claimed_at = job.claimed_at.unwrap();
            let next_run_at = job.next_run_at.unwrap();
            assert!(job.updated_at >= claimed_at + ChronoDuration::milliseconds(300));
            assert_eq!(next_run_at, job.updated_at + backoff);
            assert!(next_run_at > job.updated_at);
        }
        // The last job was claimed after the first two ran, not at tick start.
        let last_claim = jobs[2].claimed_at.unwrap();
        assert!(last_claim >= tick_start + ChronoDuration::milliseconds(600));
        assert!(jobs[2].next_run_at.unwrap() > tick_start + ChronoDuration::milliseconds(1100));
        assert!(jobs[0].claimed_at < jobs[1].claimed_at);
        assert!(jobs[1].claimed_at < jobs[2].claimed_at);
    }

    /// Simulates the sweeper releasing the lease and another worker reclaiming
    /// the job while this execution is still running.
    struct ReclaimingHandler {
        store: Arc<InMemoryFulfillmentStore>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for ReclaimingHandler {
        fn job_type(&self) -> JobType {
            JobType::Shipping
        }

        async fn execute(&self, job: &Job) -> Result<ChangeSet, JobError> {
            let now = Utc::now();
            let released = self
                .store
                .release_stale(now + ChronoDuration::seconds(1), now)
                .await
                .unwrap();
            assert_eq!(released, vec![job.id]);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let reclaimed = self.store.claim(job.id, Utc::now()).await.unwrap();
            assert!(reclaimed.is_some());
            if self.fail {
                Err(unavailable())
            } else {
                Ok(ChangeSet::new())
            }
        }
    }

    #[tokio::test]
    async fn result_is_dropped_when_the_lease_moved_on() {
        for fail in [false, true] {
            let store = InMemoryFulfillmentStore::arc();
            let id = store
                .enqueue(Job::shipping(OrderId::new(), Utc::now()))
                .await
                .unwrap();
            let sink = Arc::new(InMemoryNotificationSink::new());
            let handler = Arc::new(ReclaimingHandler {
                store: store.clone(),
                fail,
            });

            let worker =
                JobWorker::new("shipping-worker", store.clone(), store.clone(), handler, sink.clone());
            let report = worker.tick(Utc::now()).await.unwrap();
            assert_eq!(report.lost_leases, 1, "fail = {fail}");
            assert_eq!(report.succeeded + report.skipped + report.retried, 0);

            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::InProgress);
            assert_eq!(job.attempts, 0);
            assert!(job.last_error.is_none());
            assert!(sink.sent().is_empty());
        }
    }

    #[tokio::test]
    async fn spawned_worker_runs_and_shuts_down() {
        let store = InMemoryFulfillmentStore::arc();
        let id = store
            .enqueue(Job::shipping(OrderId::new(), Utc::now()))
            .await
            .unwrap();
        let handler = Arc::new(ScriptedHandler::new(vec![]));

        let handle = Arc::new(
            worker(&store, handler, Arc::new(InMemoryNotificationSink::new())).with_config(
                WorkerConfig {
                    poll_interval: Duration::from_millis(10),
                    ..WorkerConfig::default()
                },
            ),
        )
        .spawn();

        let mut done = false;
        for _ in 0..100 {
            if store.get(id).await.unwrap().unwrap().status == JobStatus::Succeeded {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(done, "job was not processed by the spawned worker");
    }
}
