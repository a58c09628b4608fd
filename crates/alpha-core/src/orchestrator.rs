//! Simulation scheduling.
//!
//! One scheduling loop pulls candidates, enqueues them in the store and
//! starts an attempt whenever a concurrency slot and a rate-limit token are
//! both available. Each attempt runs in its own task holding an owned
//! semaphore permit for as long as the job is SUBMITTING or RUNNING, so the
//! number of in-flight jobs can never exceed `max_concurrent`.
//!
//! Ordering is strict FIFO. A failed attempt that is retried releases its
//! permit, waits out its backoff and then re-enters the queue at the back.
//! Settled jobs are sent to the caller over the completion channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use alpha_state::{
    CandidateId, FailureKind, FailureRecord, JobHandle, JobState, JobStateStore, SimulationJob,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::error::{AlphaError, Result};
use crate::gateway::{CancelOutcome, PollStatus, SimulationGateway};
use crate::metrics::METRICS;
use crate::obs;
use crate::rate_limit::RateLimiter;
use crate::reconcile::{reconcile, Recovery};
use crate::retry::{PollSchedule, RetryDecision, RetryPolicy};
use crate::source::CandidateSource;

// ---------------------------------------------------------------------------
// Stop signal
// ---------------------------------------------------------------------------

/// Cooperative stop request shared by the scheduler, workers and the
/// submission stage.
///
/// After `stop()`: no new candidates are pulled, queued and retrying jobs
/// are cancelled, running jobs are cancelled remotely, and an in-progress
/// submit call is allowed to finish before its job is cancelled.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver that resolves once `stop()` has been called.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolve once a stop has been requested. Cancel-safe.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// What one scheduler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    /// New jobs created from the source.
    pub enqueued: usize,
    /// Candidates skipped because a job with the same id already existed.
    pub duplicates: usize,
    /// RUNNING jobs from an earlier process picked up for polling.
    pub resumed: usize,
    /// Jobs found complete remotely at startup and ingested.
    pub ingested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SchedulerSummary {
    fn record(&mut self, state: JobState) {
        match state {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }
}

enum Exit {
    Settled(JobState),
    Requeued,
}

/// What one pass through the slot branch of the scheduling loop did.
enum Launch {
    Started,
    Idle,
    Stopped,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// State shared by every attempt task.
struct Worker {
    store: Arc<dyn JobStateStore>,
    gateway: Arc<dyn SimulationGateway>,
    policy: RetryPolicy,
    schedule: PollSchedule,
    job_timeout: Duration,
    completions: mpsc::Sender<SimulationJob>,
    requeue: mpsc::UnboundedSender<CandidateId>,
    stop: StopHandle,
}

impl Worker {
    fn current(&self, id: &CandidateId) -> Result<SimulationJob> {
        self.store
            .get(id)?
            .ok_or_else(|| AlphaError::JobMissing(id.clone()))
    }

    fn transition(
        &self,
        id: &CandidateId,
        from: JobState,
        to: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> Result<SimulationJob> {
        let job = self.store.compare_and_transition(id, &[from], to, update)?;
        obs::emit_job_transition(id, from, to, job.attempts);
        Ok(job)
    }

    async fn complete(&self, job: SimulationJob) {
        if self.completions.send(job).await.is_err() {
            debug!("completion receiver closed");
        }
    }

    /// Move to a settled state and report it.
    async fn settle(
        &self,
        id: &CandidateId,
        from: JobState,
        to: JobState,
        update: &mut (dyn FnMut(&mut SimulationJob) + Send),
    ) -> Result<Exit> {
        let job = self.transition(id, from, to, update)?;
        self.complete(job).await;
        Ok(Exit::Settled(to))
    }

    /// One lifecycle attempt for a job already moved to SUBMITTING.
    async fn attempt(self: Arc<Self>, job: SimulationJob, permit: OwnedSemaphorePermit) -> Result<Exit> {
        METRICS.inc_simulations_started();
        let id = job.id().clone();
        // One budget covers both the submit call and polling.
        let deadline = Instant::now() + self.job_timeout;

        let submitted =
            tokio::time::timeout_at(deadline, self.gateway.submit(&job.candidate)).await;
        let handle = match submitted {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let failure = FailureRecord::new(e.kind(), e.to_string());
                return self
                    .fail(&id, JobState::Submitting, failure, e.retry_after(), permit)
                    .await;
            }
            Err(_) => {
                let failure = FailureRecord::new(FailureKind::Timeout, "submit did not return in time");
                return self
                    .fail(&id, JobState::Submitting, failure, None, permit)
                    .await;
            }
        };

        if self.stop.is_stopped() {
            self.cancel_remote(&id, &handle).await;
            let recorded = handle.clone();
            return self
                .settle(&id, JobState::Submitting, JobState::Cancelled, &mut |j| {
                    j.handle = Some(recorded.clone())
                })
                .await;
        }

        let running = self.transition(&id, JobState::Submitting, JobState::Running, &mut |j| {
            j.handle = Some(handle.clone());
            j.last_error = None;
        })?;
        self.poll_until_done(running, permit, deadline).await
    }

    /// Poll a RUNNING job until it settles, fails, passes `deadline` or is
    /// stopped.
    async fn poll_until_done(
        self: Arc<Self>,
        job: SimulationJob,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
    ) -> Result<Exit> {
        let id = job.id().clone();
        let handle = job
            .handle
            .clone()
            .ok_or_else(|| AlphaError::Worker(format!("running job {} has no handle", id.short())))?;
        let mut stop = self.stop.signal();
        let mut polls: u32 = 0;
        let mut hint: Option<Duration> = None;

        loop {
            let wake = (Instant::now() + self.schedule.delay(polls, hint)).min(deadline);
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    self.cancel_remote(&id, &handle).await;
                    return self
                        .settle(&id, JobState::Running, JobState::Cancelled, &mut |_| {})
                        .await;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                self.cancel_remote(&id, &handle).await;
                let failure = FailureRecord::new(
                    FailureKind::Timeout,
                    format!("no result within {}s", self.job_timeout.as_secs()),
                );
                return self.fail(&id, JobState::Running, failure, None, permit).await;
            }

            METRICS.inc_polls();
            match self.gateway.poll_status(&handle).await {
                Ok(PollStatus::Running { retry_after }) => {
                    hint = retry_after;
                    polls += 1;
                }
                Ok(PollStatus::Succeeded(result)) => {
                    let mut result = Some(result);
                    return self
                        .settle(&id, JobState::Running, JobState::Succeeded, &mut |j| {
                            j.result = result.take()
                        })
                        .await;
                }
                Ok(PollStatus::Failed(message)) => {
                    let failure = FailureRecord::new(FailureKind::RemoteFailed, message);
                    return self.fail(&id, JobState::Running, failure, None, permit).await;
                }
                Ok(PollStatus::NotFound) => {
                    let failure =
                        FailureRecord::new(FailureKind::NotFound, format!("handle {handle} unknown"));
                    return self.fail(&id, JobState::Running, failure, None, permit).await;
                }
                Err(e) if e.kind().is_retryable() => {
                    debug!(error = %e, "poll failed, will poll again");
                    hint = e.retry_after();
                    polls += 1;
                }
                Err(e) => {
                    let failure = FailureRecord::new(e.kind(), e.to_string());
                    return self.fail(&id, JobState::Running, failure, None, permit).await;
                }
            }
        }
    }

    /// Record a failed attempt and either schedule a retry or give up.
    async fn fail(
        &self,
        id: &CandidateId,
        from: JobState,
        failure: FailureRecord,
        retry_after: Option<Duration>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Exit> {
        let kind = failure.kind;
        let failed = self.transition(id, from, JobState::Failed, &mut |j| {
            j.last_error = Some(failure.clone())
        })?;

        match self.policy.decide(kind, failed.attempts, retry_after) {
            RetryDecision::Retry { delay } => {
                self.transition(id, JobState::Failed, JobState::Retrying, &mut |_| {})?;
                METRICS.inc_retries();
                obs::emit_retry_scheduled(id, kind, failed.attempts, delay);
                drop(permit);

                let mut stop = self.stop.signal();
                tokio::select! {
                    biased;
                    _ = stop.stopped() => {
                        self.settle(id, JobState::Retrying, JobState::Cancelled, &mut |_| {}).await
                    }
                    _ = tokio::time::sleep(delay) => {
                        if self.requeue.send(id.clone()).is_err() {
                            debug!("scheduler gone, retry dropped");
                        }
                        Ok(Exit::Requeued)
                    }
                }
            }
            RetryDecision::GiveUp(reason) => {
                let job = self
                    .store
                    .update_in_place(id, JobState::Failed, &mut |j| j.retries_exhausted = true)?;
                obs::emit_job_gave_up(id, kind, job.attempts, &reason.to_string());
                drop(permit);
                self.complete(job).await;
                Ok(Exit::Settled(JobState::Failed))
            }
        }
    }

    /// Best-effort remote cancellation. Jobs that cannot be cancelled are
    /// left running remotely and logged as orphaned.
    async fn cancel_remote(&self, id: &CandidateId, handle: &JobHandle) {
        if !self.gateway.supports_cancel() {
            obs::emit_job_orphaned(id, handle);
            return;
        }
        match self.gateway.cancel(handle).await {
            Ok(CancelOutcome::Cancelled) => debug!(handle = %handle, "remote job cancelled"),
            Ok(CancelOutcome::AlreadyTerminal) => {
                debug!(handle = %handle, "remote job already finished")
            }
            Err(e) => {
                warn!(handle = %handle, error = %e, "remote cancel failed");
                obs::emit_job_orphaned(id, handle);
            }
        }
    }

    /// Cancel a job that never got a slot (QUEUED or RETRYING).
    async fn cancel_waiting(&self, id: &CandidateId) -> Result<()> {
        let current = self.current(id)?;
        if matches!(current.state, JobState::Queued | JobState::Retrying) {
            self.settle(id, current.state, JobState::Cancelled, &mut |_| {})
                .await?;
        }
        Ok(())
    }

    /// Apply the retry policy to a FAILED job found at startup. Returns the
    /// job if it should be queued again.
    async fn recover_failed(&self, job: SimulationJob) -> Result<Option<SimulationJob>> {
        let kind = job
            .last_error
            .as_ref()
            .map(|e| e.kind)
            .unwrap_or(FailureKind::Interrupted);
        match self.policy.decide(kind, job.attempts, None) {
            RetryDecision::Retry { .. } => {
                let job = self.transition(job.id(), JobState::Failed, JobState::Retrying, &mut |_| {})?;
                Ok(Some(job))
            }
            RetryDecision::GiveUp(reason) => {
                let job = self
                    .store
                    .update_in_place(job.id(), JobState::Failed, &mut |j| j.retries_exhausted = true)?;
                obs::emit_job_gave_up(job.id(), kind, job.attempts, &reason.to_string());
                self.complete(job).await;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Schedules candidates against the remote simulation platform.
pub struct SimulationOrchestrator {
    store: Arc<dyn JobStateStore>,
    gateway: Arc<dyn SimulationGateway>,
    limiter: Arc<RateLimiter>,
    config: OrchestratorConfig,
}

impl SimulationOrchestrator {
    pub fn new(
        store: Arc<dyn JobStateStore>,
        gateway: Arc<dyn SimulationGateway>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.requests_per_minute, config.burst));
        Ok(Self {
            store,
            gateway,
            limiter,
            config,
        })
    }

    /// Share a limiter with other request paths.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Recover state left by an earlier process, then drain `source`.
    ///
    /// Returns once the source is exhausted and every job has settled, or
    /// once a stop has been requested and all in-flight work has wound down.
    #[instrument(skip_all, fields(max_concurrent = self.config.max_concurrent))]
    pub async fn run<S: CandidateSource>(
        &self,
        mut source: S,
        stop: StopHandle,
        completions: mpsc::Sender<SimulationJob>,
    ) -> Result<SchedulerSummary> {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent));
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            policy: self.config.retry_policy(),
            schedule: self.config.poll_schedule(),
            job_timeout: self.config.job_timeout(),
            completions,
            requeue: requeue_tx,
            stop: stop.clone(),
        });
        let mut workers: JoinSet<Result<Exit>> = JoinSet::new();
        let mut summary = SchedulerSummary::default();
        let mut stop_rx = stop.signal();
        // First error seen. Once set, nothing new starts and the run winds
        // down as if stopped, so no worker is detached mid-flight.
        let mut failure: Option<AlphaError> = None;

        let recovered = match reconcile(self.store.as_ref(), self.gateway.as_ref()).await {
            Ok(recovery) => {
                self.recover(recovery, &worker, &slots, &mut workers, &mut summary, &mut stop_rx)
                    .await
            }
            Err(e) => Err(e),
        };
        let mut ready = match recovered {
            Ok(ready) => ready,
            Err(e) => {
                Self::note_failure(&mut failure, &stop, e);
                VecDeque::new()
            }
        };

        let mut source_done = false;
        while failure.is_none() {
            while let Ok(id) = requeue_rx.try_recv() {
                ready.push_back(id);
            }
            if ready.is_empty() && source_done && workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop_rx.stopped() => break,
                Some(id) = requeue_rx.recv() => ready.push_back(id),
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = Self::record(&mut summary, joined) {
                        Self::note_failure(&mut failure, &stop, e);
                    }
                }
                permit = Arc::clone(&slots).acquire_owned(), if !ready.is_empty() || !source_done => {
                    let launched = match permit {
                        Ok(permit) => {
                            self.start_next(
                                permit,
                                &worker,
                                &mut ready,
                                &mut source,
                                &mut source_done,
                                &mut summary,
                                &mut stop_rx,
                                &mut workers,
                            )
                            .await
                        }
                        Err(e) => Err(AlphaError::Worker(e.to_string())),
                    };
                    match launched {
                        Ok(Launch::Started | Launch::Idle) => {}
                        Ok(Launch::Stopped) => break,
                        Err(e) => Self::note_failure(&mut failure, &stop, e),
                    }
                }
            }
        }

        if stop.is_stopped() {
            info!(queued = ready.len(), in_flight = workers.len(), "stop requested, winding down");
        }
        if let Err(e) = self
            .cancel_ready(&worker, &mut ready, &mut requeue_rx, &mut summary)
            .await
        {
            Self::note_failure(&mut failure, &stop, e);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = Self::record(&mut summary, joined) {
                Self::note_failure(&mut failure, &stop, e);
            }
        }
        // Retries whose backoff ended while we were draining.
        if let Err(e) = self
            .cancel_ready(&worker, &mut ready, &mut requeue_rx, &mut summary)
            .await
        {
            Self::note_failure(&mut failure, &stop, e);
        }

        info!(
            enqueued = summary.enqueued,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "scheduler finished"
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Keep the first error and stop the run so in-flight work is cancelled
    /// and drained rather than dropped.
    fn note_failure(failure: &mut Option<AlphaError>, stop: &StopHandle, e: AlphaError) {
        error!(error = %e, "scheduler error, winding down");
        stop.stop();
        failure.get_or_insert(e);
    }

    /// Take the next ready job, wait for a rate-limit token and spawn its
    /// attempt on `permit`.
    #[allow(clippy::too_many_arguments)]
    async fn start_next<S: CandidateSource>(
        &self,
        permit: OwnedSemaphorePermit,
        worker: &Arc<Worker>,
        ready: &mut VecDeque<CandidateId>,
        source: &mut S,
        source_done: &mut bool,
        summary: &mut SchedulerSummary,
        stop_rx: &mut StopSignal,
        workers: &mut JoinSet<Result<Exit>>,
    ) -> Result<Launch> {
        let Some(id) = self.next_ready(ready, source, source_done, summary)? else {
            return Ok(Launch::Idle);
        };
        tokio::select! {
            biased;
            _ = stop_rx.stopped() => {
                ready.push_front(id);
                return Ok(Launch::Stopped);
            }
            _ = self.limiter.acquire() => {}
        }
        let job = self.begin_attempt(worker, &id)?;
        let span = obs::job_span(&id);
        workers.spawn(Arc::clone(worker).attempt(job, permit).instrument(span));
        Ok(Launch::Started)
    }

    /// Apply startup recovery. Resumed jobs take slots immediately; the
    /// returned queue holds jobs to schedule, in enqueue order.
    async fn recover(
        &self,
        recovery: Recovery,
        worker: &Arc<Worker>,
        slots: &Arc<Semaphore>,
        workers: &mut JoinSet<Result<Exit>>,
        summary: &mut SchedulerSummary,
        stop_rx: &mut StopSignal,
    ) -> Result<VecDeque<CandidateId>> {
        summary.ingested = recovery.ingested.len();
        for job in recovery.ingested {
            summary.succeeded += 1;
            worker.complete(job).await;
        }

        let mut queue = recovery.ready;
        for job in recovery.failed {
            match worker.recover_failed(job).await? {
                Some(job) => queue.push(job),
                None => summary.failed += 1,
            }
        }
        queue.sort_by_key(|j| j.seq);

        summary.resumed = recovery.resume.len();
        for job in recovery.resume {
            let permit = tokio::select! {
                biased;
                _ = stop_rx.stopped() => None,
                permit = Arc::clone(slots).acquire_owned() => permit.ok(),
            };
            match permit {
                Some(permit) => {
                    // A resumed job gets a fresh timeout window.
                    let deadline = Instant::now() + worker.job_timeout;
                    let span = obs::job_span(job.id());
                    workers.spawn(
                        Arc::clone(worker)
                            .poll_until_done(job, permit, deadline)
                            .instrument(span),
                    );
                }
                None => {
                    if let Some(handle) = job.handle.as_ref() {
                        worker.cancel_remote(job.id(), handle).await;
                    }
                    worker
                        .settle(job.id(), JobState::Running, JobState::Cancelled, &mut |_| {})
                        .await?;
                    summary.cancelled += 1;
                }
            }
        }

        Ok(queue.into_iter().map(|j| j.id().clone()).collect())
    }

    /// Next job to start: the queue head, else a fresh candidate.
    fn next_ready<S: CandidateSource>(
        &self,
        ready: &mut VecDeque<CandidateId>,
        source: &mut S,
        source_done: &mut bool,
        summary: &mut SchedulerSummary,
    ) -> Result<Option<CandidateId>> {
        if let Some(id) = ready.pop_front() {
            return Ok(Some(id));
        }
        while !*source_done {
            match source.next_candidate() {
                None => *source_done = true,
                Some(candidate) => {
                    let (job, inserted) = self.store.insert_if_absent(SimulationJob::queued(candidate))?;
                    if inserted {
                        summary.enqueued += 1;
                        return Ok(Some(job.id().clone()));
                    }
                    summary.duplicates += 1;
                    debug!(candidate_id = %job.id().short(), state = %job.state, "duplicate candidate skipped");
                }
            }
        }
        Ok(None)
    }

    /// QUEUED or RETRYING -> SUBMITTING, counting the attempt.
    fn begin_attempt(&self, worker: &Worker, id: &CandidateId) -> Result<SimulationJob> {
        let current = worker.current(id)?;
        worker.transition(id, current.state, JobState::Submitting, &mut |j| {
            j.attempts += 1;
            j.handle = None;
        })
    }

    async fn cancel_ready(
        &self,
        worker: &Worker,
        ready: &mut VecDeque<CandidateId>,
        requeue_rx: &mut mpsc::UnboundedReceiver<CandidateId>,
        summary: &mut SchedulerSummary,
    ) -> Result<()> {
        while let Ok(id) = requeue_rx.try_recv() {
            ready.push_back(id);
        }
        let mut first = None;
        for id in ready.drain(..) {
            match worker.cancel_waiting(&id).await {
                Ok(()) => summary.cancelled += 1,
                Err(e) => {
                    warn!(candidate_id = %id.short(), error = %e, "could not cancel waiting job");
                    first.get_or_insert(e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn record(
        summary: &mut SchedulerSummary,
        joined: std::result::Result<Result<Exit>, tokio::task::JoinError>,
    ) -> Result<()> {
        match joined.map_err(|e| AlphaError::Worker(e.to_string()))?? {
            Exit::Settled(state) => summary.record(state),
            Exit::Requeued => {}
        }
        Ok(())
    }
}
