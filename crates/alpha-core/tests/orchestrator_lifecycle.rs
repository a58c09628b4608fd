//! Simulation lifecycle tests against the scripted gateway, on paused time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alpha_core::fakes::ScriptedGateway;
use alpha_core::{
    GatewayError, IterSource, OrchestratorConfig, PollStatus, SchedulerSummary,
    SimulationOrchestrator, StopHandle,
};
use alpha_state::{
    Candidate, CandidateId, EvaluationVerdict, FailureKind, JobHandle, JobState, JobStateStore,
    MemoryStateStore, SimulationJob, SimulationSettings, StoreError, StoreResult,
};
use tokio::sync::mpsc;

fn candidate(expr: &str) -> Candidate {
    Candidate::new(expr, SimulationSettings::default(), "lifecycle")
}

fn candidates(n: usize) -> Vec<Candidate> {
    (0..n).map(|i| candidate(&format!("ts_mean(close, {})", i + 2))).collect()
}

fn config(max_concurrent: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent,
        max_attempts: 3,
        retry_base_ms: 1_000,
        retry_max_ms: 8_000,
        retry_jitter: 0.0,
        poll_base_ms: 1_000,
        poll_max_ms: 5_000,
        poll_jitter: 0.0,
        job_timeout_ms: 600_000,
        requests_per_minute: 600,
        burst: 10,
        completion_buffer: 16,
    }
}

fn orchestrator(
    store: &Arc<MemoryStateStore>,
    gateway: &Arc<ScriptedGateway>,
    config: OrchestratorConfig,
) -> SimulationOrchestrator {
    SimulationOrchestrator::new(store.clone(), gateway.clone(), config).unwrap()
}

/// Run to completion while collecting every settled job.
async fn drive(
    orchestrator: &SimulationOrchestrator,
    candidates: Vec<Candidate>,
    stop: StopHandle,
) -> (SchedulerSummary, Vec<SimulationJob>) {
    let (tx, mut rx) = mpsc::channel(4);
    let collect = async move {
        let mut settled = Vec::new();
        while let Some(job) = rx.recv().await {
            settled.push(job);
        }
        settled
    };
    let (summary, settled) = tokio::join!(orchestrator.run(IterSource::new(candidates), stop, tx), collect);
    (summary.unwrap(), settled)
}

fn job(store: &MemoryStateStore, c: &Candidate) -> SimulationJob {
    store.get(c.id()).unwrap().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_every_candidate_settles_exactly_once() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(2);
    let orch = orchestrator(&store, &gateway, config(3));

    let batch = candidates(10);
    let (summary, settled) = drive(&orch, batch.clone(), StopHandle::new()).await;

    assert_eq!(summary.enqueued, 10);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(settled.len(), 10);
    let ids: HashSet<_> = settled.iter().map(|j| j.id().clone()).collect();
    assert_eq!(ids.len(), 10, "each job is reported once");

    for c in &batch {
        let job = job(&store, c);
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 1);
        assert!(job.result.is_some());
        assert_eq!(gateway.submit_calls(c), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_never_exceeds_limit() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(3);
    gateway.set_submit_latency(Duration::from_millis(300));
    let orch = orchestrator(&store, &gateway, config(3));

    drive(&orch, candidates(12), StopHandle::new()).await;

    assert!(gateway.max_in_flight() <= 3, "peak was {}", gateway.max_in_flight());
    assert_eq!(gateway.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_candidates_are_simulated_once() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let orch = orchestrator(&store, &gateway, config(2));

    let c = candidate("rank(close)");
    let (summary, settled) = drive(&orch, vec![c.clone(), c.clone(), c.clone()], StopHandle::new()).await;

    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(settled.len(), 1);
    assert_eq!(gateway.submit_calls(&c), 1);
    assert_eq!(store.all().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_succeeds() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(volume)");
    gateway.script_submit(
        &c,
        vec![
            Err(GatewayError::RateLimited { retry_after: None }),
            Err(GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok(()),
        ],
    );
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 3);
    assert_eq!(gateway.submit_calls(&c), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submit_is_not_retried() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(closee)");
    gateway.script_submit(&c, vec![Err(GatewayError::Rejected("unknown field closee".into()))]);
    let orch = orchestrator(&store, &gateway, config(1));

    let (summary, _) = drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert!(job.retries_exhausted);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Rejected);
    assert_eq!(summary.failed, 1);
    assert_eq!(gateway.submit_calls(&c), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_never_exceed_budget() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(open)");
    gateway.script_submit(
        &c,
        (0..6).map(|_| Err(GatewayError::Transport("connection reset".into()))).collect(),
    );
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert!(job.retries_exhausted);
    assert_eq!(job.attempts, 3);
    assert_eq!(gateway.submit_calls(&c), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_is_terminal() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(high)");
    gateway.script_polls(&c, vec![Ok(PollStatus::Failed("simulation error".into()))]);
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::RemoteFailed);
}

#[tokio::test(start_paused = true)]
async fn test_lost_handle_is_resubmitted() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(low)");
    gateway.script_polls(&c, vec![Ok(PollStatus::NotFound)]);
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(gateway.submit_calls(&c), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_keep_polling() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(vwap)");
    gateway.script_polls(
        &c,
        vec![
            Err(GatewayError::Transport("timeout".into())),
            Err(GatewayError::RateLimited { retry_after: None }),
        ],
    );
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 1);
    assert_eq!(gateway.submit_calls(&c), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_job_times_out_and_is_cancelled() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(u32::MAX);
    let c = candidate("rank(returns)");
    let orch = orchestrator(
        &store,
        &gateway,
        OrchestratorConfig {
            max_attempts: 1,
            job_timeout_ms: 60_000,
            ..config(1)
        },
    );

    let started = tokio::time::Instant::now();
    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(gateway.cancel_calls().len(), 1);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(70));
}

#[tokio::test(start_paused = true)]
async fn test_slow_submit_counts_against_job_timeout() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_submit_latency(Duration::from_secs(55));
    gateway.set_running_polls(u32::MAX);
    let c = candidate("rank(ebitda)");
    let orch = orchestrator(
        &store,
        &gateway,
        OrchestratorConfig {
            max_attempts: 1,
            job_timeout_ms: 60_000,
            ..config(1)
        },
    );

    let started = tokio::time::Instant::now();
    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(61),
        "job outlived its timeout: {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn test_submit_hanging_past_timeout_fails_attempt() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_submit_latency(Duration::from_secs(120));
    let c = candidate("rank(fcf)");
    let orch = orchestrator(
        &store,
        &gateway,
        OrchestratorConfig {
            max_attempts: 1,
            job_timeout_ms: 60_000,
            ..config(1)
        },
    );

    let started = tokio::time::Instant::now();
    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_cancel_leaves_remote_job_orphaned() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::without_cancel());
    gateway.set_running_polls(u32::MAX);
    let c = candidate("rank(cap)");
    let orch = orchestrator(
        &store,
        &gateway,
        OrchestratorConfig {
            max_attempts: 1,
            job_timeout_ms: 30_000,
            ..config(1)
        },
    );

    drive(&orch, vec![c.clone()], StopHandle::new()).await;

    assert_eq!(job(&store, &c).state, JobState::Failed);
    assert!(gateway.cancel_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_queued_and_running_jobs() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(u32::MAX);
    let orch = orchestrator(&store, &gateway, config(2));

    let stop = StopHandle::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stopper.stop();
    });
    let (summary, settled) = drive(&orch, candidates(6), stop).await;

    let jobs = store.all().unwrap();
    assert_eq!(jobs.len(), 2, "no candidates are pulled beyond the running ones");
    assert!(jobs.iter().all(|j| j.state == JobState::Cancelled));
    assert_eq!(summary.cancelled, 2);
    assert_eq!(settled.len(), 2);
    assert_eq!(gateway.cancel_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_backoff_cancels_retrying_job() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(sales)");
    gateway.script_submit(&c, vec![Err(GatewayError::Transport("down".into()))]);
    let orch = orchestrator(
        &store,
        &gateway,
        OrchestratorConfig {
            retry_base_ms: 30_000,
            retry_max_ms: 60_000,
            ..config(1)
        },
    );

    let stop = StopHandle::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        stopper.stop();
    });
    drive(&orch, vec![c.clone()], stop).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(gateway.submit_calls(&c), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_in_enqueue_order() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(1);
    let orch = orchestrator(&store, &gateway, config(1));

    let batch = candidates(4);
    let (_, settled) = drive(&orch, batch.clone(), StopHandle::new()).await;

    let order: Vec<_> = settled.iter().map(|j| j.id().clone()).collect();
    let expected: Vec<_> = batch.iter().map(|c| c.id().clone()).collect();
    assert_eq!(order, expected);
}

#[tokio::test(start_paused = true)]
async fn test_restart_ingests_finished_remote_job_without_resubmitting() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(ebit)");
    store.insert_if_absent(SimulationJob::queued(c.clone())).unwrap();
    store
        .compare_and_transition(c.id(), &[JobState::Queued], JobState::Submitting, &mut |j| {
            j.attempts = 1
        })
        .unwrap();
    store
        .compare_and_transition(c.id(), &[JobState::Submitting], JobState::Running, &mut |j| {
            j.handle = Some(JobHandle("sim/earlier".into()))
        })
        .unwrap();
    gateway.register_handle(&c, JobHandle("sim/earlier".into()));
    let orch = orchestrator(&store, &gateway, config(2));

    let (summary, settled) = drive(&orch, Vec::new(), StopHandle::new()).await;

    assert_eq!(summary.ingested, 1);
    assert_eq!(settled.len(), 1);
    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 1);
    assert_eq!(gateway.submit_calls(&c), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_polling_running_job() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_running_polls(3);
    let c = candidate("rank(assets)");
    store.insert_if_absent(SimulationJob::queued(c.clone())).unwrap();
    store
        .compare_and_transition(c.id(), &[JobState::Queued], JobState::Submitting, &mut |j| {
            j.attempts = 1;
            j.handle = Some(JobHandle("sim/live".into()));
        })
        .unwrap();
    gateway.register_handle(&c, JobHandle("sim/live".into()));
    let orch = orchestrator(&store, &gateway, config(2));

    let (summary, _) = drive(&orch, Vec::new(), StopHandle::new()).await;

    assert_eq!(summary.resumed, 1);
    assert_eq!(job(&store, &c).state, JobState::Succeeded);
    assert_eq!(gateway.submit_calls(&c), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_retries_interrupted_submission() {
    let store = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let c = candidate("rank(debt)");
    store.insert_if_absent(SimulationJob::queued(c.clone())).unwrap();
    store
        .compare_and_transition(c.id(), &[JobState::Queued], JobState::Submitting, &mut |j| {
            j.attempts = 1
        })
        .unwrap();
    let orch = orchestrator(&store, &gateway, config(1));

    drive(&orch, Vec::new(), StopHandle::new()).await;

    let job = job(&store, &c);
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(gateway.submit_calls(&c), 1);
}

/// Memory store that refuses to record one job as RUNNING.
struct BrokenRunningStore {
    inner: MemoryStateStore,
    broken: CandidateId,
}

impl JobStateStore for BrokenRunningStore {
    fn insert_if_absent(&self, job: SimulationJob) -> StoreResult<(SimulationJob, bool)> {
        self.inner.insert_if_absent(job)
    }

    fn get(&self, id: &CandidateId) -> StoreResult<Option<SimulationJob>> {
        self.inner.get(id)
    }

    fn compare_and_transition(
        &self,
        id: &CandidateId,
        expected: &[JobState],
        next: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        if *id == self.broken && next == JobState::Running {
            return Err(StoreError::Poisoned);
        }
        self.inner.compare_and_transition(id, expected, next, update)
    }

    fn update_in_place(
        &self,
        id: &CandidateId,
        expected: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        self.inner.update_in_place(id, expected, update)
    }

    fn record_verdict(&self, verdict: EvaluationVerdict) -> StoreResult<SimulationJob> {
        self.inner.record_verdict(verdict)
    }

    fn in_state(&self, state: JobState) -> StoreResult<Vec<SimulationJob>> {
        self.inner.in_state(state)
    }

    fn all(&self) -> StoreResult<Vec<SimulationJob>> {
        self.inner.all()
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_error_cancels_other_in_flight_jobs() {
    let broken = candidate("rank(bad_store)");
    let healthy = candidate("rank(good_store)");
    let store = Arc::new(BrokenRunningStore {
        inner: MemoryStateStore::new(),
        broken: broken.id().clone(),
    });
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.set_submit_latency(Duration::from_secs(1));
    gateway.set_running_polls(u32::MAX);
    let orch = SimulationOrchestrator::new(store.clone(), gateway.clone(), config(2)).unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let collect = async move {
        let mut settled = Vec::new();
        while let Some(job) = rx.recv().await {
            settled.push(job);
        }
        settled
    };
    let (result, settled) = tokio::join!(
        orch.run(
            IterSource::new(vec![broken.clone(), healthy.clone()]),
            StopHandle::new(),
            tx
        ),
        collect
    );

    assert!(result.is_err(), "store failure is reported");
    let survivor = store.get(healthy.id()).unwrap().unwrap();
    assert_eq!(survivor.state, JobState::Cancelled, "in-flight job was wound down");
    assert_eq!(gateway.cancel_calls().len(), 1, "remote job was cancelled");
    assert!(settled.iter().any(|j| j.id() == healthy.id()));
}
