//! End-to-end run: schedule simulations, evaluate completions, submit
//! accepted alphas.
//!
//! The scheduler and the completion stage run concurrently, connected by a
//! bounded channel. The stage also picks up SUCCEEDED jobs an earlier run
//! never finished evaluating or submitting.

use std::sync::Arc;

use alpha_state::{JobState, JobStateStore, SimulationJob, SubmissionLedger, SubmissionState};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument};

use crate::config::PipelineConfig;
use crate::error::{AlphaError, Result};
use crate::evaluation::{evaluate, Thresholds};
use crate::gateway::SimulationGateway;
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::{SimulationOrchestrator, StopHandle};
use crate::rate_limit::RateLimiter;
use crate::report::RunReport;
use crate::source::CandidateSource;
use crate::submission::SubmissionManager;

/// Evaluates settled jobs and hands accepted ones to the submission manager.
struct CompletionStage {
    jobs: Arc<dyn JobStateStore>,
    ledger: Arc<dyn SubmissionLedger>,
    manager: Arc<SubmissionManager>,
    thresholds: Thresholds,
    dry_run: bool,
    stop: StopHandle,
}

impl CompletionStage {
    /// SUCCEEDED jobs still missing a verdict or a submission.
    fn backlog(&self) -> Result<Vec<SimulationJob>> {
        let mut pending = Vec::new();
        for job in self.jobs.in_state(JobState::Succeeded)? {
            let needs_work = match job.verdict.as_ref() {
                None => true,
                Some(v) if v.accepted && !self.dry_run => {
                    let record = self.ledger.get_submission(job.id())?;
                    record.map_or(true, |r| r.state == SubmissionState::NotSubmitted)
                }
                Some(_) => false,
            };
            if needs_work {
                pending.push(job);
            }
        }
        Ok(pending)
    }

    async fn consume(
        self: Arc<Self>,
        backlog: Vec<SimulationJob>,
        mut completions: mpsc::Receiver<SimulationJob>,
    ) -> Result<()> {
        let mut submissions: JoinSet<Result<()>> = JoinSet::new();
        for job in backlog {
            self.handle(job, &mut submissions)?;
        }
        while let Some(job) = completions.recv().await {
            self.handle(job, &mut submissions)?;
        }
        while let Some(joined) = submissions.join_next().await {
            joined.map_err(|e| AlphaError::Worker(e.to_string()))??;
        }
        Ok(())
    }

    fn handle(&self, job: SimulationJob, submissions: &mut JoinSet<Result<()>>) -> Result<()> {
        if job.state != JobState::Succeeded {
            return Ok(());
        }
        let job = match job.verdict {
            Some(_) => job,
            None => {
                let verdict = match evaluate(&job, &self.thresholds) {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        error!(candidate_id = %job.id().short(), error = %e, "evaluation failed");
                        return Ok(());
                    }
                };
                obs::emit_verdict_evaluated(job.id(), verdict.accepted, &verdict.reason);
                self.jobs.record_verdict(verdict)?
            }
        };

        let accepted = job.verdict.as_ref().is_some_and(|v| v.accepted);
        if !accepted || self.dry_run {
            return Ok(());
        }
        let manager = Arc::clone(&self.manager);
        let stop = self.stop.clone();
        submissions.spawn(async move { manager.submit(&job, &stop).await.map(|_| ()) });
        Ok(())
    }
}

/// Owns a store and a gateway and runs the whole flow against them.
pub struct Pipeline<S> {
    store: Arc<S>,
    gateway: Arc<dyn SimulationGateway>,
    config: PipelineConfig,
}

impl<S> Pipeline<S>
where
    S: JobStateStore + SubmissionLedger + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<dyn SimulationGateway>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            gateway,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drain `source` through simulation, evaluation and submission.
    ///
    /// Returns the report over the whole store once every job has settled
    /// or the stop request has been honoured.
    #[instrument(skip_all)]
    pub async fn run<C: CandidateSource>(&self, source: C, stop: StopHandle) -> Result<RunReport> {
        let started = Instant::now();
        let released = self.store.release_interrupted()?;
        if !released.is_empty() {
            info!(count = released.len(), "released interrupted submissions");
        }

        let orchestrator_config = &self.config.orchestrator;
        let limiter = Arc::new(RateLimiter::new(
            orchestrator_config.requests_per_minute,
            orchestrator_config.burst,
        ));
        let jobs: Arc<dyn JobStateStore> = self.store.clone();
        let ledger: Arc<dyn SubmissionLedger> = self.store.clone();

        let orchestrator = SimulationOrchestrator::new(
            Arc::clone(&jobs),
            Arc::clone(&self.gateway),
            orchestrator_config.clone(),
        )?
        .with_limiter(Arc::clone(&limiter));
        let manager = SubmissionManager::new(
            Arc::clone(&ledger),
            Arc::clone(&self.gateway),
            orchestrator_config.retry_policy(),
            &self.config.submission,
        )
        .with_limiter(limiter);

        let stage = Arc::new(CompletionStage {
            jobs,
            ledger,
            manager: Arc::new(manager),
            thresholds: self.config.thresholds.clone(),
            dry_run: self.config.submission.dry_run,
            stop: stop.clone(),
        });
        let backlog = stage.backlog()?;
        if !backlog.is_empty() {
            info!(count = backlog.len(), "resuming evaluation backlog");
        }

        let (tx, rx) = mpsc::channel(orchestrator_config.completion_buffer);
        let consumer = tokio::spawn(Arc::clone(&stage).consume(backlog, rx));
        let scheduled = orchestrator.run(source, stop, tx).await;
        let consumed = consumer
            .await
            .map_err(|e| AlphaError::Worker(e.to_string()))?;
        let summary = scheduled?;
        consumed?;

        // Submissions cut short by a stop go back to NOT_SUBMITTED.
        self.store.release_interrupted()?;

        let duration_ms = started.elapsed().as_millis() as u64;
        let report = RunReport::from_store(self.store.as_ref(), self.store.as_ref())?
            .with_run(duration_ms, summary);
        METRICS.flush();
        let t = &report.totals;
        obs::emit_run_finished(
            duration_ms,
            t.candidates,
            t.succeeded,
            t.failed,
            t.cancelled,
            t.submitted,
        );
        Ok(report)
    }
}
