use std::collections::HashMap;
use std::path::Path;

use alpha_state::{
    FailureRecord, JobState, JobStateStore, SimulationJob, SubmissionLedger, SubmissionRecord,
    SubmissionState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestrator::SchedulerSummary;

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Verdict section of a candidate row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictSummary {
    pub accepted: bool,
    pub reason: String,
    pub sharpe: Option<f64>,
    pub fitness: Option<f64>,
    pub turnover: Option<f64>,
}

/// Submission section of a candidate row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionSummary {
    pub state: SubmissionState,
    pub confirmation_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<FailureRecord>,
}

/// One row per candidate, in enqueue order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateReport {
    pub candidate_id: String,
    pub expression: String,
    pub strategy_tag: String,
    pub region: String,
    pub universe: String,
    pub state: JobState,
    pub attempts: u32,
    pub last_failure: Option<FailureRecord>,
    pub alpha_id: Option<String>,
    pub verdict: Option<VerdictSummary>,
    pub submission: Option<SubmissionSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportTotals {
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs not yet settled (e.g. after a stop, or awaiting retry).
    pub pending: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub submitted: usize,
    pub submission_failed: usize,
}

/// End-of-run summary of every job and submission in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub scheduler: Option<SchedulerSummary>,
    pub totals: ReportTotals,
    pub candidates: Vec<CandidateReport>,
}

impl RunReport {
    /// Build a report from the current contents of the store.
    pub fn from_store(jobs: &dyn JobStateStore, ledger: &dyn SubmissionLedger) -> Result<Self> {
        let mut submissions: HashMap<_, SubmissionRecord> = ledger
            .all_submissions()?
            .into_iter()
            .map(|r| (r.candidate_id.clone(), r))
            .collect();

        let mut totals = ReportTotals::default();
        let mut candidates = Vec::new();
        for job in jobs.all()? {
            let submission = submissions.remove(job.id());
            tally(&mut totals, &job, submission.as_ref());
            candidates.push(row(job, submission));
        }

        Ok(Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            duration_ms: None,
            scheduler: None,
            totals,
            candidates,
        })
    }

    pub fn with_run(mut self, duration_ms: u64, scheduler: SchedulerSummary) -> Self {
        self.duration_ms = Some(duration_ms);
        self.scheduler = Some(scheduler);
        self
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Write the markdown rendering.
    pub fn write_markdown(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render_markdown())?;
        Ok(())
    }

    /// Render a markdown summary for operators.
    pub fn render_markdown(&self) -> String {
        let t = &self.totals;
        let mut out = String::new();
        out.push_str("# Alpha Run Report\n\n");
        out.push_str("## Totals\n");
        out.push_str(&format!(
            "- candidates: {}\n- succeeded: {}\n- failed: {}\n- cancelled: {}\n- pending: {}\n- accepted: {}\n- rejected: {}\n- submitted: {}\n- submission failed: {}\n",
            t.candidates,
            t.succeeded,
            t.failed,
            t.cancelled,
            t.pending,
            t.accepted,
            t.rejected,
            t.submitted,
            t.submission_failed
        ));
        if let Some(ms) = self.duration_ms {
            out.push_str(&format!("- duration: {:.1}s\n", ms as f64 / 1000.0));
        }

        if !self.candidates.is_empty() {
            out.push_str("\n## Candidates\n");
            out.push_str("| id | expression | state | attempts | verdict | submission |\n");
            out.push_str("|---|---|---|---|---|---|\n");
            for c in &self.candidates {
                let verdict = c.verdict.as_ref().map(|v| v.reason.as_str()).unwrap_or("-");
                let submission = c
                    .submission
                    .as_ref()
                    .map(|s| s.state.to_string())
                    .unwrap_or_else(|| "-".to_string());
                out.push_str(&format!(
                    "| `{}` | `{}` | {} | {} | {} | {} |\n",
                    short(&c.candidate_id),
                    c.expression.replace('|', "\\|"),
                    c.state,
                    c.attempts,
                    verdict,
                    submission
                ));
            }
        }

        let failures: Vec<_> = self
            .candidates
            .iter()
            .filter_map(|c| c.last_failure.as_ref().filter(|_| c.state == JobState::Failed).map(|f| (c, f)))
            .collect();
        if !failures.is_empty() {
            out.push_str("\n## Failures\n");
            for (c, f) in failures {
                out.push_str(&format!("- `{}` {}: {}\n", short(&c.candidate_id), f.kind, f.message));
            }
        }
        out
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn tally(totals: &mut ReportTotals, job: &SimulationJob, submission: Option<&SubmissionRecord>) {
    totals.candidates += 1;
    match job.state {
        JobState::Succeeded => totals.succeeded += 1,
        JobState::Failed if job.retries_exhausted => totals.failed += 1,
        JobState::Cancelled => totals.cancelled += 1,
        _ => totals.pending += 1,
    }
    match job.verdict.as_ref() {
        Some(v) if v.accepted => totals.accepted += 1,
        Some(_) => totals.rejected += 1,
        None => {}
    }
    match submission.map(|s| s.state) {
        Some(SubmissionState::Submitted) => totals.submitted += 1,
        Some(SubmissionState::Failed) => totals.submission_failed += 1,
        _ => {}
    }
}

fn row(job: SimulationJob, submission: Option<SubmissionRecord>) -> CandidateReport {
    let candidate = &job.candidate;
    CandidateReport {
        candidate_id: job.id().to_string(),
        expression: candidate.expression().to_string(),
        strategy_tag: candidate.strategy_tag().to_string(),
        region: candidate.region().to_string(),
        universe: candidate.universe().to_string(),
        state: job.state,
        attempts: job.attempts,
        last_failure: job.last_error.clone(),
        alpha_id: job.result.as_ref().and_then(|r| r.alpha_id.clone()),
        verdict: job.verdict.as_ref().map(|v| VerdictSummary {
            accepted: v.accepted,
            reason: v.reason.to_string(),
            sharpe: v.metrics.sharpe,
            fitness: v.metrics.fitness,
            turnover: v.metrics.turnover,
        }),
        submission: submission.map(|s| SubmissionSummary {
            state: s.state,
            confirmation_id: s.confirmation_id,
            attempts: s.attempts,
            last_error: s.last_error,
        }),
    }
}
