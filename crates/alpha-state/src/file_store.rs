//! Snapshot-backed state store
//!
//! Every mutation is applied to a staged copy of the in-memory
//! `MemoryStateStore`, written through to a single JSON file, and only then
//! swapped in. Writes go to a
//! temp file in the same directory and are renamed into place, so a crash
//! leaves either the previous or the new snapshot on disk, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::candidate::CandidateId;
use crate::error::StoreError;
use crate::job::{EvaluationVerdict, JobState, SimulationJob};
use crate::memory::{MemoryStateStore, StoreSnapshot};
use crate::storage_traits::*;
use crate::submission::{SubmissionRecord, SubmissionState};

/// Durable store that survives process restarts.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: MemoryStateStore,
    /// Serializes mutate-then-persist so snapshots hit disk in mutation order.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open `path`, loading an existing snapshot or starting empty.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let state = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
                debug!(
                    path = %path.display(),
                    jobs = snapshot.jobs.len(),
                    submissions = snapshot.submissions.len(),
                    "loaded state snapshot"
                );
                MemoryStateStore::from_snapshot(snapshot)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryStateStore::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(Self {
            path,
            state,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Run a mutation against a staged copy, write it to disk, and only then
    /// make it visible. A failed write leaves memory and disk unchanged.
    fn write_through<T>(&self, op: impl FnOnce(&MemoryStateStore) -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self.write_lock.lock()?;
        let staged = MemoryStateStore::from_snapshot(self.state.snapshot()?)?;
        let out = op(&staged)?;
        self.persist(&staged.snapshot()?)?;
        self.state.replace_with(staged)?;
        Ok(out)
    }
}

impl JobStateStore for FileStateStore {
    fn insert_if_absent(&self, job: SimulationJob) -> StoreResult<(SimulationJob, bool)> {
        self.write_through(|s| s.insert_if_absent(job))
    }

    fn get(&self, id: &CandidateId) -> StoreResult<Option<SimulationJob>> {
        self.state.get(id)
    }

    fn compare_and_transition(
        &self,
        id: &CandidateId,
        expected: &[JobState],
        next: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        self.write_through(|s| s.compare_and_transition(id, expected, next, update))
    }

    fn update_in_place(
        &self,
        id: &CandidateId,
        expected: JobState,
        update: &mut dyn FnMut(&mut SimulationJob),
    ) -> StoreResult<SimulationJob> {
        self.write_through(|s| s.update_in_place(id, expected, update))
    }

    fn record_verdict(&self, verdict: EvaluationVerdict) -> StoreResult<SimulationJob> {
        self.write_through(|s| s.record_verdict(verdict))
    }

    fn in_state(&self, state: JobState) -> StoreResult<Vec<SimulationJob>> {
        self.state.in_state(state)
    }

    fn all(&self) -> StoreResult<Vec<SimulationJob>> {
        self.state.all()
    }
}

impl SubmissionLedger for FileStateStore {
    fn claim(&self, id: &CandidateId) -> StoreResult<Claim> {
        self.write_through(|s| s.claim(id))
    }

    fn update_submission(
        &self,
        id: &CandidateId,
        next: SubmissionState,
        update: &mut dyn FnMut(&mut SubmissionRecord),
    ) -> StoreResult<SubmissionRecord> {
        self.write_through(|s| s.update_submission(id, next, update))
    }

    fn release_interrupted(&self) -> StoreResult<Vec<SubmissionRecord>> {
        self.write_through(|s| s.release_interrupted())
    }

    fn reset_failed(&self, id: &CandidateId) -> StoreResult<SubmissionRecord> {
        self.write_through(|s| s.reset_failed(id))
    }

    fn get_submission(&self, id: &CandidateId) -> StoreResult<Option<SubmissionRecord>> {
        self.state.get_submission(id)
    }

    fn all_submissions(&self) -> StoreResult<Vec<SubmissionRecord>> {
        self.state.all_submissions()
    }
}
