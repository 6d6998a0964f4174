//! ============================================================================
//! JobQueue - Durable job table (redb broker)
//! ============================================================================
//! Every job is committed here before it is handed to a worker, so anything
//! left enqueued or running when the process stops is delivered again on the
//! next start.
//! ============================================================================

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::{JobId, JobOutcome, JobRecord, JobState, QueueStats, RememberJob};
use crate::db::{commit, decode, encode, next_id, open_table};
use crate::error::{MemchatError, Result};

const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const JOB_SEQ: &str = "job_seq";

/// Broker backed by a single redb file
pub struct JobQueue {
    db: Database,
    path: PathBuf,
}

impl JobQueue {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening job broker at: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemchatError::storage("Failed to create broker directory", e))?;
        }

        let db = Database::create(path)
            .map_err(|e| MemchatError::storage("Failed to open job broker", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| MemchatError::storage("Failed to begin write", e))?;
        {
            open_table(&write_txn, JOBS)?;
            open_table(&write_txn, COUNTERS)?;
        }
        commit(write_txn)?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commit a new job in the `enqueued` state
    pub fn enqueue(&self, job: RememberJob) -> Result<JobId> {
        let write_txn = self.begin_write()?;
        let id = {
            let mut counters = open_table(&write_txn, COUNTERS)?;
            let id = next_id(&mut counters, JOB_SEQ)?;
            let record = JobRecord {
                id,
                job,
                state: JobState::Enqueued,
                enqueued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                outcome: None,
                attempts: 0,
            };
            let mut jobs = open_table(&write_txn, JOBS)?;
            jobs.insert(id, encode(&record)?.as_slice())
                .map_err(|e| MemchatError::storage("Failed to insert job", e))?;
            id
        };
        commit(write_txn)?;

        debug!("Enqueued job {}", id);
        Ok(id)
    }

    /// Claim a job for execution.
    ///
    /// Returns `None` when the job is unknown or already finished, so a job
    /// delivered twice only runs once per start.
    pub fn mark_running(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.update(id, |record| {
            if record.state.is_finished() || record.state == JobState::Running {
                return false;
            }
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
            record.attempts += 1;
            true
        })
    }

    /// Record the terminal state of an attempt
    pub fn mark_finished(&self, id: JobId, outcome: &JobOutcome) -> Result<Option<JobRecord>> {
        self.update(id, |record| {
            record.state = outcome.state();
            record.finished_at = Some(Utc::now());
            record.outcome = Some(outcome.message().to_string());
            true
        })
    }

    fn update(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut JobRecord) -> bool,
    ) -> Result<Option<JobRecord>> {
        let write_txn = self.begin_write()?;
        let updated = {
            let mut jobs = open_table(&write_txn, JOBS)?;
            let current: Option<JobRecord> = jobs
                .get(id)
                .map_err(|e| MemchatError::storage("Failed to get job", e))?
                .map(|v| decode(v.value()))
                .transpose()?;

            match current {
                Some(mut record) => {
                    if apply(&mut record) {
                        jobs.insert(id, encode(&record)?.as_slice())
                            .map_err(|e| MemchatError::storage("Failed to update job", e))?;
                        Some(record)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        commit(write_txn)?;
        Ok(updated)
    }

    pub fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let read_txn = self.begin_read()?;
        let table = read_txn
            .open_table(JOBS)
            .map_err(|e| MemchatError::storage("Failed to open jobs table", e))?;

        match table
            .get(id)
            .map_err(|e| MemchatError::storage("Failed to get job", e))?
        {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// All jobs in id order, optionally restricted to one state
    pub fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        let read_txn = self.begin_read()?;
        let table = read_txn
            .open_table(JOBS)
            .map_err(|e| MemchatError::storage("Failed to open jobs table", e))?;

        let mut results = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| MemchatError::storage("Failed to iterate jobs", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemchatError::storage("Failed to read entry", e))?;
            let record: JobRecord = decode(value.value())?;
            if state.map_or(true, |s| record.state == s) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Jobs to redeliver after a restart.
    ///
    /// Jobs caught `running` are put back to `enqueued` in the same
    /// transaction; the result holds every unfinished job id in order.
    pub fn recoverable(&self) -> Result<Vec<JobId>> {
        let write_txn = self.begin_write()?;
        let ids = {
            let mut jobs = open_table(&write_txn, JOBS)?;

            let mut pending = Vec::new();
            let mut interrupted = Vec::new();
            for entry in jobs
                .iter()
                .map_err(|e| MemchatError::storage("Failed to iterate jobs", e))?
            {
                let (_key, value) =
                    entry.map_err(|e| MemchatError::storage("Failed to read entry", e))?;
                let record: JobRecord = decode(value.value())?;
                match record.state {
                    JobState::Enqueued => pending.push(record.id),
                    JobState::Running => {
                        pending.push(record.id);
                        interrupted.push(record);
                    }
                    JobState::Completed | JobState::Failed => {}
                }
            }

            for mut record in interrupted {
                record.state = JobState::Enqueued;
                record.started_at = None;
                jobs.insert(record.id, encode(&record)?.as_slice())
                    .map_err(|e| MemchatError::storage("Failed to reset job", e))?;
            }
            pending
        };
        commit(write_txn)?;

        if !ids.is_empty() {
            info!("Recovered {} unfinished jobs", ids.len());
        }
        Ok(ids)
    }

    /// Delete finished jobs that ended before `cutoff`; returns how many
    /// matched. With `dry_run` nothing is deleted.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>, dry_run: bool) -> Result<usize> {
        let expired: Vec<JobId> = self
            .list(None)?
            .into_iter()
            .filter(|r| r.state.is_finished() && r.finished_at.map_or(false, |t| t < cutoff))
            .map(|r| r.id)
            .collect();

        if dry_run || expired.is_empty() {
            return Ok(expired.len());
        }

        let write_txn = self.begin_write()?;
        {
            let mut jobs = open_table(&write_txn, JOBS)?;
            for id in &expired {
                jobs.remove(*id)
                    .map_err(|e| MemchatError::storage("Failed to remove job", e))?;
            }
        }
        commit(write_txn)?;

        info!("Pruned {} finished jobs", expired.len());
        Ok(expired.len())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for record in self.list(None)? {
            match record.state {
                JobState::Enqueued => stats.enqueued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    fn begin_write(&self) -> Result<redb::WriteTransaction> {
        self.db
            .begin_write()
            .map_err(|e| MemchatError::storage("Failed to begin write", e))
    }

    fn begin_read(&self) -> Result<redb::ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| MemchatError::storage("Failed to begin read", e))
    }
}
