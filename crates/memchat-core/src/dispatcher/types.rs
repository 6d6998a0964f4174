//! ============================================================================
//! Dispatcher Types - Job rows persisted in the broker
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::memory::Role;

pub type JobId = u64;

/// Persist one utterance to the history store, then to vector memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberJob {
    pub text: String,
    pub user_id: Option<String>,
    pub role: Role,
    pub conversation_id: u64,
}

/// enqueued → running → {completed, failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Enqueued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enqueued" => Ok(JobState::Enqueued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("Unknown job state: {}", other)),
        }
    }
}

/// A job and its execution bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: RememberJob,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Success summary or failure reason of the last attempt
    pub outcome: Option<String>,
    /// Number of times the job was picked up
    pub attempts: u32,
}

/// What a worker reports back for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(String),
    Failed(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobOutcome::Completed(m) | JobOutcome::Failed(m) => m,
        }
    }
}

/// Broker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.enqueued + self.running + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_parse() {
        assert_eq!("Failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert_eq!("enqueued".parse::<JobState>().unwrap(), JobState::Enqueued);
        assert!("retrying".parse::<JobState>().is_err());
        assert!(JobState::Completed.is_finished());
        assert!(!JobState::Running.is_finished());
    }
}
