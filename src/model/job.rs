//! Job record and lifecycle state.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job type used when a submission does not name one.
pub const DEFAULT_JOB_TYPE: &str = "DEFAULT";

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work. The authoritative copy lives in the job store; broker
/// structures only ever carry the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Classifier that selects the handler.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Opaque to everything except the handler.
    pub payload: String,

    pub status: Status,

    /// Failed processing attempts so far. Only a dead-letter requeue resets it.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh PENDING job from a submission.
    pub fn new(new: NewJob) -> Self {
        let now = Utc::now();
        let job_type = match new.job_type {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_JOB_TYPE.to_string(),
        };
        Self {
            id: JobId::new(),
            job_type,
            payload: new.payload.unwrap_or_default(),
            status: Status::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Newtype for job ids. Opaque strings; fresh ids are random UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting in the dispatch queue or the retry structure.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Handler succeeded. Terminal.
    Completed,
    /// Retries exhausted, id pushed to the dead-letter queue. Terminal.
    Failed,
}

impl Status {
    /// Is `self -> to` an edge the worker may take?
    ///
    /// Operator requeues reset status outside this graph.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Pending) // retry scheduled
                | (InProgress, Failed) // retries exhausted
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::InProgress => "IN_PROGRESS",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Status::Pending),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Builder for submitting a job. Both fields are optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub(crate) job_type: Option<String>,
    pub(crate) payload: Option<String>,
}

impl NewJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// What a submitter gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub job_id: JobId,
    pub status: Status,
}
