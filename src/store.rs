//! Job store contract: durable job records keyed by id.
//!
//! Every transition is a single conditional update inside the store. Callers
//! never read, compare, and write back to change ownership.

use crate::error::Result;
use crate::model::job::{Job, JobId, Status};
use async_trait::async_trait;

/// Outcome of a conditional transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The precondition held and the new state is in place.
    Applied,
    /// The job is absent or no longer in the required state. Another actor
    /// owns or already finished it; the caller abandons silently.
    Conflict,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

impl From<bool> for Transition {
    fn from(applied: bool) -> Self {
        if applied {
            Transition::Applied
        } else {
            Transition::Conflict
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a job. `None` when the id is unknown.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Insert or overwrite a job record.
    async fn put(&self, job: &Job) -> Result<()>;

    /// PENDING -> IN_PROGRESS. Exactly one of any number of concurrent
    /// callers gets `Applied`.
    async fn claim(&self, id: &JobId) -> Result<Transition>;

    /// IN_PROGRESS -> COMPLETED. `Applied` again if already COMPLETED.
    async fn complete_success(&self, id: &JobId) -> Result<Transition>;

    /// IN_PROGRESS -> PENDING with the given attempt count.
    /// `Applied` again if already PENDING with the same count.
    async fn record_retry(&self, id: &JobId, attempts: u32) -> Result<Transition>;

    /// IN_PROGRESS -> FAILED with the given attempt count.
    /// `Applied` again if already FAILED with the same count.
    async fn record_terminal_failure(&self, id: &JobId, attempts: u32) -> Result<Transition>;

    /// Most recently created jobs first, optionally filtered by status.
    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>>;
}
