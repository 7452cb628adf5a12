//! Job handlers and the registry that routes job types to them.
//!
//! A handler is the opaque processing step. It only reports success or
//! failure; the worker decides what failure means for the job.

mod simulated;

pub use simulated::{FailureInjection, SimulatedWork};

use crate::model::job::{DEFAULT_JOB_TYPE, Job};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one attempt of `job`. `job.attempts` counts prior failures.
    async fn process(&self, job: &Job) -> Outcome;
}

/// Fallback for job types nobody registered. Fails every attempt, so the job
/// takes the normal retry path and ends up dead-lettered.
pub struct Unroutable;

#[async_trait]
impl Handler for Unroutable {
    async fn process(&self, job: &Job) -> Outcome {
        metrics::jobs_unroutable().add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
        Outcome::failed(format!("no handler registered for job type {:?}", job.job_type))
    }
}

/// Handlers indexed by job type, with a fallback for everything else.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl HandlerRegistry {
    /// No handlers; every job goes to [`Unroutable`].
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(Unroutable),
        }
    }

    /// `DEFAULT` jobs run simulated work of `work_duration`, honoring the
    /// `FAIL_ALWAYS` / `FAIL_TIMES=n` payload markers.
    pub fn with_defaults(work_duration: Duration) -> Self {
        Self::empty().register(
            DEFAULT_JOB_TYPE,
            FailureInjection::new(SimulatedWork::new(work_duration)),
        )
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn fallback(mut self, handler: impl Handler + 'static) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    /// Handler for `job_type`, or the fallback.
    pub fn resolve(&self, job_type: &str) -> Arc<dyn Handler> {
        self.handlers
            .get(job_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
