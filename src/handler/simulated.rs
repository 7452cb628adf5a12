//! Built-in handlers: simulated work and payload-driven failure injection.

use super::{Handler, Outcome};
use crate::model::job::Job;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const FAIL_ALWAYS: &str = "FAIL_ALWAYS";
const FAIL_TIMES_PREFIX: &str = "FAIL_TIMES=";

/// Sleeps for a fixed duration, then succeeds.
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Handler for SimulatedWork {
    async fn process(&self, job: &Job) -> Outcome {
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        debug!(job_id = %job.id, "simulated work done");
        Outcome::Succeeded
    }
}

/// What a payload asks the injector to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Injection {
    Always,
    LeadingAttempts(u32),
    None,
}

fn parse_injection(payload: &str) -> Injection {
    let payload = payload.trim();
    if payload == FAIL_ALWAYS {
        return Injection::Always;
    }
    match payload
        .strip_prefix(FAIL_TIMES_PREFIX)
        .and_then(|n| n.trim().parse::<u32>().ok())
    {
        Some(n) => Injection::LeadingAttempts(n),
        None => Injection::None,
    }
}

/// Test affordance. Payload `FAIL_ALWAYS` fails every attempt; `FAIL_TIMES=n`
/// fails while the job has fewer than `n` recorded attempts. Any other payload
/// runs the wrapped handler.
pub struct FailureInjection<H> {
    inner: H,
}

impl<H> FailureInjection<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for FailureInjection<H> {
    async fn process(&self, job: &Job) -> Outcome {
        match parse_injection(&job.payload) {
            Injection::Always => Outcome::failed("forced failure (FAIL_ALWAYS)"),
            Injection::LeadingAttempts(n) if job.attempts < n => Outcome::failed(format!(
                "forced failure {} of {n} (FAIL_TIMES)",
                job.attempts + 1
            )),
            _ => self.inner.process(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::NewJob;

    fn job_with(payload: &str, attempts: u32) -> Job {
        let mut job = Job::new(NewJob::new().payload(payload));
        job.attempts = attempts;
        job
    }

    #[test]
    fn parses_markers() {
        assert_eq!(parse_injection("FAIL_ALWAYS"), Injection::Always);
        assert_eq!(parse_injection("FAIL_TIMES=2"), Injection::LeadingAttempts(2));
        assert_eq!(parse_injection("FAIL_TIMES=x"), Injection::None);
        assert_eq!(parse_injection("hello"), Injection::None);
    }

    #[tokio::test]
    async fn fail_times_only_fails_leading_attempts() {
        let handler = FailureInjection::new(SimulatedWork::new(Duration::ZERO));
        assert!(!handler.process(&job_with("FAIL_TIMES=2", 0)).await.is_success());
        assert!(!handler.process(&job_with("FAIL_TIMES=2", 1)).await.is_success());
        assert!(handler.process(&job_with("FAIL_TIMES=2", 2)).await.is_success());
    }

    #[tokio::test]
    async fn fail_always_never_succeeds() {
        let handler = FailureInjection::new(SimulatedWork::new(Duration::ZERO));
        for attempts in 0..5 {
            assert!(!handler.process(&job_with("FAIL_ALWAYS", attempts)).await.is_success());
        }
    }
}
