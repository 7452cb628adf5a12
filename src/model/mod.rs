//! Core data model.
//!
//! A job is something that needs doing: a type that picks its handler, an
//! opaque payload, and a lifecycle status tracked by the job store.

pub mod job;

pub use job::{DEFAULT_JOB_TYPE, Job, JobId, NewJob, Status, SubmitResult};
