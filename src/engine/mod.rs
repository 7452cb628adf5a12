//! Processing engine: worker loops and the retry promoter.

pub mod backoff;
pub mod promoter;
pub mod worker;

pub use backoff::Backoff;
pub use promoter::{PromoterConfig, RetryPromoter};
pub use worker::{ProcessOutcome, Worker, WorkerConfig};
