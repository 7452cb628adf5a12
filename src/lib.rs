//! # jobq
//!
//! Asynchronous job-processing pipeline. Submitted jobs are stored durably,
//! dispatched through a broker queue to a pool of workers, retried with
//! exponential backoff on failure, and dead-lettered once retries run out.
//!
//! Backends: Postgres (job rows + pgmq), Redis (broker, `redis` feature),
//! and in-memory implementations of both contracts.

pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod memory;
pub mod model;
pub mod service;
pub mod store;
pub mod telemetry;
