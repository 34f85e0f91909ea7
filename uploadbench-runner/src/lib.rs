//! A load generator measuring multipart upload latency against an object store.
//!
//! Every iteration uploads a fixed corpus of large blobs concurrently, classifies each upload
//! against a latency budget, and then purges the destination prefix so the next iteration starts
//! from a clean namespace.
//!
//! The moving parts, from the inside out:
//!
//! - [`planner`] splits a blob into the parts of a multipart upload.
//! - [`upload`] drives one blob through initiate, upload parts, complete, or abort.
//! - [`pool`] runs uploads with bounded concurrency and hands out handles to await them.
//! - [`collector`] classifies outcomes and summarizes an iteration.
//! - [`purge`] empties the destination prefix.
//! - [`benchmark`] ties them together into the repeating loop.
#![warn(missing_debug_implementations)]

pub mod benchmark;
pub mod blob;
pub mod cli;
pub mod collector;
pub mod config;
pub mod corpus;
pub mod observability;
pub mod planner;
pub mod pool;
pub mod purge;
pub mod upload;

pub use benchmark::{Benchmark, BenchmarkSettings, Target};
pub use blob::{Blob, BlobSource};
pub use collector::{IterationReport, OutcomeStatus, UploadOutcome, Verdict};
pub use pool::{ShutdownReport, UploadHandle, WorkerPool};
pub use upload::{UploadSettings, Uploader};
