//! The storage layer of the upload benchmark.
//!
//! This crate defines the [`Backend`] trait, the set of object storage operations the benchmark
//! drives: prefix listing, deletion, single-shot puts and the multipart upload protocol. The
//! orchestration logic is written once against this trait, and backends are swapped underneath:
//!
//! - [`S3CompatibleBackend`] talks to AWS S3 or a compatible service such as MinIO.
//! - [`InMemoryBackend`] keeps everything in process memory and can inject latency and failures,
//!   which makes it the backend of choice for tests and dry runs.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod backend;

pub use backend::*;
