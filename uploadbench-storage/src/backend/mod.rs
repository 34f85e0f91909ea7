mod common;
mod in_memory;
mod s3_compatible;

pub use common::*;
pub use in_memory::{CallCounts, InMemoryBackend, Latency};
pub use s3_compatible::{S3CompatibleBackend, S3CompatibleConfig};
