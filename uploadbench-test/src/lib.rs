//! Test utilities for the upload benchmark.
//!
//! See the modules for all available utilities.

pub mod tracing;
