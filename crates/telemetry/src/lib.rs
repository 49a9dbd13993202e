#![forbid(unsafe_code)]

//! # w3f Telemetry
//!
//! Structured logging initialization for runner binaries and tests.

pub mod init;

pub use init::init_tracing;
