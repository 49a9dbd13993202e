#![forbid(unsafe_code)]

//! # w3f Protocol
//!
//! The framed message channel between the supervisor and the guest: one
//! `input_event` per run, answered by exactly one `output_event`. Messages
//! travel as JSON over a local HTTP endpoint mounted under a per-run random
//! path token.

pub mod client;
pub mod messages;

pub use client::{ProtocolClient, ProtocolError};
pub use messages::{ErrorData, ErrorObject, InputEvent, OutputEvent, ResultData, StartData};
