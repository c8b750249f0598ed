//! Integration tests for logged datasets.
//!
//! These tests drive a whole dataset session through the public API:
//! define, stage writes, flush at the collective points, close and
//! reopen. Unit tests in the crates cover the log format, the flush
//! engine and the request table in isolation.

#[path = "../common/mod.rs"]
mod common;

mod lifecycle;
mod scenarios;
