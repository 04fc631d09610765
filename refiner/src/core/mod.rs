//! Deterministic, pure logic shared by the refinement core.
//!
//! Core modules must be free of I/O side effects (the budget's sleep aside).
//! They operate on in-memory data and return deterministic outputs suitable
//! for tests.

pub mod backoff;
pub mod budget;
pub mod conclusion;
pub mod policy;
pub mod tool_request;
pub mod types;
