//! Deterministic, pure logic shared by the repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! strings and return deterministic outputs suitable for tests.

pub mod error;
pub mod extract;
pub mod types;
pub mod validate;
