//! Deterministic, pure logic shared by the loop core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decision;
pub mod delta;
pub mod stats;
pub mod status;
pub mod types;
pub mod verdict;
