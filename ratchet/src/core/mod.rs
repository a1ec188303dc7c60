//! Deterministic, pure logic shared by the executor and the ratchet nodes.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod gates;
pub mod ids;
pub mod invariants;
pub mod scope;
pub mod types;
