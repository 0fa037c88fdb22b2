//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cost;
pub mod extract;
pub mod gate;
pub mod metrics;
pub mod reconcile;
pub mod schema;
pub mod schemas;
pub mod state;
pub mod test_report;
pub mod types;
pub mod work_item;
