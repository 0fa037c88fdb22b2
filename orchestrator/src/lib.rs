//! Multi-provider consensus engine driving work items from issue to pull request.
//!
//! Every question the pipeline asks goes to several LLM providers at once;
//! their free-text replies are extracted into typed fields and reconciled
//! into one answer with a confidence score that gates each stage.
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, reconciliation,
//!   gates, the state machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (providers, the issue host, git,
//!   the test command, persisted state). Each sits behind a trait so tests
//!   can swap in fakes.
//!
//! [`stages`] implement the six pipeline steps on top of both; [`pipeline`]
//! drives one item through them and [`intake`] feeds it from the host.

pub mod core;
pub mod exit_codes;
pub mod intake;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod stages;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
