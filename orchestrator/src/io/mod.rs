//! I/O helpers: configuration, providers, host, workspace and persistence.

pub mod config;
pub mod dispatch;
pub mod git;
pub mod host;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod stage_log;
pub mod test_runner;
pub mod workspace;
