//! Language-model providers.
//!
//! A provider turns one prompt into one reply within a timeout. The only
//! built-in adapter is [`CommandProvider`], which pipes the prompt to a
//! configured CLI; anything else (HTTP clients, fakes) implements
//! [`Provider`] directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, instrument};

use crate::io::config::{OrchestratorConfig, ProviderConfig};
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Raw provider reply before pricing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    pub text: String,
    /// Prompt tokens, when the provider reports usage.
    pub input_tokens: Option<u64>,
    /// Completion tokens, when the provider reports usage.
    pub output_tokens: Option<u64>,
}

impl ProviderReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: None,
            output_tokens: None,
        }
    }
}

pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Blocking query. Implementations should give up once `timeout` elapses;
    /// the dispatcher stops waiting at that point either way.
    fn query(&self, prompt: &str, timeout: Duration) -> Result<ProviderReply>;
}

/// Provider backed by a CLI that reads the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    id: String,
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    output_limit_bytes: usize,
}

impl CommandProvider {
    pub fn new(id: impl Into<String>, argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            id: id.into(),
            argv,
            workdir: None,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &ProviderConfig, output_limit_bytes: usize) -> Self {
        Self::new(cfg.id.clone(), cfg.command.clone(), output_limit_bytes)
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Provider for CommandProvider {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip_all, fields(provider = %self.id))]
    fn query(&self, prompt: &str, timeout: Duration) -> Result<ProviderReply> {
        let cmd = command_from_argv(&self.argv, self.workdir.as_deref())?;
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.output_limit_bytes,
        )?;
        if output.timed_out {
            bail!("provider {} timed out after {}s", self.id, timeout.as_secs());
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            bail!(
                "provider {} exited with {:?}: {}",
                self.id,
                output.status.code(),
                stderr.trim()
            );
        }
        let text = output.stdout_text().trim().to_string();
        if text.is_empty() {
            bail!("provider {} returned an empty reply", self.id);
        }
        debug!(chars = text.len(), "provider replied");
        Ok(ProviderReply::text(text))
    }
}

/// One `CommandProvider` per `[[providers]]` entry, in configured order.
pub fn build_providers(cfg: &OrchestratorConfig) -> Vec<Arc<dyn Provider>> {
    cfg.providers
        .iter()
        .map(|p| {
            let provider = CommandProvider::from_config(p, cfg.dispatch.output_limit_bytes)
                .with_workdir(&cfg.workdir);
            Arc::new(provider) as Arc<dyn Provider>
        })
        .collect()
}
