//! Work-item registry persisted as one JSON snapshot.
//!
//! The registry owns every [`WorkItem`]. Items change only through
//! [`WorkRegistry::update`], which checks the transition table, stamps
//! `updated_at`, appends history and writes the snapshot atomically before
//! returning.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::state::{Event, WorkState, next_state};
use crate::core::work_item::{StageEntry, StageOutcome, Transition, WorkItem, WorkKind, work_key};
use crate::io::config::write_atomic;

pub const STATE_VERSION: u32 = 1;

const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/work_state.schema.json"
));

/// On-disk layout: `{version, work_items: {"kind:id": item}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub work_items: BTreeMap<String, WorkItem>,
}

#[derive(Debug, Clone, PartialEq)]
enum ErrorChange {
    Keep,
    Set(String),
    Clear,
}

/// One atomic change to a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUpdate {
    transition: Option<(Event, String)>,
    outcome: Option<StageOutcome>,
    error: ErrorChange,
    retry: bool,
    fix_attempt: bool,
    metadata: BTreeMap<String, Value>,
}

impl Default for WorkUpdate {
    fn default() -> Self {
        Self {
            transition: None,
            outcome: None,
            error: ErrorChange::Keep,
            retry: false,
            fix_attempt: false,
            metadata: BTreeMap::new(),
        }
    }
}

impl WorkUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(mut self, event: Event, reason: impl Into<String>) -> Self {
        self.transition = Some((event, reason.into()));
        self
    }

    /// Append a stage outcome; its artifacts are merged into metadata.
    pub fn outcome(mut self, outcome: StageOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = ErrorChange::Set(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = ErrorChange::Clear;
        self
    }

    /// Count one more failed attempt of the current stage.
    pub fn retry(mut self) -> Self {
        self.retry = true;
        self
    }

    pub fn fix_attempt(mut self) -> Self {
        self.fix_attempt = true;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Result of [`WorkRegistry::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    /// Already past `pending`; nothing changed.
    AlreadyTracked(WorkState),
    /// The in-progress cap is reached; the item stays `pending`.
    AtCapacity,
}

#[derive(Debug, Clone, Default)]
pub struct WorkRegistry {
    /// `None` keeps the registry in memory only.
    path: Option<PathBuf>,
    items: BTreeMap<String, WorkItem>,
}

impl WorkRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path`, or start empty when it does not exist yet.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        let mut registry = Self {
            path: Some(path.to_path_buf()),
            items: BTreeMap::new(),
        };
        if path.exists() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            registry.items = parse_snapshot(&contents)
                .with_context(|| format!("load state {}", path.display()))?;
            debug!(items = registry.items.len(), "state loaded");
        }
        Ok(registry)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&WorkItem> {
        self.items.get(key)
    }

    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Track a new item in `pending`.
    pub fn add(
        &mut self,
        kind: WorkKind,
        id: &str,
        metadata: BTreeMap<String, Value>,
    ) -> Result<&WorkItem> {
        let key = work_key(kind, id);
        if self.items.contains_key(&key) {
            bail!("work item {key} already exists");
        }
        let mut item = WorkItem::new(kind, id, Utc::now());
        item.metadata = metadata;
        self.items.insert(key.clone(), item);
        self.save()?;
        info!(item = %key, "work item added");
        self.items
            .get(&key)
            .ok_or_else(|| anyhow!("work item {key} vanished after insert"))
    }

    /// The single mutation path for work items.
    ///
    /// The transition is checked before anything changes, so a rejected event
    /// leaves the item exactly as it was.
    pub fn update(&mut self, key: &str, update: WorkUpdate) -> Result<&WorkItem> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown work item {key}"))?;
        let now = Utc::now();

        let transition = match &update.transition {
            Some((event, reason)) => {
                let to = next_state(item.state, *event)
                    .with_context(|| format!("update {key}"))?;
                Some(Transition {
                    from: item.state,
                    to,
                    at: now,
                    reason: reason.clone(),
                })
            }
            None => None,
        };

        if let Some(outcome) = update.outcome {
            let attempt = item.attempts(outcome.stage) + 1;
            for (k, v) in &outcome.artifacts {
                item.metadata.insert(k.clone(), v.clone());
            }
            item.outcomes.push(StageEntry {
                at: now,
                attempt,
                outcome,
            });
        }
        item.metadata.extend(update.metadata);
        match update.error {
            ErrorChange::Keep => {}
            ErrorChange::Set(message) => item.error = Some(message),
            ErrorChange::Clear => item.error = None,
        }
        if update.retry {
            item.retry_count += 1;
        }
        if update.fix_attempt {
            item.fix_attempts += 1;
        }
        if let Some(transition) = transition {
            debug!(item = %key, from = %transition.from, to = %transition.to, "transition");
            if transition.to != transition.from && !transition.to.is_terminal() {
                item.retry_count = 0;
            }
            item.state = transition.to;
            item.transitions.push(transition);
        }
        item.updated_at = now;

        self.save()?;
        self.items
            .get(key)
            .ok_or_else(|| anyhow!("unknown work item {key}"))
    }

    /// Add the item if needed and move it out of `pending`, unless `cap`
    /// items are already in progress.
    pub fn try_claim(&mut self, kind: WorkKind, id: &str, cap: usize) -> Result<Claim> {
        let key = work_key(kind, id);
        if let Some(item) = self.items.get(&key)
            && item.state != WorkState::Pending
        {
            return Ok(Claim::AlreadyTracked(item.state));
        }
        if self.in_progress_count() >= cap {
            debug!(item = %key, cap, "claim refused at capacity");
            return Ok(Claim::AtCapacity);
        }
        if !self.items.contains_key(&key) {
            self.add(kind, id, BTreeMap::new())?;
        }
        self.update(&key, WorkUpdate::new().transition(Event::Claimed, "claimed"))?;
        Ok(Claim::Claimed)
    }

    pub fn in_progress_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.state.is_in_progress())
            .count()
    }

    pub fn pending(&self) -> Vec<&WorkItem> {
        self.with_state(|state| state == WorkState::Pending)
    }

    pub fn in_progress(&self) -> Vec<&WorkItem> {
        self.with_state(WorkState::is_in_progress)
    }

    fn with_state(&self, pred: impl Fn(WorkState) -> bool) -> Vec<&WorkItem> {
        self.items.values().filter(|item| pred(item.state)).collect()
    }

    /// Count per state, every state present.
    pub fn summary(&self) -> BTreeMap<WorkState, usize> {
        let mut counts: BTreeMap<WorkState, usize> =
            WorkState::ALL.into_iter().map(|state| (state, 0)).collect();
        for item in self.items.values() {
            *counts.entry(item.state).or_default() += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: STATE_VERSION,
            work_items: self.items.clone(),
        }
    }

    /// Pretty JSON snapshot with a trailing newline.
    pub fn export_state(&self) -> Result<String> {
        let mut buf = serde_json::to_string_pretty(&self.snapshot()).context("serialize state")?;
        buf.push('\n');
        Ok(buf)
    }

    /// Replace every item with the snapshot in `contents` and persist.
    #[instrument(skip_all)]
    pub fn import_state(&mut self, contents: &str) -> Result<usize> {
        self.items = parse_snapshot(contents)?;
        self.save()?;
        info!(items = self.items.len(), "state imported");
        Ok(self.items.len())
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, &self.export_state()?)
    }
}

/// Parse and validate a snapshot: JSON schema, version, and key consistency.
fn parse_snapshot(contents: &str) -> Result<BTreeMap<String, WorkItem>> {
    let value: Value = serde_json::from_str(contents).context("parse state json")?;
    validate_schema(&value)?;
    let snapshot: StateSnapshot = serde_json::from_value(value).context("deserialize state")?;
    if snapshot.version != STATE_VERSION {
        bail!(
            "unsupported state version {} (expected {STATE_VERSION})",
            snapshot.version
        );
    }
    for (key, item) in &snapshot.work_items {
        if *key != item.key() {
            bail!("state key {key} does not match item {}", item.key());
        }
    }
    Ok(snapshot.work_items)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(STATE_SCHEMA).context("parse state schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
