//! `orchestrator status`: counts per state and the items still moving.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::core::state::WorkState;
use crate::core::work_item::WorkItem;
use crate::io::registry::WorkRegistry;
use crate::stages::keys;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemLine {
    pub key: String,
    pub state: WorkState,
    pub title: Option<String>,
    pub fix_attempts: u32,
    pub error: Option<String>,
}

impl ItemLine {
    fn from_item(item: &WorkItem) -> Self {
        Self {
            key: item.key(),
            state: item.state,
            title: item.meta_str(keys::TITLE).map(str::to_string),
            fix_attempts: item.fix_attempts,
            error: item.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub total: usize,
    /// Every state by name, including zero counts.
    pub counts: BTreeMap<String, usize>,
    pub in_progress: Vec<ItemLine>,
    pub pending: Vec<ItemLine>,
}

impl StatusReport {
    pub fn from_registry(registry: &WorkRegistry) -> Self {
        Self {
            total: registry.len(),
            counts: registry
                .summary()
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
            in_progress: lines(registry.in_progress()),
            pending: lines(registry.pending()),
        }
    }

    /// `key=value` lines, one state per line, then the open items.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "total={}", self.total);
        for state in WorkState::ALL {
            let count = self.counts.get(state.as_str()).copied().unwrap_or(0);
            let _ = writeln!(out, "{state}={count}");
        }
        for (heading, items) in [("in_progress", &self.in_progress), ("pending", &self.pending)] {
            if items.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{heading}:");
            for line in items {
                let _ = write!(out, "  {} [{}]", line.key, line.state);
                if let Some(title) = &line.title {
                    let _ = write!(out, " {title}");
                }
                if line.fix_attempts > 0 {
                    let _ = write!(out, " (fix attempts: {})", line.fix_attempts);
                }
                if let Some(error) = &line.error {
                    let _ = write!(out, " error: {error}");
                }
                out.push('\n');
            }
        }
        out
    }
}

fn lines(items: Vec<&WorkItem>) -> Vec<ItemLine> {
    items.into_iter().map(ItemLine::from_item).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::core::work_item::WorkKind;

    fn registry() -> WorkRegistry {
        let mut registry = WorkRegistry::in_memory();
        registry
            .add(
                WorkKind::Issue,
                "7",
                BTreeMap::from([(keys::TITLE.to_string(), json!("Flaky cache"))]),
            )
            .expect("add");
        registry
            .add(WorkKind::Roadmap, "q3", BTreeMap::new())
            .expect("add");
        registry.try_claim(WorkKind::Issue, "7", 2).expect("claim");
        registry
    }

    #[test]
    fn text_lists_every_state_and_open_items() {
        let text = StatusReport::from_registry(&registry()).render_text();

        assert!(text.starts_with("total=2\npending=1\nanalyzing=1\n"), "{text}");
        assert!(text.contains("failed=0\n"));
        assert!(text.contains("in_progress:\n  issue:7 [analyzing] Flaky cache\n"));
        assert!(text.contains("pending:\n  roadmap:q3 [pending]\n"));
    }

    #[test]
    fn json_counts_are_keyed_by_state_name() {
        let report = StatusReport::from_registry(&registry());
        let value = serde_json::to_value(&report).expect("json");

        assert_eq!(value["counts"]["analyzing"], 1);
        assert_eq!(value["counts"]["completed"], 0);
        assert_eq!(value["in_progress"][0]["key"], "issue:7");
        assert_eq!(value["in_progress"][0]["state"], "analyzing");
    }
}
