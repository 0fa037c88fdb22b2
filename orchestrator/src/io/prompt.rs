//! Prompt templates for stage and dialectic queries.
//!
//! Templates are embedded markdown rendered with minijinja. Each stage
//! template asks for the labeled layout the field extractor reads back.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const TEMPLATES: &[(&str, &str)] = &[
    ("analyze", include_str!("prompts/analyze.md")),
    ("plan", include_str!("prompts/plan.md")),
    ("implement", include_str!("prompts/implement.md")),
    ("failure", include_str!("prompts/failure.md")),
    ("fix", include_str!("prompts/fix.md")),
    ("review", include_str!("prompts/review.md")),
    ("critique", include_str!("prompts/critique.md")),
    ("synthesis", include_str!("prompts/synthesis.md")),
];

/// One provider's text from a dialectic round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundEntry {
    pub provider: String,
    pub text: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env }
    }

    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("prompt template '{name}'"))?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render prompt '{name}'"))?;
        Ok(rendered.trim().to_string())
    }

    pub fn render_critique(&self, task: &str, own: &str, others: &[RoundEntry]) -> Result<String> {
        self.render(
            "critique",
            context! {
                task => task.trim(),
                own => own.trim(),
                others => others,
            },
        )
    }

    pub fn render_synthesis(
        &self,
        task: &str,
        proposals: &[RoundEntry],
        critiques: &[RoundEntry],
    ) -> Result<String> {
        self.render(
            "synthesis",
            context! {
                task => task.trim(),
                proposals => proposals,
                critiques => critiques,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, text: &str) -> RoundEntry {
        RoundEntry {
            provider: provider.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn analyze_prompt_carries_issue_and_answer_layout() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render(
                "analyze",
                context! {
                    issue => context! {
                        number => 10,
                        title => "Crash on empty config",
                        body => "Steps to reproduce...",
                        labels => vec!["bug"],
                    },
                },
            )
            .expect("render");
        assert!(prompt.contains("#10: Crash on empty config"));
        assert!(prompt.contains("Labels: bug"));
        assert!(prompt.contains("Complexity: N/10"));
    }

    #[test]
    fn critique_lists_peer_answers_in_order() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_critique("task", "mine", &[entry("b", "theirs b"), entry("c", "theirs c")])
            .expect("render");
        let b = prompt.find("theirs b").expect("b");
        let c = prompt.find("theirs c").expect("c");
        assert!(b < c);
        assert!(prompt.contains("<your_answer>\nmine\n</your_answer>"));
    }

    #[test]
    fn synthesis_includes_both_rounds() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_synthesis("task", &[entry("a", "proposal")], &[entry("a", "critique")])
            .expect("render");
        assert!(prompt.contains("<proposal from=\"a\">"));
        assert!(prompt.contains("<critique from=\"a\">"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(PromptEngine::new().render("missing", context! {}).is_err());
    }
}
