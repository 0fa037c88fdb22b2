//! Shared deterministic types for the consensus engine.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// How a prompt is spread across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Fan out to every provider in parallel.
    All,
    /// Query in order and stop at the first acceptable reply.
    Sequential,
    /// Proposal, cross-critique, then synthesis.
    #[serde(alias = "dialectical")]
    Dialectic,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Sequential => "sequential",
            Self::Dialectic => "dialectic",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "sequential" => Ok(Self::Sequential),
            "dialectic" | "dialectical" => Ok(Self::Dialectic),
            other => Err(anyhow!("unknown strategy '{other}'")),
        }
    }
}

/// Raw text returned by one provider for one prompt. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider_id: String,
    pub raw_text: String,
    pub token_count: u64,
    pub cost: f64,
    pub elapsed_ms: u64,
}

/// Outcome of one dispatch call.
///
/// `providers_queried` and `responses` are in query order; that order is the
/// tie-break order for categorical consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub strategy: Strategy,
    pub providers_queried: Vec<String>,
    pub responses: Vec<ProviderResponse>,
    /// Every round's responses; a single round unless the strategy is dialectic.
    pub rounds: Vec<Vec<ProviderResponse>>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub ok: bool,
    pub error: Option<String>,
}

impl DispatchResult {
    /// Single-round result; `ok` when at least one provider answered.
    pub fn from_responses(
        strategy: Strategy,
        providers_queried: Vec<String>,
        responses: Vec<ProviderResponse>,
    ) -> Self {
        let total_tokens = responses.iter().map(|r| r.token_count).sum();
        let total_cost = responses.iter().map(|r| r.cost).sum();
        let ok = !responses.is_empty();
        Self {
            strategy,
            providers_queried,
            rounds: vec![responses.clone()],
            responses,
            total_tokens,
            total_cost,
            ok,
            error: (!ok).then(|| "no provider returned a response".to_string()),
        }
    }

    pub fn failed(strategy: Strategy, providers_queried: Vec<String>, error: String) -> Self {
        Self {
            strategy,
            providers_queried,
            responses: Vec::new(),
            rounds: Vec::new(),
            total_tokens: 0,
            total_cost: 0.0,
            ok: false,
            error: Some(error),
        }
    }

    pub fn response(&self, provider_id: &str) -> Option<&ProviderResponse> {
        self.responses.iter().find(|r| r.provider_id == provider_id)
    }

    /// Provider id to raw text.
    pub fn texts(&self) -> BTreeMap<String, String> {
        self.responses
            .iter()
            .map(|r| (r.provider_id.clone(), r.raw_text.clone()))
            .collect()
    }
}

/// A single extracted or reconciled field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
    Flag(bool),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            _ => None,
        }
    }

    /// An empty string or list carries no information and counts as absent.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(value) => value.trim().is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Number(_) | Self::Flag(_) => false,
        }
    }
}

/// Field name to optional value. `None` means "not found", never "false".
pub type Fields = BTreeMap<String, Option<FieldValue>>;

/// Structured reading of one provider's response against one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub provider_id: String,
    pub schema_id: String,
    pub fields: Fields,
}

impl ExtractedRecord {
    /// True if at least one field was found in the text.
    pub fn is_parseable(&self) -> bool {
        self.fields.values().any(Option::is_some)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(Option::as_ref)
    }
}

/// The reconciled answer for one schema across providers.
///
/// Only the reconciler constructs these; re-running consensus yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub schema_id: String,
    pub fields: Fields,
    pub confidence: f64,
    pub contributing_providers: BTreeSet<String>,
    pub raw_responses: BTreeMap<String, String>,
}

impl ConsensusResult {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).and_then(Option::as_ref)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_number)
    }

    pub fn list(&self, name: &str) -> &[String] {
        self.get(name).and_then(FieldValue::as_list).unwrap_or(&[])
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FieldValue::as_flag)
    }

    /// Reconciled fields as a JSON object for work-item metadata.
    pub fn fields_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.fields {
            let json = match value {
                None => serde_json::Value::Null,
                Some(FieldValue::Text(text)) => serde_json::Value::from(text.as_str()),
                Some(FieldValue::Number(n)) => serde_json::Value::from(*n),
                Some(FieldValue::List(items)) => serde_json::Value::from(items.clone()),
                Some(FieldValue::Flag(flag)) => serde_json::Value::from(*flag),
            };
            map.insert(name.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("ALL".parse::<Strategy>().expect("parse"), Strategy::All);
        assert_eq!(
            "dialectical".parse::<Strategy>().expect("parse"),
            Strategy::Dialectic
        );
        assert!("random".parse::<Strategy>().is_err());
    }

    #[test]
    fn field_value_serializes_with_kind_tag() {
        let json = serde_json::to_string(&FieldValue::Number(7.0)).expect("serialize");
        assert_eq!(json, r#"{"kind":"number","value":7.0}"#);
        let back: FieldValue = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, FieldValue::Number(7.0));
    }

    #[test]
    fn blank_values_are_detected() {
        assert!(FieldValue::Text("  ".to_string()).is_blank());
        assert!(FieldValue::List(Vec::new()).is_blank());
        assert!(!FieldValue::Flag(false).is_blank());
    }
}
