//! Envelope builder: wraps a phase's items with diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{ModelId, Phase, ResultItem};

/// Uniform response of every pipeline phase.
///
/// `items` is in the order the caller listed the models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub phase: Phase,
    pub items: Vec<ResultItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Envelope {
    /// Wraps settled items and records `failed`/`failed_models` when any item failed.
    pub fn build(phase: Phase, items: Vec<ResultItem>) -> Self {
        let failed_models: Vec<&str> = items
            .iter()
            .filter(|item| item.is_failed())
            .map(|item| item.model_id.as_str())
            .collect();

        let meta = if failed_models.is_empty() {
            None
        } else {
            let mut meta = Map::new();
            meta.insert("failed".into(), Value::from(failed_models.len()));
            meta.insert(
                "failed_models".into(),
                Value::from(failed_models.iter().map(|m| m.to_string()).collect::<Vec<_>>()),
            );
            Some(meta)
        };

        Self { phase, items, meta }
    }

    /// Envelope whose items are all still in flight.
    pub fn placeholders(phase: Phase, model_ids: &[ModelId]) -> Self {
        let kind = phase.item_kind();
        Self {
            phase,
            items: model_ids
                .iter()
                .map(|id| ResultItem::placeholder(kind, id.clone()))
                .collect(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_failed()).count()
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.items.iter().map(|i| i.model_id.clone()).collect()
    }
}
