//! Canonical data model shared by every phase of the pipeline.

use serde::{Deserialize, Serialize};

/// Opaque name of a registered provider adapter, e.g. `"anthropic/claude-opus-4-6"`.
pub type ModelId = String;

/// Text shown while a call is still in flight.
pub const PLACEHOLDER_TEXT: &str = "Loading...";

// =============================================================================
// Generation config
// =============================================================================

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

/// Sampling settings applied identically to every adapter in one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub include_system_instruction: bool,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            include_system_instruction: false,
            system_prompt: String::new(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be within 0.0-2.0, got {}",
                self.temperature
            ));
        }
        if self.max_tokens == 0 {
            return Err("maxTokens must be a positive integer".to_string());
        }
        if self.include_system_instruction && self.system_prompt.trim().is_empty() {
            return Err("systemPrompt must be set when includeSystemInstruction is true".to_string());
        }
        Ok(())
    }

    /// The caller's system instruction, if enabled.
    pub fn system_instruction(&self) -> Option<&str> {
        if self.include_system_instruction {
            Some(self.system_prompt.trim()).filter(|s| !s.is_empty())
        } else {
            None
        }
    }
}

// =============================================================================
// Result items
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    ModelOutput,
    JudgeAssessment,
    Synthesis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    Markdown,
    Text,
    Json,
}

/// Text body tagged with its format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub format: ContentFormat,
    pub text: String,
}

impl Content {
    pub fn new(format: ContentFormat, text: impl Into<String>) -> Self {
        Self {
            format,
            text: text.into(),
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self::new(ContentFormat::Markdown, text)
    }
}

/// One adapter call's canonical outcome.
///
/// After a call settles exactly one of non-empty `content` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub kind: ItemKind,
    pub model_id: ModelId,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResultItem {
    pub fn success(kind: ItemKind, model_id: impl Into<ModelId>, latency_ms: u64, content: Content) -> Self {
        Self {
            kind,
            model_id: model_id.into(),
            latency_ms,
            content: Some(content),
            structured: None,
            error: None,
        }
    }

    pub fn failure(
        kind: ItemKind,
        model_id: impl Into<ModelId>,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            model_id: model_id.into(),
            latency_ms,
            content: None,
            structured: None,
            error: Some(error.into()),
        }
    }

    pub fn placeholder(kind: ItemKind, model_id: impl Into<ModelId>) -> Self {
        Self::success(kind, model_id, 0, Content::markdown(PLACEHOLDER_TEXT))
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Body text of a successful item.
    pub fn text(&self) -> Option<&str> {
        if self.error.is_some() {
            return None;
        }
        self.content
            .as_ref()
            .map(|c| c.text.as_str())
            .filter(|t| !t.trim().is_empty())
    }

    /// Whether the settle invariant holds: error xor non-empty content.
    pub fn is_settled(&self) -> bool {
        self.error.is_some() != self.text().is_some()
    }

    /// Converts a success into a failure, dropping the content.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.content = None;
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Label of the pipeline stage that produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Primary,
    JudgeMulti,
    JudgeSingle,
    Orchestrate,
    Chat,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Primary => "primary",
            Phase::JudgeMulti => "judge_multi",
            Phase::JudgeSingle => "judge_single",
            Phase::Orchestrate => "orchestrate",
            Phase::Chat => "chat",
        }
    }

    /// Kind stamped on every item this phase produces.
    pub fn item_kind(self) -> ItemKind {
        match self {
            Phase::Primary | Phase::Chat => ItemKind::ModelOutput,
            Phase::JudgeMulti | Phase::JudgeSingle => ItemKind::JudgeAssessment,
            Phase::Orchestrate => ItemKind::Synthesis,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Judge assessments
// =============================================================================

pub const RISK_SCORE_MIN: f64 = 0.0;
pub const RISK_SCORE_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLabel {
    Low,
    Medium,
    High,
}

impl RiskLabel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(RiskLabel::Low),
            "MEDIUM" | "MED" => Some(RiskLabel::Medium),
            "HIGH" => Some(RiskLabel::High),
            _ => None,
        }
    }
}

/// One judge's verdict on one primary output.
///
/// Either `error` is set, or both `risk_score` and `risk_label` are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeAssessment {
    #[serde(rename = "targetModelId")]
    pub target_model_id: ModelId,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub risk_label: Option<RiskLabel>,
    #[serde(default)]
    pub failure_modes: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of a synthesis item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisPayload {
    pub final_answer: String,
    #[serde(default)]
    pub rationale: String,
}

impl SynthesisPayload {
    pub fn from_item(item: &ResultItem) -> Option<Self> {
        item.structured
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
