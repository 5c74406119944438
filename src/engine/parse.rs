//! Boundary validation of judge and orchestrator payloads.
//!
//! Model output is free-form JSON, often wrapped in prose or code fences.
//! Everything here turns it into the strict canonical shapes or reports why
//! it could not; nothing untyped leaves this module.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{
    JudgeAssessment, ModelId, RiskLabel, SynthesisPayload, RISK_SCORE_MAX, RISK_SCORE_MIN,
};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON object in response")]
    NoJson,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Extract the first balanced JSON object from a response.
///
/// Handles models that add surrounding text or fences. Braces inside string
/// literals are ignored.
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Judge assessments
// =============================================================================

#[derive(Debug, Deserialize)]
struct AssessmentsJson {
    assessments: Vec<RawAssessment>,
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    #[serde(default, alias = "targetModelId", alias = "target_model_id", alias = "model_id")]
    target: Option<String>,
    #[serde(default, alias = "riskScore")]
    risk_score: Option<Value>,
    #[serde(default, alias = "riskLabel")]
    risk_label: Option<String>,
    #[serde(default, alias = "failureModes")]
    failure_modes: Vec<String>,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// An entry removed during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedAssessment {
    #[serde(rename = "targetModelId")]
    pub target_model_id: Option<ModelId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAssessments {
    pub assessments: Vec<JudgeAssessment>,
    pub dropped: Vec<DroppedAssessment>,
}

fn score_from(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }?;
    score.is_finite().then(|| score.clamp(RISK_SCORE_MIN, RISK_SCORE_MAX))
}

/// Parse a judge response into assessments over `primary_ids`.
///
/// Entries naming an unknown or repeated target, or lacking both an error
/// and a valid label/score pair, are dropped and reported, never defaulted.
pub fn parse_assessments(raw: &str, primary_ids: &[ModelId]) -> Result<ParsedAssessments, ParseError> {
    let json = extract_json(raw).ok_or(ParseError::NoJson)?;
    let parsed: AssessmentsJson = serde_json::from_str(json)?;

    let known: HashSet<&str> = primary_ids.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = ParsedAssessments::default();

    for raw in parsed.assessments {
        let drop = |target: Option<String>, reason: &str| DroppedAssessment {
            target_model_id: target,
            reason: reason.to_string(),
        };

        let Some(target) = raw.target.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) else {
            out.dropped.push(drop(None, "missing targetModelId"));
            continue;
        };
        if !known.contains(target.as_str()) {
            out.dropped.push(drop(Some(target), "unknown targetModelId"));
            continue;
        }
        if seen.contains(&target) {
            out.dropped.push(drop(Some(target), "duplicate targetModelId"));
            continue;
        }

        let error = raw.error.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        let label = raw.risk_label.as_deref().and_then(RiskLabel::parse);
        let score = raw.risk_score.as_ref().and_then(score_from);

        let (risk_label, risk_score) = match (&error, label, score) {
            (Some(_), label, score) => (label, score),
            (None, Some(label), Some(score)) => (Some(label), Some(score)),
            (None, None, _) => {
                out.dropped.push(drop(Some(target), "missing or invalid risk_label"));
                continue;
            }
            (None, Some(_), None) => {
                out.dropped.push(drop(Some(target), "missing or invalid risk_score"));
                continue;
            }
        };

        seen.insert(target.clone());
        out.assessments.push(JudgeAssessment {
            target_model_id: target,
            risk_score,
            risk_label,
            failure_modes: raw.failure_modes,
            evidence: raw.evidence,
            notes: raw.notes.unwrap_or_default(),
            error,
        });
    }

    Ok(out)
}

// =============================================================================
// Synthesis
// =============================================================================

#[derive(Debug, Deserialize)]
struct SynthesisJson {
    #[serde(default, alias = "finalAnswer", alias = "answer")]
    final_answer: Option<Value>,
    #[serde(default)]
    rationale: Option<Value>,
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse `{finalAnswer, rationale}`; `None` when the shape does not match.
pub fn parse_synthesis(raw: &str) -> Option<SynthesisPayload> {
    let json = extract_json(raw)?;
    let parsed: SynthesisJson = serde_json::from_str(json).ok()?;
    let final_answer = value_text(parsed.final_answer?);
    if final_answer.trim().is_empty() {
        return None;
    }
    Some(SynthesisPayload {
        final_answer,
        rationale: parsed.rationale.map(value_text).unwrap_or_default(),
    })
}
