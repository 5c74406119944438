//! Evaluation aggregator: multi-judge matrix and single-judge report.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::dispatcher::{CallScope, Dispatcher};
use super::envelope::Envelope;
use super::error::{item_error, EngineError};
use super::parse::{parse_assessments, DroppedAssessment};
use super::prompts;
use super::types::{GenerationConfig, JudgeAssessment, ModelId, Phase, ResultItem, RiskLabel};

fn require_outputs(outputs: &[ResultItem]) -> Result<Vec<ModelId>, EngineError> {
    if outputs.is_empty() {
        return Err(EngineError::invalid("primaryOutputs must not be empty"));
    }
    Ok(outputs.iter().map(|o| o.model_id.clone()).collect())
}

/// Ask every judge to assess every primary output.
///
/// One item per judge; `structured.assessments` holds the validated
/// assessments. A judge whose reply cannot be parsed gets an item error and
/// its raw text under `structured.raw_response`, without affecting the
/// other judges.
pub async fn evaluate_multi(
    dispatcher: &Dispatcher,
    judge_ids: &[ModelId],
    prompt: &str,
    outputs: &[ResultItem],
    config: &GenerationConfig,
    scope: &CallScope,
) -> Result<Envelope, EngineError> {
    let primary_ids = require_outputs(outputs)?;
    let judge_prompt = prompts::judge_multi(prompt, outputs);
    let envelope = dispatcher
        .run(Phase::JudgeMulti, judge_ids, &judge_prompt, config, scope)
        .await?;

    let mut dropped: Vec<Value> = Vec::new();
    let items: Vec<ResultItem> = envelope
        .items
        .into_iter()
        .enumerate()
        .map(|(index, mut item)| {
            let Some(raw) = item.text().map(str::to_string) else {
                return item;
            };
            match parse_assessments(&raw, &primary_ids) {
                Ok(parsed) => {
                    for entry in &parsed.dropped {
                        warn!(judge = %item.model_id, target = ?entry.target_model_id, reason = %entry.reason, "dropped judge assessment");
                    }
                    dropped.extend(parsed.dropped.into_iter().map(|d: DroppedAssessment| {
                        json!({
                            "judgeIndex": index,
                            "judgeModelId": item.model_id,
                            "targetModelId": d.target_model_id,
                            "reason": d.reason,
                        })
                    }));
                    item.structured = Some(json!({ "assessments": parsed.assessments }));
                }
                Err(err) => {
                    warn!(judge = %item.model_id, error = %err, "judge response did not parse");
                    item.fail(item_error::format(item_error::PARSE_ERROR, &err));
                    item.structured = Some(json!({ "raw_response": raw }));
                }
            }
            item
        })
        .collect();

    let mut envelope = Envelope::build(Phase::JudgeMulti, items);
    if !dropped.is_empty() {
        envelope = envelope.with_meta("dropped_assessments", Value::Array(dropped));
    }
    info!(judges = judge_ids.len(), targets = primary_ids.len(), "multi-judge evaluation settled");
    Ok(envelope)
}

/// One consolidated free-text report from a single evaluator.
///
/// The envelope always holds exactly one item.
pub async fn evaluate_single(
    dispatcher: &Dispatcher,
    evaluator_id: &ModelId,
    prompt: &str,
    outputs: &[ResultItem],
    config: &GenerationConfig,
    scope: &CallScope,
) -> Result<Envelope, EngineError> {
    require_outputs(outputs)?;
    let report_prompt = prompts::judge_single(prompt, outputs);
    dispatcher
        .run(
            Phase::JudgeSingle,
            std::slice::from_ref(evaluator_id),
            &report_prompt,
            config,
            scope,
        )
        .await
}

// =============================================================================
// Assessment matrix
// =============================================================================

/// One judge × target cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatrixCell {
    Assessed(JudgeAssessment),
    /// The judge answered but said nothing valid about this target.
    NotAvailable,
    /// The judge's whole call failed.
    JudgeFailed { error: String },
}

impl MatrixCell {
    pub fn risk_label(&self) -> Option<RiskLabel> {
        match self {
            MatrixCell::Assessed(a) => a.risk_label,
            _ => None,
        }
    }
}

/// Judge × primary view over a multi-judge envelope.
#[derive(Debug, Clone)]
pub struct AssessmentMatrix {
    targets: Vec<ModelId>,
    judges: Vec<ModelId>,
    rows: Vec<Result<HashMap<ModelId, JudgeAssessment>, String>>,
}

impl AssessmentMatrix {
    pub fn from_envelope(primary_ids: &[ModelId], envelope: &Envelope) -> Self {
        let rows = envelope
            .items
            .iter()
            .map(|item| {
                if let Some(error) = &item.error {
                    return Err(error.clone());
                }
                let assessments: Vec<JudgeAssessment> = item
                    .structured
                    .as_ref()
                    .and_then(|s| s.get("assessments"))
                    .and_then(|a| serde_json::from_value(a.clone()).ok())
                    .unwrap_or_default();
                let mut row = HashMap::new();
                for a in assessments {
                    if primary_ids.contains(&a.target_model_id) {
                        row.entry(a.target_model_id.clone()).or_insert(a);
                    }
                }
                Ok(row)
            })
            .collect();

        Self {
            targets: primary_ids.to_vec(),
            judges: envelope.model_ids(),
            rows,
        }
    }

    pub fn judges(&self) -> &[ModelId] {
        &self.judges
    }

    pub fn targets(&self) -> &[ModelId] {
        &self.targets
    }

    pub fn cell(&self, judge_index: usize, target: &str) -> MatrixCell {
        match self.rows.get(judge_index) {
            Some(Ok(row)) => row
                .get(target)
                .cloned()
                .map(MatrixCell::Assessed)
                .unwrap_or(MatrixCell::NotAvailable),
            Some(Err(error)) => MatrixCell::JudgeFailed { error: error.clone() },
            None => MatrixCell::NotAvailable,
        }
    }

    /// Labels actually reported for `target`, one per judge that gave one.
    pub fn risk_labels_for(&self, target: &str) -> Vec<(ModelId, RiskLabel)> {
        (0..self.judges.len())
            .filter_map(|j| {
                self.cell(j, target)
                    .risk_label()
                    .map(|label| (self.judges[j].clone(), label))
            })
            .collect()
    }
}
