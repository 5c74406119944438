//! Run Ledger: per-session history of pipeline runs, grouped by mode.
//!
//! Runs live in an arena keyed by [`RunId`]; each mode keeps its own append
//! order. Every mutation addresses a run by id, so two runs settling
//! concurrently never touch each other's record.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::gateway::Message;

use super::envelope::Envelope;
use super::types::{GenerationConfig, ModelId, Phase, SynthesisPayload};

pub type RunId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
    #[error("unknown run mode: {0}")]
    UnknownMode(String),
    #[error("ledger lock poisoned")]
    Poisoned,
}

// =============================================================================
// Modes and states
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Compare,
    MultiJudge,
    SingleJudge,
    Chat,
}

impl RunMode {
    pub const ALL: [RunMode; 4] = [RunMode::Compare, RunMode::MultiJudge, RunMode::SingleJudge, RunMode::Chat];

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Compare => "compare",
            RunMode::MultiJudge => "multi_judge",
            RunMode::SingleJudge => "single_judge",
            RunMode::Chat => "chat",
        }
    }
}

impl FromStr for RunMode {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compare" => Ok(RunMode::Compare),
            "multi_judge" => Ok(RunMode::MultiJudge),
            "single_judge" => Ok(RunMode::SingleJudge),
            "chat" => Ok(RunMode::Chat),
            _ => Err(LedgerError::UnknownMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary/evaluation lifecycle of a run. There is no failed state:
/// failures live on individual items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    PrimaryPending,
    PrimarySettled,
    EvaluationPending,
    EvaluationSettled,
    Cancelled,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Created, PrimaryPending)
                | (PrimaryPending, PrimarySettled)
                | (PrimarySettled, EvaluationPending)
                | (EvaluationPending, EvaluationSettled)
        ) || (next == Cancelled && self != Cancelled)
    }

    /// Whether the primary phase has settled and the run is still live.
    pub fn primary_settled(self) -> bool {
        matches!(
            self,
            RunState::PrimarySettled | RunState::EvaluationPending | RunState::EvaluationSettled
        )
    }
}

/// Synthesis lifecycle, independent of [`RunState`] and repeatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisState {
    #[default]
    Idle,
    Pending,
    Settled,
}

// =============================================================================
// Run record
// =============================================================================

/// Which models each phase used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseModels {
    pub primary: Vec<ModelId>,
    #[serde(default)]
    pub judges: Vec<ModelId>,
    #[serde(default)]
    pub evaluator: Option<ModelId>,
    #[serde(default)]
    pub orchestrator: Option<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub mode: RunMode,
    pub prompt: String,
    pub config: GenerationConfig,
    pub created_at: DateTime<Utc>,
    pub state: RunState,
    pub synthesis_state: SynthesisState,
    /// Bumped by every orchestration request; only the latest may settle.
    #[serde(default)]
    pub synthesis_generation: u64,
    pub models: PhaseModels,
    pub primary: Envelope,
    pub evaluation: Option<Envelope>,
    pub synthesis: Option<Envelope>,
    pub final_answer: Option<String>,
    pub rationale: Option<String>,
    /// Derived conversation: user prompt, synthesized answer, then follow-ups.
    pub thread: Vec<Message>,
}

impl Run {
    /// A fresh run whose primary items are placeholders.
    pub fn new(mode: RunMode, prompt: impl Into<String>, model_ids: Vec<ModelId>, config: GenerationConfig) -> Self {
        let phase = if mode == RunMode::Chat {
            Phase::Chat
        } else {
            Phase::Primary
        };
        Self {
            id: Uuid::new_v4(),
            mode,
            prompt: prompt.into(),
            config,
            created_at: Utc::now(),
            state: RunState::Created,
            synthesis_state: SynthesisState::Idle,
            synthesis_generation: 0,
            primary: Envelope::placeholders(phase, &model_ids),
            models: PhaseModels {
                primary: model_ids,
                ..Default::default()
            },
            evaluation: None,
            synthesis: None,
            final_answer: None,
            rationale: None,
            thread: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunState) -> Result<(), LedgerError> {
        if !self.state.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Evaluation flavour being attached to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationTarget {
    Multi(Vec<ModelId>),
    Single(ModelId),
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Default)]
struct LedgerInner {
    runs: HashMap<RunId, Run>,
    order: HashMap<RunMode, Vec<RunId>>,
}

#[derive(Debug, Default)]
pub struct RunLedger {
    inner: RwLock<LedgerInner>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerInner) -> T) -> Result<T, LedgerError> {
        let guard = self.inner.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(f(&guard))
    }

    fn write<T>(&self, f: impl FnOnce(&mut LedgerInner) -> T) -> Result<T, LedgerError> {
        let mut guard = self.inner.write().map_err(|_| LedgerError::Poisoned)?;
        Ok(f(&mut guard))
    }

    /// Mutate one live run. `Ok(None)` when the run is gone or cancelled.
    fn apply<T>(
        &self,
        id: RunId,
        what: &'static str,
        f: impl FnOnce(&mut Run) -> Result<T, LedgerError>,
    ) -> Result<Option<T>, LedgerError> {
        self.write(|inner| match inner.runs.get_mut(&id) {
            Some(run) if run.state != RunState::Cancelled => f(run).map(Some),
            Some(_) => {
                debug!(run_id = %id, what, "discarding result for cancelled run");
                Ok(None)
            }
            None => {
                debug!(run_id = %id, what, "discarding result for cleared run");
                Ok(None)
            }
        })?
    }

    /// Append a run under `mode`; it becomes the mode's active run.
    pub fn append(&self, mode: RunMode, mut run: Run) -> Result<RunId, LedgerError> {
        run.mode = mode;
        let id = run.id;
        self.write(|inner| {
            inner.order.entry(mode).or_default().push(id);
            inner.runs.insert(id, run);
        })?;
        Ok(id)
    }

    /// Runs of `mode` in append order.
    pub fn list(&self, mode: RunMode) -> Result<Vec<Run>, LedgerError> {
        self.read(|inner| {
            inner
                .order
                .get(&mode)
                .map(|ids| ids.iter().filter_map(|id| inner.runs.get(id).cloned()).collect())
                .unwrap_or_default()
        })
    }

    /// Remove every run of `mode`; other modes are untouched.
    pub fn clear(&self, mode: RunMode) -> Result<usize, LedgerError> {
        self.write(|inner| {
            let ids = inner.order.remove(&mode).unwrap_or_default();
            for id in &ids {
                inner.runs.remove(id);
            }
            ids.len()
        })
    }

    pub fn get(&self, id: RunId) -> Result<Run, LedgerError> {
        self.read(|inner| inner.runs.get(&id).cloned())?
            .ok_or(LedgerError::NotFound(id))
    }

    /// Most recently appended run of `mode`.
    pub fn active(&self, mode: RunMode) -> Result<Option<Run>, LedgerError> {
        self.read(|inner| {
            inner
                .order
                .get(&mode)
                .and_then(|ids| ids.last())
                .and_then(|id| inner.runs.get(id).cloned())
        })
    }

    /// Start a phase on a run. Unlike result application, a missing or
    /// cancelled run is an error here.
    fn begin<T>(&self, id: RunId, f: impl FnOnce(&mut Run) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        self.write(|inner| match inner.runs.get_mut(&id) {
            Some(run) => f(run),
            None => Err(LedgerError::NotFound(id)),
        })?
    }

    pub fn begin_primary(&self, id: RunId) -> Result<(), LedgerError> {
        self.begin(id, |run| run.transition(RunState::PrimaryPending))
    }

    /// Store the settled primary envelope. Returns false when the result was
    /// discarded because the run was cancelled or cleared meanwhile.
    pub fn settle_primary(&self, id: RunId, envelope: Envelope) -> Result<bool, LedgerError> {
        let applied = self.apply(id, "settle_primary", |run| {
            run.transition(RunState::PrimarySettled)?;
            run.primary = envelope;
            Ok(())
        })?;
        Ok(applied.is_some())
    }

    pub fn begin_evaluation(&self, id: RunId, target: EvaluationTarget) -> Result<(), LedgerError> {
        self.begin(id, |run| {
            run.transition(RunState::EvaluationPending)?;
            match target {
                EvaluationTarget::Multi(judges) => run.models.judges = judges,
                EvaluationTarget::Single(evaluator) => run.models.evaluator = Some(evaluator),
            }
            Ok(())
        })
    }

    pub fn settle_evaluation(&self, id: RunId, envelope: Envelope) -> Result<bool, LedgerError> {
        let applied = self.apply(id, "settle_evaluation", |run| {
            run.transition(RunState::EvaluationSettled)?;
            run.evaluation = Some(envelope);
            Ok(())
        })?;
        Ok(applied.is_some())
    }

    /// Start a (re-)orchestration. Allowed any time after the primary phase
    /// settled. Returns the generation the result must be settled with.
    pub fn begin_synthesis(&self, id: RunId) -> Result<u64, LedgerError> {
        self.begin(id, |run| {
            if !run.state.primary_settled() {
                return Err(LedgerError::InvalidTransition {
                    from: run.state,
                    to: RunState::PrimarySettled,
                });
            }
            run.synthesis_state = SynthesisState::Pending;
            run.synthesis_generation += 1;
            Ok(run.synthesis_generation)
        })
    }

    /// Overwrite the synthesis fields and re-derive the thread.
    ///
    /// `payload` is `None` when the orchestrator call itself failed; the
    /// previous answer, its orchestrator and the thread are then kept.
    /// A result whose `generation` was superseded by a later
    /// [`begin_synthesis`](Self::begin_synthesis) is discarded.
    pub fn settle_synthesis(
        &self,
        id: RunId,
        generation: u64,
        orchestrator: ModelId,
        envelope: Envelope,
        payload: Option<SynthesisPayload>,
    ) -> Result<bool, LedgerError> {
        let applied = self.apply(id, "settle_synthesis", |run| {
            if run.synthesis_generation != generation {
                debug!(
                    run_id = %id,
                    generation,
                    latest = run.synthesis_generation,
                    "discarding superseded synthesis"
                );
                return Ok(false);
            }
            run.synthesis_state = SynthesisState::Settled;
            run.synthesis = Some(envelope);
            if let Some(payload) = payload {
                run.thread = vec![
                    Message::user(run.prompt.clone()),
                    Message::assistant(payload.final_answer.clone()),
                ];
                run.models.orchestrator = Some(orchestrator);
                run.final_answer = Some(payload.final_answer);
                run.rationale = Some(payload.rationale);
            }
            Ok(true)
        })?;
        Ok(applied.unwrap_or(false))
    }

    /// Append follow-up turns to a run's thread.
    pub fn append_turns(&self, id: RunId, turns: Vec<Message>) -> Result<bool, LedgerError> {
        let applied = self.apply(id, "append_turns", |run| {
            run.thread.extend(turns);
            Ok(())
        })?;
        Ok(applied.is_some())
    }

    /// Mark a run cancelled. Returns false if it already was.
    pub fn cancel(&self, id: RunId) -> Result<bool, LedgerError> {
        self.write(|inner| match inner.runs.get_mut(&id) {
            Some(run) if run.state == RunState::Cancelled => Ok(false),
            Some(run) => {
                run.state = RunState::Cancelled;
                if run.synthesis_state == SynthesisState::Pending {
                    run.synthesis_state = SynthesisState::Idle;
                }
                Ok(true)
            }
            None => Err(LedgerError::NotFound(id)),
        })?
    }
}
