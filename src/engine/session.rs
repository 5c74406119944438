//! Stateful engine: runs the phases of a run and records them in the ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::adapter::ModelRegistry;
use super::dispatcher::{CallScope, CancelToken, Dispatcher, DEFAULT_CALL_TIMEOUT};
use super::envelope::Envelope;
use super::error::EngineError;
use super::evaluation;
use super::ledger::{EvaluationTarget, LedgerError, Run, RunId, RunLedger, RunMode, RunState};
use super::prompts;
use super::synthesis::{self, Synthesis};
use super::trace::TraceSink;
use super::types::{GenerationConfig, ModelId, Phase, ResultItem};

#[derive(Clone)]
pub struct EngineOptions {
    pub call_timeout: Duration,
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            trace: None,
        }
    }
}

/// Cancel token of a run plus how many of its phases are in flight.
#[derive(Default)]
struct InFlight {
    token: CancelToken,
    phases: usize,
}

/// Keeps a run's cancel token registered while one of its phases runs.
struct PhaseGuard<'a> {
    engine: &'a Engine,
    id: RunId,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.engine.release(self.id);
    }
}

/// Dispatcher, aggregators, synthesizer and ledger behind one handle.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Engine {
    dispatcher: Dispatcher,
    ledger: RunLedger,
    in_flight: Mutex<HashMap<RunId, InFlight>>,
}

impl Engine {
    pub fn new(registry: ModelRegistry, options: EngineOptions) -> Self {
        let mut dispatcher = Dispatcher::new(Arc::new(registry), options.call_timeout);
        if let Some(trace) = options.trace {
            dispatcher = dispatcher.with_trace(trace);
        }
        Self {
            dispatcher,
            ledger: RunLedger::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.dispatcher.registry()
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Register a phase of `id` as in flight. Must happen before the run's
    /// state is checked, so a concurrent [`cancel`](Self::cancel) either
    /// sees the token or the phase sees the cancelled state.
    fn enter(&self, id: RunId) -> Result<(CallScope, PhaseGuard<'_>), EngineError> {
        let mut in_flight = self.in_flight.lock().map_err(|_| LedgerError::Poisoned)?;
        let entry = in_flight.entry(id).or_default();
        entry.phases += 1;
        let scope = CallScope::for_run(id, entry.token.clone());
        Ok((scope, PhaseGuard { engine: self, id }))
    }

    fn release(&self, id: RunId) {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return;
        };
        if let Some(entry) = in_flight.get_mut(&id) {
            entry.phases = entry.phases.saturating_sub(1);
            if entry.phases == 0 {
                in_flight.remove(&id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Stateless phases
    // -------------------------------------------------------------------------

    pub async fn primary(
        &self,
        model_ids: &[ModelId],
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Envelope, EngineError> {
        self.dispatcher
            .run(Phase::Primary, model_ids, &prompts::primary(prompt), config, &CallScope::default())
            .await
    }

    pub async fn judge_outputs_multi(
        &self,
        judge_ids: &[ModelId],
        prompt: &str,
        outputs: &[ResultItem],
        config: &GenerationConfig,
    ) -> Result<Envelope, EngineError> {
        evaluation::evaluate_multi(&self.dispatcher, judge_ids, prompt, outputs, config, &CallScope::default()).await
    }

    pub async fn judge_outputs_single(
        &self,
        evaluator_id: &ModelId,
        prompt: &str,
        outputs: &[ResultItem],
        config: &GenerationConfig,
    ) -> Result<Envelope, EngineError> {
        evaluation::evaluate_single(&self.dispatcher, evaluator_id, prompt, outputs, config, &CallScope::default())
            .await
    }

    pub async fn orchestrate_outputs(
        &self,
        orchestrator_id: &ModelId,
        prompt: &str,
        outputs: &[ResultItem],
        instruction: Option<&str>,
        config: &GenerationConfig,
    ) -> Result<Synthesis, EngineError> {
        synthesis::orchestrate(
            &self.dispatcher,
            orchestrator_id,
            prompt,
            outputs,
            instruction,
            config,
            &CallScope::default(),
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    /// Validate and record a run with placeholder items; nothing is called yet.
    pub fn submit(
        &self,
        mode: RunMode,
        model_ids: Vec<ModelId>,
        prompt: impl Into<String>,
        config: GenerationConfig,
    ) -> Result<RunId, EngineError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(EngineError::invalid("prompt must not be empty"));
        }
        if model_ids.is_empty() {
            return Err(EngineError::invalid("model list must not be empty"));
        }
        config.validate().map_err(EngineError::InvalidRequest)?;
        self.registry().resolve_all(&model_ids)?;

        let run = Run::new(mode, prompt, model_ids, config);
        let id = self.ledger.append(mode, run)?;
        self.ledger.begin_primary(id)?;
        info!(run_id = %id, mode = %mode, "run submitted");
        Ok(id)
    }

    /// Execute the primary phase of a submitted run and return the run.
    ///
    /// A run cancelled before this starts is returned untouched.
    pub async fn run_primary(&self, id: RunId) -> Result<Run, EngineError> {
        let (scope, _guard) = self.enter(id)?;
        let run = self.ledger.get(id)?;
        if run.state == RunState::Cancelled {
            debug!(run_id = %id, "run cancelled before its primary phase started");
            return Ok(run);
        }
        if run.state != RunState::PrimaryPending {
            return Err(EngineError::invalid(format!(
                "run {id} is {:?}, primary phase cannot start",
                run.state
            )));
        }
        let phase = if run.mode == RunMode::Chat {
            Phase::Chat
        } else {
            Phase::Primary
        };

        let envelope = self
            .dispatcher
            .run(phase, &run.models.primary, &prompts::primary(&run.prompt), &run.config, &scope)
            .await?;
        if !self.ledger.settle_primary(id, envelope)? {
            debug!(run_id = %id, "primary results discarded");
        }
        Ok(self.ledger.get(id)?)
    }

    /// Submit a compare run and execute its primary phase.
    pub async fn compare(
        &self,
        model_ids: Vec<ModelId>,
        prompt: impl Into<String>,
        config: GenerationConfig,
    ) -> Result<Run, EngineError> {
        let id = self.submit(RunMode::Compare, model_ids, prompt, config)?;
        self.run_primary(id).await
    }

    /// Single-model chat, recorded under [`RunMode::Chat`].
    pub async fn chat(
        &self,
        model_id: ModelId,
        prompt: impl Into<String>,
        config: GenerationConfig,
    ) -> Result<Run, EngineError> {
        let id = self.submit(RunMode::Chat, vec![model_id], prompt, config)?;
        self.run_primary(id).await
    }

    pub async fn evaluate_multi(&self, id: RunId, judge_ids: Vec<ModelId>) -> Result<Envelope, EngineError> {
        if judge_ids.is_empty() {
            return Err(EngineError::invalid("judge list must not be empty"));
        }
        self.registry().resolve_all(&judge_ids)?;
        let (scope, _guard) = self.enter(id)?;
        let run = self.ledger.get(id)?;
        self.ledger.begin_evaluation(id, EvaluationTarget::Multi(judge_ids.clone()))?;

        let envelope = evaluation::evaluate_multi(
            &self.dispatcher,
            &judge_ids,
            &run.prompt,
            &run.primary.items,
            &run.config,
            &scope,
        )
        .await?;
        self.ledger.settle_evaluation(id, envelope.clone())?;
        Ok(envelope)
    }

    pub async fn evaluate_single(&self, id: RunId, evaluator_id: ModelId) -> Result<Envelope, EngineError> {
        self.registry().resolve(&evaluator_id)?;
        let (scope, _guard) = self.enter(id)?;
        let run = self.ledger.get(id)?;
        self.ledger.begin_evaluation(id, EvaluationTarget::Single(evaluator_id.clone()))?;

        let envelope = evaluation::evaluate_single(
            &self.dispatcher,
            &evaluator_id,
            &run.prompt,
            &run.primary.items,
            &run.config,
            &scope,
        )
        .await?;
        self.ledger.settle_evaluation(id, envelope.clone())?;
        Ok(envelope)
    }

    /// Attach or replace the synthesis of a run. Repeatable; when requests
    /// overlap, the most recently started one wins.
    pub async fn orchestrate(
        &self,
        id: RunId,
        orchestrator_id: ModelId,
        instruction: Option<String>,
    ) -> Result<Envelope, EngineError> {
        self.registry().resolve(&orchestrator_id)?;
        let (scope, _guard) = self.enter(id)?;
        let run = self.ledger.get(id)?;
        let generation = self.ledger.begin_synthesis(id)?;

        let Synthesis { envelope, payload } = synthesis::orchestrate(
            &self.dispatcher,
            &orchestrator_id,
            &run.prompt,
            &run.primary.items,
            instruction.as_deref(),
            &run.config,
            &scope,
        )
        .await?;
        if !self
            .ledger
            .settle_synthesis(id, generation, orchestrator_id, envelope.clone(), payload)?
        {
            debug!(run_id = %id, generation, "synthesis result not applied");
        }
        Ok(envelope)
    }

    /// Continue the synthesized thread with the run's orchestrator.
    pub async fn continue_thread(&self, id: RunId, message: &str) -> Result<Envelope, EngineError> {
        let (scope, _guard) = self.enter(id)?;
        let run = self.ledger.get(id)?;
        if run.state == RunState::Cancelled {
            return Err(EngineError::invalid(format!("run {id} was cancelled")));
        }
        let orchestrator = run
            .models
            .orchestrator
            .clone()
            .filter(|_| run.final_answer.is_some())
            .ok_or_else(|| EngineError::invalid(format!("run {id} has no synthesis to continue")))?;

        let (envelope, turns) = synthesis::continue_thread(
            &self.dispatcher,
            &orchestrator,
            &run.thread,
            message,
            &run.config,
            &scope,
        )
        .await?;
        if let Some(turns) = turns {
            self.ledger.append_turns(id, turns)?;
        }
        Ok(envelope)
    }

    /// Signal in-flight calls of a run and stop applying its results.
    pub fn cancel(&self, id: RunId) -> Result<bool, EngineError> {
        let newly = self.ledger.cancel(id)?;
        let in_flight = self.in_flight.lock().map_err(|_| LedgerError::Poisoned)?;
        if let Some(entry) = in_flight.get(&id) {
            entry.token.cancel();
        }
        info!(run_id = %id, newly, "run cancelled");
        Ok(newly)
    }

    pub fn get_run(&self, id: RunId) -> Result<Run, EngineError> {
        Ok(self.ledger.get(id)?)
    }

    pub fn list(&self, mode: RunMode) -> Result<Vec<Run>, EngineError> {
        Ok(self.ledger.list(mode)?)
    }

    /// Clear one mode's history; in-flight results for those runs are dropped.
    pub fn clear(&self, mode: RunMode) -> Result<usize, EngineError> {
        let ids: Vec<RunId> = self.ledger.list(mode)?.iter().map(|r| r.id).collect();
        let removed = self.ledger.clear(mode)?;
        let mut in_flight = self.in_flight.lock().map_err(|_| LedgerError::Poisoned)?;
        for id in ids {
            if let Some(entry) = in_flight.remove(&id) {
                entry.token.cancel();
            }
        }
        info!(mode = %mode, removed, "ledger cleared");
        Ok(removed)
    }

    pub fn active_run(&self, mode: RunMode) -> Result<Option<Run>, EngineError> {
        Ok(self.ledger.active(mode)?)
    }
}
