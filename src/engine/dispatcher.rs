//! Concurrent fan-out of one phase's adapter calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::gateway::Attribution;

use super::adapter::{ModelRegistry, ProviderAdapter};
use super::envelope::Envelope;
use super::error::{item_error, EngineError};
use super::ledger::RunId;
use super::prompts::PromptInstance;
use super::trace::{now_epoch_ms, CallTrace, TraceSink};
use super::types::{GenerationConfig, ModelId, Phase, ResultItem};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(45);

// =============================================================================
// Cancellation
// =============================================================================

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared by every call of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called (immediately if it already was).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Who a dispatch is for.
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    pub run_id: Option<RunId>,
    pub cancel: Option<CancelToken>,
}

impl CallScope {
    pub fn for_run(run_id: RunId, cancel: CancelToken) -> Self {
        Self {
            run_id: Some(run_id),
            cancel: Some(cancel),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    call_timeout: Duration,
    trace: Option<Arc<dyn TraceSink>>,
}

fn caller_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Primary => "dispatch::primary",
        Phase::JudgeMulti => "dispatch::judge_multi",
        Phase::JudgeSingle => "dispatch::judge_single",
        Phase::Orchestrate => "dispatch::orchestrate",
        Phase::Chat => "dispatch::chat",
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run one adapter call per entry of `model_ids`, all in flight at once.
    ///
    /// Returns after every call settled. Items follow `model_ids` order and
    /// duplicates each get their own call. Only an empty list, an unknown id
    /// or an invalid config fail the whole dispatch, before any call starts.
    pub async fn run(
        &self,
        phase: Phase,
        model_ids: &[ModelId],
        prompt: &PromptInstance,
        config: &GenerationConfig,
        scope: &CallScope,
    ) -> Result<Envelope, EngineError> {
        if model_ids.is_empty() {
            return Err(EngineError::invalid("model list must not be empty"));
        }
        config.validate().map_err(EngineError::InvalidRequest)?;
        let adapters = self.registry.resolve_all(model_ids)?;

        let n = model_ids.len();
        info!(
            phase = %phase,
            models = n,
            run_id = ?scope.run_id,
            template = prompt.template_slug,
            "dispatch started"
        );

        let calls = adapters
            .into_iter()
            .zip(model_ids)
            .enumerate()
            .map(|(index, (adapter, model_id))| async move {
                let item = self
                    .invoke_one(phase, adapter.as_ref(), model_id, prompt, config, scope)
                    .await;
                (index, item)
            })
            .collect::<Vec<_>>();

        let mut slots: Vec<Option<ResultItem>> = (0..n).map(|_| None).collect();
        let mut settled = stream::iter(calls).buffer_unordered(n);
        while let Some((index, item)) = settled.next().await {
            self.trace_call(phase, index, prompt, &item, scope);
            slots[index] = Some(item);
        }

        let kind = phase.item_kind();
        let items: Vec<ResultItem> = slots
            .into_iter()
            .zip(model_ids)
            .map(|(slot, model_id)| {
                slot.unwrap_or_else(|| {
                    ResultItem::failure(kind, model_id.clone(), 0, "internal: call never settled")
                })
            })
            .collect();

        let envelope = Envelope::build(phase, items);
        info!(
            phase = %phase,
            models = n,
            failed = envelope.failed_count(),
            run_id = ?scope.run_id,
            "dispatch settled"
        );
        Ok(envelope)
    }

    async fn invoke_one(
        &self,
        phase: Phase,
        adapter: &dyn ProviderAdapter,
        model_id: &ModelId,
        prompt: &PromptInstance,
        config: &GenerationConfig,
        scope: &CallScope,
    ) -> ResultItem {
        let kind = phase.item_kind();
        let timeout_ms = self.call_timeout.as_millis() as u64;

        if scope.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return ResultItem::failure(
                kind,
                model_id.clone(),
                0,
                item_error::format(item_error::CANCELLED, "run was cancelled before the call started"),
            );
        }

        let mut attribution = Attribution::new(caller_for(phase));
        if let Some(run_id) = scope.run_id {
            attribution = attribution.with_run(run_id);
        }

        let call = tokio::time::timeout(
            self.call_timeout,
            adapter.invoke(model_id, prompt, config, attribution),
        );
        let started = tokio::time::Instant::now();

        let outcome = match &scope.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = call => Some(result),
            },
            None => Some(call.await),
        };

        let mut item = match outcome {
            Some(Ok(item)) => item,
            Some(Err(_elapsed)) => ResultItem::failure(
                kind,
                model_id.clone(),
                timeout_ms,
                item_error::format(item_error::TIMEOUT, format!("no response within {timeout_ms}ms")),
            ),
            None => ResultItem::failure(
                kind,
                model_id.clone(),
                started.elapsed().as_millis() as u64,
                item_error::format(item_error::CANCELLED, "run was cancelled"),
            ),
        };
        item.kind = kind;
        item.model_id = model_id.clone();
        if item.error.is_some() {
            item.content = None;
        } else if !item.is_settled() {
            item.fail(item_error::format(item_error::EMPTY_RESPONSE, "adapter returned no content"));
        }

        match &item.error {
            Some(error) => warn!(phase = %phase, model = %model_id, latency_ms = item.latency_ms, %error, "adapter call failed"),
            None => debug!(phase = %phase, model = %model_id, latency_ms = item.latency_ms, "adapter call settled"),
        }
        item
    }

    fn trace_call(&self, phase: Phase, index: usize, prompt: &PromptInstance, item: &ResultItem, scope: &CallScope) {
        let Some(trace) = &self.trace else {
            return;
        };
        let event = CallTrace {
            timestamp_ms: now_epoch_ms(),
            run_id: scope.run_id.map(|id| id.to_string()),
            phase: phase.as_str().to_string(),
            index,
            model_id: item.model_id.clone(),
            prompt_template: prompt.template_slug.to_string(),
            prompt_hash: prompt.hash(),
            latency_ms: item.latency_ms,
            outcome: item
                .error
                .as_deref()
                .map(|e| item_error::code_of(e).to_string())
                .unwrap_or_else(|| "ok".to_string()),
            error: item.error.clone(),
        };
        if let Err(err) = trace.record(event) {
            warn!(error = %err, "failed to record call trace");
        }
    }
}
