//! Synthesizer: merges primary outputs into one final answer.

use serde_json::Value;
use tracing::{debug, info};

use crate::gateway::Message;

use super::dispatcher::{CallScope, Dispatcher};
use super::envelope::Envelope;
use super::error::EngineError;
use super::parse::parse_synthesis;
use super::prompts;
use super::types::{Content, GenerationConfig, ModelId, Phase, ResultItem, SynthesisPayload};

/// Orchestrator call outcome: the one-item envelope plus the payload, when
/// the orchestrator answered at all.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub envelope: Envelope,
    pub payload: Option<SynthesisPayload>,
}

/// Ask the orchestrator for `{finalAnswer, rationale}` over every output.
///
/// A reply that is not that JSON shape still succeeds: its text becomes the
/// final answer and the rationale stays empty (`meta.synthesis_fallback`).
pub async fn orchestrate(
    dispatcher: &Dispatcher,
    orchestrator_id: &ModelId,
    prompt: &str,
    outputs: &[ResultItem],
    instruction: Option<&str>,
    config: &GenerationConfig,
    scope: &CallScope,
) -> Result<Synthesis, EngineError> {
    if outputs.is_empty() {
        return Err(EngineError::invalid("outputs must not be empty"));
    }
    let synthesis_prompt = prompts::synthesis(prompt, outputs, instruction);
    let envelope = dispatcher
        .run(
            Phase::Orchestrate,
            std::slice::from_ref(orchestrator_id),
            &synthesis_prompt,
            config,
            scope,
        )
        .await?;

    let mut fallback = false;
    let mut payload = None;
    let items: Vec<ResultItem> = envelope
        .items
        .into_iter()
        .map(|mut item| {
            let Some(raw) = item.text().map(str::to_string) else {
                return item;
            };
            let parsed = parse_synthesis(&raw).unwrap_or_else(|| {
                debug!(orchestrator = %item.model_id, "synthesis reply was not JSON; using plain text");
                fallback = true;
                SynthesisPayload {
                    final_answer: raw,
                    rationale: String::new(),
                }
            });
            item.content = Some(Content::markdown(parsed.final_answer.clone()));
            item.structured = serde_json::to_value(&parsed).ok();
            payload = Some(parsed);
            item
        })
        .collect();

    let mut envelope = Envelope::build(Phase::Orchestrate, items);
    if fallback {
        envelope = envelope.with_meta("synthesis_fallback", Value::Bool(true));
    }
    info!(orchestrator = %orchestrator_id, answered = payload.is_some(), "synthesis settled");
    Ok(Synthesis { envelope, payload })
}

/// Send a follow-up on a synthesized thread to the orchestrator.
///
/// On success returns the new user and assistant turns to append.
pub async fn continue_thread(
    dispatcher: &Dispatcher,
    orchestrator_id: &ModelId,
    thread: &[Message],
    message: &str,
    config: &GenerationConfig,
    scope: &CallScope,
) -> Result<(Envelope, Option<Vec<Message>>), EngineError> {
    if message.trim().is_empty() {
        return Err(EngineError::invalid("message must not be empty"));
    }
    if thread.is_empty() {
        return Err(EngineError::invalid("run has no synthesized thread to continue"));
    }

    let prompt = prompts::continuation(thread, message);
    let envelope = dispatcher
        .run(Phase::Chat, std::slice::from_ref(orchestrator_id), &prompt, config, scope)
        .await?;

    let turns = envelope
        .items
        .first()
        .and_then(ResultItem::text)
        .map(|reply| vec![Message::user(message), Message::assistant(reply)]);
    Ok((envelope, turns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::{ModelRegistry, ProviderAdapter};
    use crate::engine::prompts::PromptInstance;
    use crate::engine::types::ItemKind;
    use crate::gateway::Attribution;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixed(&'static str);

    #[async_trait]
    impl ProviderAdapter for Fixed {
        async fn invoke(
            &self,
            model_id: &str,
            _prompt: &PromptInstance,
            _config: &GenerationConfig,
            _attribution: Attribution,
        ) -> ResultItem {
            ResultItem::success(ItemKind::ModelOutput, model_id, 2, Content::markdown(self.0))
        }
    }

    fn dispatcher(reply: &'static str) -> Dispatcher {
        let registry = ModelRegistry::with_models(["orc"], Arc::new(Fixed(reply)) as Arc<dyn ProviderAdapter>);
        Dispatcher::new(Arc::new(registry), Duration::from_secs(1))
    }

    fn outputs() -> Vec<ResultItem> {
        vec![ResultItem::success(ItemKind::ModelOutput, "m1", 1, Content::markdown("candidate"))]
    }

    #[tokio::test]
    async fn structured_reply_populates_payload() {
        let d = dispatcher(r#"{"finalAnswer": "merged", "rationale": "m1 was right"}"#);
        let s = orchestrate(&d, &"orc".into(), "q", &outputs(), None, &GenerationConfig::default(), &CallScope::default())
            .await
            .unwrap();
        let item = &s.envelope.items[0];
        assert_eq!(item.kind, ItemKind::Synthesis);
        assert_eq!(item.text(), Some("merged"));
        assert_eq!(item.structured.as_ref().unwrap()["rationale"], "m1 was right");
        assert!(s.envelope.meta.is_none());
    }

    #[tokio::test]
    async fn plain_reply_falls_back_without_error() {
        let d = dispatcher("Just use m1's answer.");
        let s = orchestrate(&d, &"orc".into(), "q", &outputs(), Some("be brief"), &GenerationConfig::default(), &CallScope::default())
            .await
            .unwrap();
        let payload = s.payload.unwrap();
        assert_eq!(payload.final_answer, "Just use m1's answer.");
        assert_eq!(payload.rationale, "");
        assert!(s.envelope.items[0].error.is_none());
        assert_eq!(s.envelope.meta.unwrap()["synthesis_fallback"], true);
    }

    #[tokio::test]
    async fn continuation_returns_turns() {
        let d = dispatcher("follow-up answer");
        let thread = vec![Message::user("q"), Message::assistant("merged")];
        let (env, turns) = continue_thread(&d, &"orc".into(), &thread, "why?", &GenerationConfig::default(), &CallScope::default())
            .await
            .unwrap();
        assert_eq!(env.phase, Phase::Chat);
        assert_eq!(turns.unwrap(), vec![Message::user("why?"), Message::assistant("follow-up answer")]);

        let err = continue_thread(&d, &"orc".into(), &[], "why?", &GenerationConfig::default(), &CallScope::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());
    }
}
