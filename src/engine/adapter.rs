//! Provider adapters and the model registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};

use super::error::{item_error, EngineError};
use super::prompts::PromptInstance;
use super::types::{Content, GenerationConfig, ItemKind, ModelId, ResultItem};

/// Uniform interface to one generative-model backend.
///
/// `invoke` always returns an item: failures become `ResultItem.error` with
/// the latency up to the failure. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &PromptInstance,
        config: &GenerationConfig,
        attribution: Attribution,
    ) -> ResultItem;
}

/// Adapter that sends the call through a [`ChatGateway`].
#[derive(Clone)]
pub struct GatewayAdapter {
    gateway: Arc<dyn ChatGateway>,
}

impl GatewayAdapter {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ProviderAdapter for GatewayAdapter {
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &PromptInstance,
        config: &GenerationConfig,
        attribution: Attribution,
    ) -> ResultItem {
        let kind = ItemKind::ModelOutput;
        let mut request = ChatRequest::new(
            ChatModel::openrouter(model_id),
            prompt.to_messages(config),
            attribution,
        )
        .temperature(config.temperature)
        .max_tokens(config.max_tokens);
        // Only OpenAI models reliably support response_format=json_object via OpenRouter.
        if prompt.expects_json && model_id.starts_with("openai/") {
            request = request.json();
        }

        let start = Instant::now();
        let result = self.gateway.chat(request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.content.trim().is_empty() => ResultItem::failure(
                kind,
                model_id,
                latency_ms,
                item_error::format(
                    item_error::EMPTY_RESPONSE,
                    format!("provider returned no content (finish_reason {:?})", resp.finish_reason),
                ),
            ),
            Ok(resp) => ResultItem::success(
                kind,
                model_id,
                latency_ms,
                Content::new(prompt.response_format(), resp.content),
            ),
            Err(err) => ResultItem::failure(kind, model_id, latency_ms, err.diagnostic()),
        }
    }
}

/// Maps model identifiers to exactly one adapter each.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    adapters: HashMap<ModelId, Arc<dyn ProviderAdapter>>,
    order: Vec<ModelId>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every id against one shared adapter.
    pub fn with_models<I, S>(models: I, adapter: Arc<dyn ProviderAdapter>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ModelId>,
    {
        let mut registry = Self::new();
        for model in models {
            registry.register(model, adapter.clone());
        }
        registry
    }

    /// Registering an id twice replaces its adapter.
    pub fn register(&mut self, model_id: impl Into<ModelId>, adapter: Arc<dyn ProviderAdapter>) {
        let model_id = model_id.into();
        if self.adapters.insert(model_id.clone(), adapter).is_none() {
            self.order.push(model_id);
        }
    }

    pub fn resolve(&self, model_id: &str) -> Result<Arc<dyn ProviderAdapter>, EngineError> {
        self.adapters
            .get(model_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(model_id.to_string()))
    }

    /// Resolve every id, failing on the first unknown one.
    pub fn resolve_all(&self, model_ids: &[ModelId]) -> Result<Vec<Arc<dyn ProviderAdapter>>, EngineError> {
        model_ids.iter().map(|id| self.resolve(id)).collect()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.adapters.contains_key(model_id)
    }

    /// Registered ids in registration order.
    pub fn model_ids(&self) -> &[ModelId] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::prompts;
    use crate::engine::types::ContentFormat;
    use crate::gateway::{ChatResponse, FinishReason, ProviderError};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedGateway {
        reply: Result<String, ()>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatGateway for ScriptedGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(req);
            match &self.reply {
                Ok(content) => Ok(ChatResponse {
                    content: content.clone(),
                    input_tokens: 1,
                    output_tokens: 1,
                    upstream_cost_nanodollars: None,
                    latency: Duration::from_millis(1),
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(ProviderError::provider("openrouter", "bad gateway", true)),
            }
        }
    }

    fn gateway(reply: Result<String, ()>) -> Arc<ScriptedGateway> {
        Arc::new(ScriptedGateway {
            reply,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn gateway_adapter_maps_success_and_failure() {
        let ok = GatewayAdapter::new(gateway(Ok("hello".into())));
        let item = ok
            .invoke("a/b", &prompts::primary("hi"), &GenerationConfig::default(), Attribution::new("test"))
            .await;
        assert_eq!(item.text(), Some("hello"));
        assert_eq!(item.content.as_ref().unwrap().format, ContentFormat::Markdown);

        let failing = GatewayAdapter::new(gateway(Err(())));
        let item = failing
            .invoke("a/b", &prompts::primary("hi"), &GenerationConfig::default(), Attribution::new("test"))
            .await;
        assert_eq!(item.error.as_deref(), Some("provider_error: openrouter error: bad gateway"));
        assert!(item.content.is_none());
    }

    #[tokio::test]
    async fn blank_content_is_an_empty_response_failure() {
        let adapter = GatewayAdapter::new(gateway(Ok("   ".into())));
        let item = adapter
            .invoke("a/b", &prompts::primary("hi"), &GenerationConfig::default(), Attribution::new("test"))
            .await;
        assert_eq!(item_error::code_of(item.error.as_deref().unwrap()), "empty_response");
    }

    #[tokio::test]
    async fn json_mode_only_for_openai_models() {
        let gw = gateway(Ok("{}".into()));
        let adapter = GatewayAdapter::new(gw.clone());
        let judge = prompts::judge_multi("q", &[]);
        let config = GenerationConfig::default();
        adapter.invoke("openai/gpt-5-mini", &judge, &config, Attribution::new("test")).await;
        adapter.invoke("anthropic/claude", &judge, &config, Attribution::new("test")).await;

        let seen = gw.seen.lock().unwrap();
        assert!(seen[0].json_mode);
        assert!(!seen[1].json_mode);
        assert_eq!(seen[0].max_tokens, Some(config.max_tokens));
    }

    #[test]
    fn registry_rejects_unknown_models_and_keeps_order() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(GatewayAdapter::new(gateway(Ok("x".into()))));
        let registry = ModelRegistry::with_models(["b", "a", "b"], adapter);
        assert_eq!(registry.model_ids(), &["b".to_string(), "a".to_string()]);
        assert!(registry.resolve("a").is_ok());
        assert!(matches!(registry.resolve("zzz"), Err(EngineError::UnknownModel(m)) if m == "zzz"));
        assert!(registry.resolve_all(&["a".into(), "nope".into()]).is_err());
    }
}
