//! Provider gateway for OpenRouter chat completions.
//!
//! [`ChatGateway`] is the seam the engine's adapters call through;
//! [`ProviderGateway`] adds bounded retries with exponential backoff and
//! reports every attempt to a [`UsageSink`].

pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<P: ChatProvider = OpenRouterAdapter> {
    provider: P,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<P: ChatProvider> ChatGateway for ProviderGateway<P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway<OpenRouterAdapter> {
    pub fn from_env(
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let openrouter = OpenRouterAdapter::from_env()?;
        Ok(Self::with_config(openrouter, usage_sink, config))
    }
}

impl<P: ChatProvider> ProviderGateway<P> {
    pub fn with_config(provider: P, usage_sink: Arc<dyn UsageSink>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    let record = self
                        .base_record(&req, attempt)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .upstream_cost(resp.upstream_cost_nanodollars)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .base_record(&req, attempt)
                        .latency(started.elapsed().as_millis() as u64)
                        .request_id(err.request_id().map(str::to_string))
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    debug!(
                        model = req.model.model_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code(),
                        "retrying provider call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn base_record(&self, req: &ChatRequest, attempt: u32) -> ProviderCallRecord {
        ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .attempt(attempt)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}
