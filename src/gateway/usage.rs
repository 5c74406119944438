//! Usage tracking via the UsageSink trait.
//!
//! Every provider attempt (including failed retries) is reported to a sink.
//! The server and CLI log them through [`TracingUsageSink`]; tests use
//! [`NoopUsageSink`] or a collecting sink of their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

/// Record of a single provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Provider-reported upstream inference cost in nanodollars, if available.
    pub upstream_cost_nanodollars: Option<i64>,
    /// Ledger run the call was made for.
    pub run_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub caller: &'static str,
    pub request_id: Option<String>,
    /// Zero-based retry attempt.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            upstream_cost_nanodollars: None,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            request_id: None,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn upstream_cost(mut self, nanodollars: Option<i64>) -> Self {
        self.upstream_cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Trait for recording provider call usage.
///
/// Recording is fire-and-forget: failures should be logged, never propagated.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

/// Usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that emits one structured `tracing` event per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let run_id = record.run_id.map(|id| id.to_string());
        match record.status {
            CallStatus::Success => info!(
                target: "panel::usage",
                provider = record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = run_id.as_deref(),
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                upstream_cost_nanodollars = record.upstream_cost_nanodollars,
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                "provider call"
            ),
            CallStatus::Error => warn!(
                target: "panel::usage",
                provider = record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = run_id.as_deref(),
                error_code = record.error_code.as_deref(),
                request_id = record.request_id.as_deref(),
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                "provider call failed"
            ),
        }
    }
}
