//! Multi-model dispatch and evaluation engine.
//!
//! A run fans one prompt out to a panel of models ([`dispatcher`]), then
//! optionally has judges assess the answers ([`evaluation`]) and an
//! orchestrator merge them ([`synthesis`]). [`session::Engine`] ties the
//! phases to the [`ledger`].

pub mod adapter;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod evaluation;
pub mod ledger;
pub mod parse;
pub mod prompts;
pub mod session;
pub mod synthesis;
pub mod trace;
pub mod types;

pub use adapter::{GatewayAdapter, ModelRegistry, ProviderAdapter};
pub use dispatcher::{CallScope, CancelToken, Dispatcher, DEFAULT_CALL_TIMEOUT};
pub use envelope::Envelope;
pub use error::EngineError;
pub use evaluation::{AssessmentMatrix, MatrixCell};
pub use ledger::{LedgerError, Run, RunId, RunLedger, RunMode, RunState, SynthesisState};
pub use prompts::PromptInstance;
pub use session::{Engine, EngineOptions};
pub use synthesis::Synthesis;
pub use trace::{CallTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use types::{
    Content, ContentFormat, GenerationConfig, ItemKind, JudgeAssessment, ModelId, Phase, ResultItem,
    RiskLabel, SynthesisPayload,
};
