#![forbid(unsafe_code)]

//! # panel-harness
//!
//! Ask several LLMs the same question at once, have other LLMs judge the
//! answers for risk, and let one model merge them into a final answer.
//!
//! Every model call settles into a uniform [`ResultItem`]; a slow or broken
//! model shows up as a failed item in its slot and never takes the rest of
//! the panel down with it. Runs and their phases are kept in an in-memory
//! [`engine::RunLedger`], one history per mode.

pub mod config;
pub mod engine;
pub mod gateway;
pub mod server;
pub mod telemetry;

pub use config::{ConfigError, EngineConfig, ModelPreset};
pub use engine::{
    Dispatcher, Engine, EngineError, EngineOptions, Envelope, GenerationConfig, ModelRegistry,
    ProviderAdapter, ResultItem, Run, RunId, RunMode,
};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
