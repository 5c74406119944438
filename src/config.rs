//! Engine configuration: JSON file or `PANEL_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineOptions, GatewayAdapter, JsonlTraceSink, ModelRegistry, ProviderAdapter, TraceWorker};
use crate::gateway::{ChatGateway, GatewayConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
    #[error("failed to open trace file: {0}")]
    Trace(#[from] crate::engine::TraceError),
}

fn invalid(name: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        message: message.into(),
    }
}

// =============================================================================
// Presets
// =============================================================================

/// Predefined model panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPreset {
    /// Widest panel of top-tier models.
    Frontier,
    /// Three strong models from different vendors.
    #[default]
    Balanced,
    /// Two fast models for quick iteration.
    Fast,
}

impl ModelPreset {
    pub const ALL: [ModelPreset; 3] = [ModelPreset::Frontier, ModelPreset::Balanced, ModelPreset::Fast];

    pub fn models(self) -> Vec<String> {
        match self {
            Self::Frontier => vec![
                "anthropic/claude-opus-4-6".into(),
                "openai/gpt-5.2-pro".into(),
                "google/gemini-3.1-pro".into(),
                "moonshotai/kimi-k2.5".into(),
                "x-ai/grok-4.1-fast".into(),
            ],
            Self::Balanced => vec![
                "anthropic/claude-opus-4-6".into(),
                "openai/gpt-5-mini".into(),
                "google/gemini-3.1-pro".into(),
            ],
            Self::Fast => vec!["openai/gpt-5-mini".into(), "x-ai/grok-4.1-fast".into()],
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frontier" => Some(Self::Frontier),
            "balanced" => Some(Self::Balanced),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }
}

// =============================================================================
// Engine config
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            max_retries: gateway.max_retries,
            retry_base_delay_ms: gateway.retry_base_delay.as_millis() as u64,
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    45_000
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Registered model ids; the preset's list is used when empty.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub preset: ModelPreset,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            preset: ModelPreset::default(),
            call_timeout_ms: default_call_timeout_ms(),
            retry: RetryConfig::default(),
            bind: default_bind(),
            trace_path: None,
        }
    }
}

impl EngineConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `PANEL_MODELS`, `PANEL_PRESET`,
    /// `PANEL_CALL_TIMEOUT_MS`, `PANEL_BIND` and `PANEL_TRACE_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(models) = lookup("PANEL_MODELS") {
            self.models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(preset) = lookup("PANEL_PRESET") {
            self.preset = ModelPreset::parse(&preset)
                .ok_or_else(|| invalid("PANEL_PRESET", format!("unknown preset '{preset}'")))?;
        }
        if let Some(timeout) = lookup("PANEL_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|e| invalid("PANEL_CALL_TIMEOUT_MS", format!("{e}")))?;
        }
        if let Some(bind) = lookup("PANEL_BIND") {
            self.bind = bind.trim().to_string();
        }
        if let Some(path) = lookup("PANEL_TRACE_PATH").filter(|p| !p.trim().is_empty()) {
            self.trace_path = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout_ms == 0 {
            return Err(invalid("call_timeout_ms", "must be positive"));
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            return Err(invalid("models", "model ids must be non-empty"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| invalid("bind", format!("'{}': {e}", self.bind)))
    }

    /// Explicit models, or the preset's panel.
    pub fn model_ids(&self) -> Vec<String> {
        if self.models.is_empty() {
            self.preset.models()
        } else {
            self.models.clone()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.retry.max_retries,
            retry_base_delay: Duration::from_millis(self.retry.retry_base_delay_ms),
        }
    }

    /// Registry of every configured model behind one gateway adapter.
    /// The configured panel first, then every preset member, so a request
    /// may name a preset instead of a model list.
    pub fn registry(&self, gateway: Arc<dyn ChatGateway>) -> ModelRegistry {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(GatewayAdapter::new(gateway));
        let presets = ModelPreset::ALL.into_iter().flat_map(ModelPreset::models);
        ModelRegistry::with_models(self.model_ids().into_iter().chain(presets), adapter)
    }

    /// Engine over `gateway`, plus the trace writer when tracing is enabled.
    pub fn build_engine(&self, gateway: Arc<dyn ChatGateway>) -> Result<(Engine, Option<TraceWorker>), ConfigError> {
        let mut options = EngineOptions {
            call_timeout: self.call_timeout(),
            trace: None,
        };
        let mut worker = None;
        if let Some(path) = &self.trace_path {
            let (sink, trace_worker) = JsonlTraceSink::new(path)?;
            options.trace = Some(Arc::new(sink));
            worker = Some(trace_worker);
        }
        Ok((Engine::new(self.registry(gateway), options), worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_use_preset_models() {
        let config = EngineConfig::default();
        assert_eq!(config.model_ids(), ModelPreset::Balanced.models());
        assert_eq!(config.call_timeout(), Duration::from_secs(45));
        assert_eq!(config.bind_addr().unwrap().port(), 7878);
        assert_eq!(config.gateway_config().max_retries, 2);
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::default()
            .with_overrides(env(&[
                ("PANEL_MODELS", "a/one, b/two,,"),
                ("PANEL_CALL_TIMEOUT_MS", "1500"),
                ("PANEL_PRESET", "fast"),
            ]))
            .unwrap();
        assert_eq!(config.model_ids(), vec!["a/one".to_string(), "b/two".to_string()]);
        assert_eq!(config.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.preset, ModelPreset::Fast);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        assert!(EngineConfig::default()
            .with_overrides(env(&[("PANEL_PRESET", "huge")]))
            .is_err());
        assert!(EngineConfig::default()
            .with_overrides(env(&[("PANEL_CALL_TIMEOUT_MS", "0")]))
            .is_err());
        assert!(EngineConfig::default()
            .with_overrides(env(&[("PANEL_BIND", "not an addr")]))
            .is_err());
    }

    struct UnreachableGateway;

    #[async_trait::async_trait]
    impl ChatGateway for UnreachableGateway {
        async fn chat(
            &self,
            _req: crate::gateway::ChatRequest,
        ) -> Result<crate::gateway::ChatResponse, crate::gateway::ProviderError> {
            Err(crate::gateway::ProviderError::config("not wired"))
        }
    }

    #[test]
    fn registry_lists_configured_panel_first_and_serves_presets() {
        let config = EngineConfig {
            models: vec!["x/y".into(), "openai/gpt-5-mini".into()],
            ..Default::default()
        };
        let registry = config.registry(Arc::new(UnreachableGateway));
        assert_eq!(&registry.model_ids()[..2], ["x/y".to_string(), "openai/gpt-5-mini".to_string()]);
        for preset in ModelPreset::ALL {
            assert!(preset.models().iter().all(|m| registry.contains(m)));
        }
        let unique: std::collections::HashSet<_> = registry.model_ids().iter().collect();
        assert_eq!(unique.len(), registry.model_ids().len());
    }

    #[test]
    fn loads_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.json");
        std::fs::write(&path, r#"{"models": ["x/y"], "retry": {"max_retries": 0}}"#).unwrap();
        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.models, vec!["x/y".to_string()]);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.retry_base_delay_ms, 1000);
        assert_eq!(config.call_timeout_ms, 45_000);

        assert!(matches!(
            EngineConfig::load_from_path(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
