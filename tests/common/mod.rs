#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use panel_harness::engine::{
    Content, Engine, EngineOptions, GenerationConfig, ItemKind, ModelRegistry, PromptInstance,
    ProviderAdapter, ResultItem,
};
use panel_harness::gateway::Attribution;

/// What a scripted model does when called.
#[derive(Clone)]
pub enum Script {
    Reply(String),
    Delayed(Duration, String),
    Fail(String),
    /// Waits for the gate, then replies.
    Gated(Arc<Notify>, String),
    Hang,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub model_id: String,
    pub template: &'static str,
    pub prompt_text: String,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// In-process adapter whose replies are scripted per model id.
///
/// Unscripted models answer `"<model>:<template>"` immediately.
#[derive(Default)]
pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, model_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(model_id.to_string(), script);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, template: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.template == template)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &PromptInstance,
        config: &GenerationConfig,
        _attribution: Attribution,
    ) -> ResultItem {
        let started = Instant::now();
        let prompt_text = prompt
            .to_messages(config)
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(CallRecord {
                model_id: model_id.to_string(),
                template: prompt.template_slug,
                prompt_text,
                started,
                finished: None,
            });
            calls.len() - 1
        };
        let script = self.scripts.lock().unwrap().get(model_id).cloned();

        let outcome = match script {
            None => Ok(format!("{model_id}:{}", prompt.template_slug)),
            Some(Script::Reply(text)) => Ok(text),
            Some(Script::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Gated(gate, text)) => {
                gate.notified().await;
                Ok(text)
            }
            Some(Script::Hang) => std::future::pending().await,
        };

        self.calls.lock().unwrap()[index].finished = Some(Instant::now());
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(text) => ResultItem::success(ItemKind::ModelOutput, model_id, latency_ms, Content::markdown(text)),
            Err(error) => ResultItem::failure(ItemKind::ModelOutput, model_id, latency_ms, error),
        }
    }
}

pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Engine whose every listed model is served by `adapter`.
pub fn engine(adapter: &Arc<ScriptedAdapter>, models: &[&str], call_timeout: Duration) -> Engine {
    let shared: Arc<dyn ProviderAdapter> = adapter.clone();
    let registry = ModelRegistry::with_models(models.iter().copied(), shared);
    Engine::new(
        registry,
        EngineOptions {
            call_timeout,
            trace: None,
        },
    )
}
