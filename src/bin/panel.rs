#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use panel_harness::config::{EngineConfig, ModelPreset};
use panel_harness::engine::{Engine, GenerationConfig, TraceWorker};
use panel_harness::gateway::{ChatGateway, ProviderGateway, TracingUsageSink};
use panel_harness::{server, telemetry};

#[derive(Parser)]
#[command(name = "panel", version, about = "Ask a panel of models, judge the answers, synthesize one")]
struct Cli {
    /// JSON engine config; PANEL_* variables override it
    #[arg(long, global = true, env = "PANEL_CONFIG")]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Overrides the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Send one prompt to every model and print the run
    Compare {
        #[command(flatten)]
        input: PromptArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare, judge, and synthesize in one go
    Run {
        #[command(flatten)]
        input: PromptArgs,
        /// Judge model ids (comma-separated); single mode uses the first
        #[arg(long, value_delimiter = ',')]
        judges: Vec<String>,
        #[arg(long, value_enum, default_value_t = JudgeMode::Multi)]
        judge_mode: JudgeMode,
        /// Orchestrator model id; skipped when absent
        #[arg(long)]
        orchestrator: Option<String>,
        #[arg(long)]
        orchestration_prompt: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List the models of a preset, or of the loaded config
    Models {
        #[arg(long)]
        preset: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum JudgeMode {
    Multi,
    Single,
}

#[derive(clap::Args)]
struct PromptArgs {
    /// Prompt text
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    /// Read the prompt from a file
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// Model ids (comma-separated); defaults to the configured panel
    #[arg(long, value_delimiter = ',', conflicts_with = "preset")]
    models: Vec<String>,
    /// Use a preset panel (frontier, balanced, fast) instead of --models
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    system: Option<String>,
}

impl PromptArgs {
    fn prompt(&self) -> Result<String, Box<dyn std::error::Error>> {
        match (&self.prompt, &self.prompt_file) {
            (Some(p), _) => Ok(p.clone()),
            (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
            (None, None) => Err("one of --prompt or --prompt-file is required".into()),
        }
    }

    fn generation_config(&self) -> GenerationConfig {
        let mut config = GenerationConfig::default();
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            config.max_tokens = m;
        }
        if let Some(system) = &self.system {
            config.include_system_instruction = true;
            config.system_prompt = system.clone();
        }
        config
    }

    /// The panel to compare: explicit ids, else the preset, else the config.
    fn model_ids(&self, config: &EngineConfig) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        if !self.models.is_empty() {
            return Ok(self.models.clone());
        }
        match &self.preset {
            Some(name) => Ok(parse_preset(name)?.models()),
            None => Ok(config.model_ids()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json_logs, cli.log_level);

    let base = match &cli.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    let mut config = base.with_overrides(|name| std::env::var(name).ok())?;

    match cli.command {
        Commands::Models { preset } => {
            let models = match preset {
                Some(name) => parse_preset(&name)?.models(),
                None => config.model_ids(),
            };
            let mut stdout = io::stdout().lock();
            for model in models {
                writeln!(stdout, "{model}")?;
            }
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            let addr = config.bind_addr()?;
            let (engine, _worker) = build_engine(&config)?;
            server::serve(Arc::new(engine), addr).await?;
        }
        Commands::Compare { input, out } => {
            let models = input.model_ids(&config)?;
            let (engine, worker) = build_engine(&config)?;
            let run = engine
                .compare(models, input.prompt()?, input.generation_config())
                .await?;
            emit(out.as_ref(), &run)?;
            finish(engine, worker)?;
        }
        Commands::Run {
            input,
            judges,
            judge_mode,
            orchestrator,
            orchestration_prompt,
            out,
        } => {
            let models = input.model_ids(&config)?;
            let (engine, worker) = build_engine(&config)?;
            let run = engine
                .compare(models, input.prompt()?, input.generation_config())
                .await?;
            if !judges.is_empty() {
                match judge_mode {
                    JudgeMode::Multi => {
                        engine.evaluate_multi(run.id, judges).await?;
                    }
                    JudgeMode::Single => {
                        let evaluator = judges.into_iter().next().ok_or("missing evaluator")?;
                        engine.evaluate_single(run.id, evaluator).await?;
                    }
                }
            }
            if let Some(orchestrator) = orchestrator {
                engine.orchestrate(run.id, orchestrator, orchestration_prompt).await?;
            }
            emit(out.as_ref(), &engine.get_run(run.id)?)?;
            finish(engine, worker)?;
        }
    }
    Ok(())
}

fn parse_preset(name: &str) -> Result<ModelPreset, String> {
    ModelPreset::parse(name).ok_or_else(|| format!("unknown preset '{name}'"))
}

fn build_engine(config: &EngineConfig) -> Result<(Engine, Option<TraceWorker>), Box<dyn std::error::Error>> {
    let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::from_env(
        Arc::new(TracingUsageSink),
        config.gateway_config(),
    )?);
    Ok(config.build_engine(gateway)?)
}

/// Drop the engine so the trace writer drains, then wait for it.
fn finish(engine: Engine, worker: Option<TraceWorker>) -> Result<(), Box<dyn std::error::Error>> {
    drop(engine);
    if let Some(worker) = worker {
        worker.join()?;
    }
    Ok(())
}

fn emit<T: serde::Serialize>(out: Option<&PathBuf>, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => writeln!(io::stdout().lock(), "{json}")?,
    }
    Ok(())
}
