use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::tempdir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use panel_harness::config::{EngineConfig, RetryConfig};
use panel_harness::engine::{AssessmentMatrix, GenerationConfig, MatrixCell, RiskLabel, RunMode};
use panel_harness::gateway::openrouter::OpenRouterAdapter;
use panel_harness::gateway::{ChatGateway, NoopUsageSink, ProviderGateway};

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
    }))
}

async fn mount_model(server: &MockServer, model: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": model })))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_run_over_openrouter_wire_format() {
    let server = MockServer::start().await;
    mount_model(&server, "openai/gpt-5-mini", completion("Four.")).await;
    mount_model(
        &server,
        "anthropic/claude-opus-4-6",
        ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "overloaded", "code": 500 }
        })),
    )
    .await;
    mount_model(
        &server,
        "openai/judge",
        completion(
            &json!({"assessments": [
                {"targetModelId": "openai/gpt-5-mini", "risk_score": 4, "risk_label": "LOW"}
            ]})
            .to_string(),
        ),
    )
    .await;
    mount_model(
        &server,
        "google/orchestrator",
        completion("Here you go:\n```json\n{\"finalAnswer\": \"4\", \"rationale\": \"only one model answered\"}\n```"),
    )
    .await;

    let dir = tempdir().unwrap();
    let trace_path = dir.path().join("calls.jsonl");
    let config = EngineConfig {
        models: vec![
            "openai/gpt-5-mini".into(),
            "anthropic/claude-opus-4-6".into(),
            "openai/judge".into(),
            "google/orchestrator".into(),
        ],
        retry: RetryConfig {
            max_retries: 0,
            retry_base_delay_ms: 0,
        },
        trace_path: Some(trace_path.clone()),
        ..EngineConfig::default()
    };

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        config.gateway_config(),
    ));
    let (engine, worker) = config.build_engine(gateway).unwrap();

    let run = engine
        .compare(
            vec!["openai/gpt-5-mini".into(), "anthropic/claude-opus-4-6".into()],
            "What is 2+2?",
            GenerationConfig {
                include_system_instruction: true,
                system_prompt: "Answer tersely.".into(),
                ..GenerationConfig::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.primary.items[0].text(), Some("Four."));
    assert!(run.primary.items[1]
        .error
        .as_deref()
        .unwrap()
        .starts_with("provider_error"));

    let judged = engine
        .evaluate_multi(run.id, vec!["openai/judge".into()])
        .await
        .unwrap();
    let matrix = AssessmentMatrix::from_envelope(&run.models.primary, &judged);
    assert_eq!(
        matrix.cell(0, "openai/gpt-5-mini").risk_label(),
        Some(RiskLabel::Low)
    );
    assert_eq!(matrix.cell(0, "anthropic/claude-opus-4-6"), MatrixCell::NotAvailable);

    engine
        .orchestrate(run.id, "google/orchestrator".into(), None)
        .await
        .unwrap();
    let run = engine.get_run(run.id).unwrap();
    assert_eq!(run.final_answer.as_deref(), Some("4"));
    assert_eq!(run.rationale.as_deref(), Some("only one model answered"));
    assert_eq!(engine.list(RunMode::Compare).unwrap().len(), 1);

    // Wire details: system instruction first, JSON mode only for OpenAI judges.
    let received = server.received_requests().await.unwrap();
    let bodies: Vec<Value> = received
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    let primary_body = bodies
        .iter()
        .find(|b| b["model"] == "openai/gpt-5-mini")
        .unwrap();
    assert_eq!(primary_body["messages"][0]["role"], "system");
    assert_eq!(primary_body["messages"][0]["content"], "Answer tersely.");
    assert!(primary_body.get("response_format").is_none());
    let judge_body = bodies.iter().find(|b| b["model"] == "openai/judge").unwrap();
    assert_eq!(judge_body["response_format"]["type"], "json_object");
    let orchestrator_body = bodies
        .iter()
        .find(|b| b["model"] == "google/orchestrator")
        .unwrap();
    assert!(orchestrator_body.get("response_format").is_none());

    drop(engine);
    worker.unwrap().join().unwrap();
    let raw = std::fs::read_to_string(&trace_path).unwrap();
    let rows: Vec<Value> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(rows.len(), 4);
    let run_id = run.id.to_string();
    assert!(rows.iter().all(|r| r["run_id"] == run_id.as_str()));
    let failed: Vec<&Value> = rows.iter().filter(|r| r["outcome"] != "ok").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["outcome"], "provider_error");
    assert_eq!(failed[0]["phase"], "primary");
}
