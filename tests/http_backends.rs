use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use llm_profiler::config::TestConfig;
use llm_profiler::infer::{build_client, Backend, InferenceClient};
use llm_profiler::ramp::RampController;
use llm_profiler::stop::RampOutcome;
use llm_profiler::storage::{statistics_file_regex, JsonDirSink};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn stream_body(lines: Vec<String>) -> Response {
    let chunks = lines
        .into_iter()
        .map(|line| Ok::<_, std::io::Error>(Bytes::from(line)));
    Response::new(Body::from_stream(futures::stream::iter(chunks)))
}

async fn vllm_completions(Json(body): Json<Value>) -> Response {
    if body["model"] == "broken" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "model runner crashed",
        )
            .into_response();
    }
    let max_tokens = body["max_tokens"].as_u64().unwrap_or(16);
    if body["stream"].as_bool().unwrap_or(false) {
        let mut lines = (0..3)
            .map(|index| {
                format!(
                    "data: {{\"object\":\"text_completion\",\"choices\":[{{\"index\":0,\"text\":\"w{index}\",\"finish_reason\":null}}]}}\n\n"
                )
            })
            .collect::<Vec<_>>();
        lines.push(format!(
            "data: {{\"object\":\"text_completion\",\"choices\":[],\"usage\":{{\"prompt_tokens\":9,\"completion_tokens\":{max_tokens}}}}}\n\n"
        ));
        lines.push("data: [DONE]\n\n".to_string());
        return stream_body(lines);
    }
    Json(json!({
        "object": "text_completion",
        "choices": [{ "index": 0, "text": "hello world", "finish_reason": "length" }],
        "usage": { "prompt_tokens": 9, "completion_tokens": max_tokens }
    }))
    .into_response()
}

async fn trt_generate(Json(body): Json<Value>) -> Response {
    Json(json!({
        "model_name": "ensemble",
        "text_output": format!("echo {}", body["text_input"].as_str().unwrap_or_default())
    }))
    .into_response()
}

async fn trt_generate_stream(Json(_body): Json<Value>) -> Response {
    let lines = (0..5)
        .map(|index| format!("data: {{\"model_name\":\"ensemble\",\"text_output\":\"t{index}\"}}\n\n"))
        .collect::<Vec<_>>();
    stream_body(lines)
}

async fn tgi_generate(Json(_body): Json<Value>) -> Response {
    Json(json!({
        "generated_text": "hi there",
        "details": { "prefill": [{}, {}, {}], "tokens": [{}, {}] }
    }))
    .into_response()
}

async fn spawn_server() -> u16 {
    let app = Router::new()
        .route("/v1/completions", post(vllm_completions))
        .route("/v2/models/ensemble/generate", post(trt_generate))
        .route("/v2/models/ensemble/generate_stream", post(trt_generate_stream))
        .route("/generate", post(tgi_generate));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn config(port: u16, backend: Backend, model: &str) -> TestConfig {
    let mut config = TestConfig {
        server_ip: "127.0.0.1".to_string(),
        port,
        backend,
        max_tokens: 24,
        ..TestConfig::default()
    };
    config.model.name = model.to_string();
    config
}

fn client(config: &TestConfig) -> Arc<dyn InferenceClient> {
    build_client(config, CancellationToken::new()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vllm_client_reads_usage() {
    let port = spawn_server().await;
    let config = config(port, Backend::Vllm, "qwen");
    let client = client(&config);
    let params = config.infer_params();

    let reply = client
        .send("hello", &params, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.text, "hello world");
    assert_eq!(reply.input_tokens, 9);
    assert_eq!(reply.output_tokens, 24);

    let handle = client
        .send_streaming("hello", &params, Duration::from_secs(5))
        .await
        .unwrap();
    let metrics = client
        .stream_reducer()
        .reduce(handle.frames, Instant::now())
        .await;
    handle.status.wait().await.unwrap();
    assert_eq!(metrics.output_tokens, 24);
    assert_eq!(metrics.input_tokens, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vllm_server_error_is_reported() {
    let port = spawn_server().await;
    let config = config(port, Backend::Vllm, "broken");
    let client = client(&config);
    let params = config.infer_params();

    let err = client
        .send("hello", &params, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("500"));
    assert!(client
        .send_streaming("hello", &params, Duration::from_secs(5))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trt_client_counts_stream_chunks() {
    let port = spawn_server().await;
    let config = config(port, Backend::Trt, "ensemble");
    let client = client(&config);
    let params = config.infer_params();

    let reply = client
        .send("ping", &params, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.text, "echo ping");
    assert_eq!(reply.output_tokens, 24);

    let handle = client
        .send_streaming("ping", &params, Duration::from_secs(5))
        .await
        .unwrap();
    let metrics = client
        .stream_reducer()
        .reduce(handle.frames, Instant::now())
        .await;
    assert!(handle.status.wait().await.is_ok());
    assert_eq!(metrics.output_tokens, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tgi_client_counts_detail_tokens() {
    let port = spawn_server().await;
    let config = config(port, Backend::Tgi, "bloom");
    let client = client(&config);

    let reply = client
        .send("hi", &config.infer_params(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.text, "hi there");
    assert_eq!(reply.input_tokens, 3);
    assert_eq!(reply.output_tokens, 2);
    assert!(client
        .send_streaming("hi", &config.infer_params(), Duration::from_secs(5))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_ramp_writes_result_files() {
    let port = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(port, Backend::Vllm, "qwen");
    config.start_concurrency = 2;
    config.end_concurrency = 4;
    config.increment = 2;
    config.duration = 0.01;
    config.cooldown_seconds = 0.0;
    config.save_dir = dir.path().display().to_string();
    let sink = Arc::new(JsonDirSink::new(dir.path()));
    let controller = RampController::new(config.clone(), client(&config), sink);

    let report = controller
        .run(Arc::new(vec!["hello".to_string(), "world".to_string()]))
        .await
        .unwrap();

    assert_eq!(report.outcome, RampOutcome::Exhausted);
    assert_eq!(report.summaries.len(), 2);
    assert!(report.summaries.iter().all(|summary| summary.success == summary.total));

    let names = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    let tables = names
        .iter()
        .filter(|name| statistics_file_regex().is_match(name))
        .collect::<Vec<_>>();
    assert_eq!(tables.len(), 1);
    assert!(names.iter().any(|name| name.ends_with("_concurrency_2.json")));
    assert!(names.iter().any(|name| name.ends_with("_concurrency_4.json")));
    assert!(names.iter().any(|name| name.starts_with("config_")));

    let table: Vec<Value> =
        serde_json::from_slice(&std::fs::read(dir.path().join(tables[0])).unwrap()).unwrap();
    let levels = table
        .iter()
        .map(|summary| summary["concurrency"].as_u64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(levels, vec![2, 4]);
    assert!(table[0]["time_spent_summary"]["less than 500 ms"].is_u64());
}
