use anyhow::{anyhow, Result};
use async_trait::async_trait;
use llm_profiler::config::TestConfig;
use llm_profiler::dispatcher::RoundDispatcher;
use llm_profiler::infer::metrics::{StreamReducer, UsageObjectReducer};
use llm_profiler::infer::postprocess::StreamHandle;
use llm_profiler::infer::stream::{StreamFrame, DONE_LINE};
use llm_profiler::infer::{Backend, InferParams, InferenceClient};
use llm_profiler::ramp::{run_ramp, RampController};
use llm_profiler::schemas::{InferenceReply, RequestOutcome};
use llm_profiler::speed::StreamSpeed;
use llm_profiler::statistics::{drain_outcomes, RoundSummary};
use llm_profiler::stop::RampOutcome;
use llm_profiler::storage::ResultSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

enum Reply {
    Tokens(u64),
    Fail,
}

/// `(concurrency, index within the round) -> reply`
type Script = fn(usize, usize) -> Reply;

/// Mock server whose replies depend on the round. Every round issues exactly
/// `concurrency` requests, so the call counter tells which round is running.
struct ScriptedClient {
    levels: Vec<usize>,
    calls: AtomicUsize,
    script: Script,
    latency: Duration,
    cancel: CancellationToken,
}

impl ScriptedClient {
    fn new(levels: Vec<usize>, script: Script) -> Self {
        Self {
            levels,
            calls: AtomicUsize::new(0),
            script,
            latency: Duration::from_millis(100),
            cancel: CancellationToken::new(),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Requests fail like the HTTP transport does once `cancel` fires.
    fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn next_reply(&self) -> Reply {
        let mut call = self.calls.fetch_add(1, Ordering::SeqCst);
        for level in &self.levels {
            if call < *level {
                return (self.script)(*level, call);
            }
            call -= level;
        }
        let last = self.levels.last().copied().unwrap_or(1);
        (self.script)(last, call)
    }
}

fn content_line(text: &str) -> String {
    format!(
        "data: {{\"object\":\"text_completion\",\"choices\":[{{\"index\":0,\"text\":\"{text}\",\"finish_reason\":null}}]}}\n"
    )
}

fn usage_line(completion_tokens: u64) -> String {
    format!(
        "data: {{\"object\":\"text_completion\",\"choices\":[],\"usage\":{{\"prompt_tokens\":16,\"completion_tokens\":{completion_tokens}}}}}\n"
    )
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    fn backend(&self) -> Backend {
        Backend::Vllm
    }

    async fn send(
        &self,
        _prompt: &str,
        _params: &InferParams,
        _timeout: Duration,
    ) -> Result<InferenceReply> {
        let reply = self.next_reply();
        tokio::select! {
            _ = time::sleep(self.latency) => {}
            _ = self.cancel.cancelled() => return Err(anyhow!("request canceled")),
        }
        match reply {
            Reply::Tokens(tokens) => Ok(InferenceReply {
                text: "ok".to_string(),
                input_tokens: 16,
                output_tokens: tokens,
            }),
            Reply::Fail => Err(anyhow!("connection reset by peer")),
        }
    }

    /// Streams one content frame, then the usage frame one second later, so
    /// the client-side speed equals the scripted token count.
    async fn send_streaming(
        &self,
        _prompt: &str,
        _params: &InferParams,
        _timeout: Duration,
    ) -> Result<StreamHandle> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("request canceled"));
        }
        let tokens = match self.next_reply() {
            Reply::Tokens(tokens) => tokens,
            Reply::Fail => return Err(anyhow!("connection reset by peer")),
        };
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx.send(StreamFrame::data(content_line("hello"))).await;
            time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(StreamFrame::data(usage_line(tokens))).await;
            let _ = tx.send(StreamFrame::data(DONE_LINE)).await;
            let _ = tx.send(StreamFrame::EndOfStream).await;
        });
        Ok(StreamHandle::passthrough(rx))
    }

    fn stream_reducer(&self) -> &dyn StreamReducer {
        &UsageObjectReducer
    }
}

#[derive(Default)]
struct MemorySink {
    tables: Mutex<Vec<Vec<RoundSummary>>>,
    outcomes: Mutex<Vec<(usize, usize)>>,
    configs: Mutex<Vec<TestConfig>>,
    speeds: Mutex<Vec<StreamSpeed>>,
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist_summaries(&self, summaries: &[RoundSummary]) -> Result<()> {
        self.tables.lock().push(summaries.to_vec());
        Ok(())
    }

    async fn persist_outcomes(
        &self,
        concurrency: usize,
        outcomes: &[RequestOutcome],
    ) -> Result<()> {
        self.outcomes.lock().push((concurrency, outcomes.len()));
        Ok(())
    }

    async fn persist_config(&self, config: &TestConfig) -> Result<()> {
        self.configs.lock().push(config.clone());
        Ok(())
    }

    async fn persist_stream_speed(&self, speed: &StreamSpeed) -> Result<()> {
        self.speeds.lock().push(*speed);
        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

fn test_config(start: usize, end: usize, increment: usize, stream: bool) -> TestConfig {
    let mut config = TestConfig {
        start_concurrency: start,
        end_concurrency: end,
        increment,
        stream,
        duration: 1.0,
        max_tokens: 40,
        ..TestConfig::default()
    };
    config.model.name = "mock-model".to_string();
    config
}

fn prompts() -> Arc<Vec<String>> {
    Arc::new(vec![
        "first prompt".to_string(),
        "second prompt".to_string(),
        "third prompt".to_string(),
    ])
}

fn levels(summaries: &[RoundSummary]) -> Vec<usize> {
    summaries.iter().map(|summary| summary.concurrency).collect()
}

#[tokio::test(start_paused = true)]
async fn stable_throughput_converges_at_fifth_round() {
    // 6000 tokens per 60 s round is 100 tokens/s at every level.
    let client = Arc::new(ScriptedClient::new(vec![10, 20, 30, 40, 50], |level, _| {
        Reply::Tokens(6000 / level as u64)
    }));
    let sink = Arc::new(MemorySink::default());
    let controller = RampController::new(test_config(10, 100, 10, false), client, sink.clone());

    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::Converged);
    assert_eq!(levels(&report.summaries), vec![10, 20, 30, 40, 50]);
    for summary in &report.summaries {
        assert_eq!(summary.total, summary.concurrency as u64);
        assert_eq!(summary.success, summary.total);
        assert!((summary.server_output_tokens_per_second - 100.0).abs() < 1.0);
    }
    assert_eq!(report.max_round.map(|round| round.concurrency), Some(50));
    assert_eq!(sink.tables.lock().len(), 5);
    assert_eq!(sink.outcomes.lock().len(), 5);
    assert_eq!(sink.configs.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_stream_round_is_discarded() {
    let client = Arc::new(ScriptedClient::new(vec![10, 20, 30], |level, _| {
        if level == 10 {
            Reply::Tokens(45)
        } else {
            Reply::Tokens(30)
        }
    }));
    let sink = Arc::new(MemorySink::default());
    let mut config = test_config(10, 30, 10, true);
    config.max_stream_speed = 50.0;
    config.stream_thresholds = 80.0;
    let controller = RampController::new(config, client, sink.clone());

    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::StreamSpeedFloor);
    assert_eq!(levels(&report.summaries), vec![10]);
    let max_round = report.max_round.unwrap();
    assert_eq!(max_round.concurrency, 10);
    assert!((max_round.client_output_tokens_per_second - 45.0).abs() < 1.0);
    assert!(max_round.first_token_time < 1.0);
}

#[tokio::test(start_paused = true)]
async fn collapsed_round_never_reaches_persisted_tables() {
    let client = Arc::new(ScriptedClient::new(vec![10, 20], |level, index| {
        if level == 20 && index % 2 == 1 {
            Reply::Fail
        } else {
            Reply::Tokens(64)
        }
    }));
    let sink = Arc::new(MemorySink::default());
    let controller = RampController::new(test_config(10, 20, 10, false), client, sink.clone());

    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::SuccessRateCollapse);
    assert_eq!(levels(&report.summaries), vec![10]);
    for table in sink.tables.lock().iter() {
        assert!(table.iter().all(|summary| summary.concurrency != 20));
    }
    let mut written = sink.outcomes.lock().clone();
    written.sort_unstable();
    assert_eq!(written, vec![(10, 10), (20, 10)]);
}

#[tokio::test(start_paused = true)]
async fn kept_rounds_step_by_increment() {
    let client = Arc::new(ScriptedClient::new(vec![10, 20, 30], |_, _| {
        Reply::Tokens(100)
    }));
    let sink = Arc::new(MemorySink::default());
    let controller = RampController::new(test_config(10, 30, 10, false), client, sink);

    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::Exhausted);
    let kept = levels(&report.summaries);
    assert_eq!(kept.first().copied(), Some(10));
    assert!(kept.windows(2).all(|pair| pair[1] == pair[0] + 10));
    assert_eq!(report.max_round.map(|round| round.concurrency), Some(30));
}

#[tokio::test(start_paused = true)]
async fn cancelled_ramp_runs_no_round() {
    let client = Arc::new(ScriptedClient::new(vec![10], |_, _| Reply::Tokens(1)));
    let sink = Arc::new(MemorySink::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let controller =
        RampController::new(test_config(10, 10, 10, false), client, sink.clone()).with_cancel(cancel);

    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::Cancelled);
    assert!(report.summaries.is_empty());
    assert!(report.max_round.is_none());
    assert!(sink.tables.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_ramp_rejects_invalid_input() {
    let client: Arc<dyn InferenceClient> =
        Arc::new(ScriptedClient::new(vec![10], |_, _| Reply::Tokens(1)));
    let sink: Arc<dyn ResultSink> = Arc::new(MemorySink::default());

    let inverted = test_config(20, 10, 10, false);
    assert!(run_ramp(inverted, client.clone(), sink.clone(), CancellationToken::new())
        .await
        .is_none());

    let mut missing_corpus = test_config(10, 10, 10, false);
    missing_corpus.prompt_file = Some("/nonexistent/input_tokens_1024.json".to_string());
    assert!(run_ramp(missing_corpus, client, sink, CancellationToken::new())
        .await
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn run_ramp_measures_stream_baseline_first() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("input_tokens_16.json");
    std::fs::write(
        &corpus,
        r#"[{"prompt":"alpha","tokens":16},{"prompt":"beta","tokens":16},{"prompt":"gamma","tokens":16}]"#,
    )
    .unwrap();
    let client = Arc::new(ScriptedClient::new(vec![10], |_, _| Reply::Tokens(40)));
    let sink = Arc::new(MemorySink::default());
    let mut config = test_config(10, 10, 10, true);
    config.prompt_file = Some(corpus.display().to_string());

    let report = run_ramp(config, client, sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    let speeds = sink.speeds.lock().clone();
    assert_eq!(speeds.len(), 1);
    assert!((speeds[0].tokens_per_second - 40.0).abs() < 0.5);
    let configs = sink.configs.lock().clone();
    assert!((configs[0].max_stream_speed - speeds[0].tokens_per_second).abs() < f64::EPSILON);
    assert_eq!(report.outcome, RampOutcome::Exhausted);
    assert_eq!(levels(&report.summaries), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_round_ends_ramp_as_cancelled() {
    let cancel = CancellationToken::new();
    let client = Arc::new(
        ScriptedClient::new(vec![10, 20, 30], |_, _| Reply::Tokens(64))
            .with_latency(Duration::from_secs(5))
            .with_cancel(cancel.clone()),
    );
    let sink = Arc::new(MemorySink::default());
    let controller = RampController::new(test_config(10, 30, 10, false), client.clone(), sink.clone())
        .with_cancel(cancel.clone());
    let trigger = cancel.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = controller.run(prompts()).await.unwrap();

    assert_eq!(report.outcome, RampOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(60));
    // 6 s 间隔下取消前只发出 t=0 与 t=6 两个请求。
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    assert!(report.summaries.is_empty());
    assert!(report.max_round.is_none());
    assert!(sink.tables.lock().is_empty());
    assert_eq!(sink.configs.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_ramp_stops_when_stream_baseline_fails() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("input_tokens_16.json");
    std::fs::write(
        &corpus,
        r#"[{"prompt":"alpha","tokens":16},{"prompt":"beta","tokens":16},{"prompt":"gamma","tokens":16}]"#,
    )
    .unwrap();
    // 前三次调用是基线探测，全部失败；之后的轮次极慢但不失败。
    let client = Arc::new(ScriptedClient::new(vec![10, 20], |level, index| {
        if level == 10 && index < 3 {
            Reply::Fail
        } else {
            Reply::Tokens(1)
        }
    }));
    let sink = Arc::new(MemorySink::default());
    let mut config = test_config(10, 20, 10, true);
    config.prompt_file = Some(corpus.display().to_string());

    let report = run_ramp(config, client.clone(), sink.clone(), CancellationToken::new()).await;

    assert!(report.is_none());
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    assert!(sink.speeds.lock().is_empty());
    assert!(sink.tables.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn requests_outliving_the_window_are_counted() {
    let client = Arc::new(
        ScriptedClient::new(vec![10], |_, _| Reply::Tokens(32)).with_latency(Duration::from_secs(10)),
    );
    let config = test_config(10, 10, 10, false);
    let dispatcher = RoundDispatcher::new(
        client,
        config.infer_params(),
        config.request_timeout(),
        false,
    );
    let window = Duration::from_secs(60);
    let (tx, rx) = mpsc::channel(10);

    let cancel = CancellationToken::new();
    let (report, outcomes) = tokio::join!(
        dispatcher.run(10, window, prompts(), tx, &cancel),
        drain_outcomes(rx)
    );

    assert_eq!(report.counters.total, 10);
    assert_eq!(report.counters.success, 10);
    assert_eq!(report.counters.failed, 0);
    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|outcome| outcome.output_tokens == 32));
    // 最后一个请求在 t=54 s 发出，t=64 s 才返回。
    assert!(report.elapsed > window);
    assert!(report.elapsed >= Duration::from_secs(64));
}
