// 轮次调度：在固定时长内按 D/C 间隔发起请求，结束后等待全部请求完成。
use crate::core::schemas::RequestOutcome;
use crate::infer::{InferParams, InferenceClient};
use anyhow::Result;
use chrono::{DateTime, Local};
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct RoundCounters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

impl RoundCounters {
    fn record_issue(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Walks the prompt pool in order and wraps at the end.
pub struct PromptCursor {
    prompts: Arc<Vec<String>>,
    index: ParkingMutex<usize>,
}

impl PromptCursor {
    pub fn new(prompts: Arc<Vec<String>>) -> Self {
        Self {
            prompts,
            index: ParkingMutex::new(0),
        }
    }

    pub fn next(&self) -> Option<String> {
        if self.prompts.is_empty() {
            return None;
        }
        let mut index = self.index.lock();
        let prompt = self.prompts.get(*index).cloned();
        *index = (*index + 1) % self.prompts.len();
        prompt
    }
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub concurrency: usize,
    pub counters: CounterSnapshot,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    /// Dispatch start to the last joined request.
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct RoundDispatcher {
    client: Arc<dyn InferenceClient>,
    params: Arc<InferParams>,
    timeout: Duration,
    stream: bool,
}

impl RoundDispatcher {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        params: InferParams,
        timeout: Duration,
        stream: bool,
    ) -> Self {
        Self {
            client,
            params: Arc::new(params),
            timeout,
            stream,
        }
    }

    pub fn tick_period(duration: Duration, concurrency: usize) -> Duration {
        let slots = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        (duration / slots).max(MIN_TICK_PERIOD)
    }

    /// Issues one request per tick for `duration`, then waits for every issued
    /// request. A fired `cancel` closes the window early; issued requests are
    /// still joined. `outcomes` is dropped before returning so the receiver sees
    /// the channel close once the last request has reported.
    pub async fn run(
        &self,
        concurrency: usize,
        duration: Duration,
        prompts: Arc<Vec<String>>,
        outcomes: mpsc::Sender<RequestOutcome>,
        cancel: &CancellationToken,
    ) -> RoundReport {
        let counters = Arc::new(RoundCounters::default());
        let cursor = PromptCursor::new(prompts);
        let start_time = Local::now();
        let started = Instant::now();
        let deadline = started + duration;
        let mut ticker = time::interval_at(started, Self::tick_period(duration, concurrency));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let window_closed = time::sleep_until(deadline);
        tokio::pin!(window_closed);

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut window_closed => break,
                _ = cancel.cancelled() => {
                    info!(concurrency, issued = tasks.len(), "round window closed by cancel");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(prompt) = cursor.next() else {
                        warn!("prompt pool is empty, no request issued");
                        break;
                    };
                    tasks.spawn(issue_request(
                        Arc::clone(&self.client),
                        Arc::clone(&self.params),
                        prompt,
                        self.timeout,
                        self.stream,
                        Arc::clone(&counters),
                        outcomes.clone(),
                    ));
                }
            }
        }
        drop(outcomes);
        debug!(concurrency, in_flight = tasks.len(), "waiting for in-flight requests");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("request task aborted: {err}");
            }
        }

        RoundReport {
            concurrency,
            counters: counters.snapshot(),
            start_time,
            end_time: Local::now(),
            elapsed: started.elapsed(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn issue_request(
    client: Arc<dyn InferenceClient>,
    params: Arc<InferParams>,
    prompt: String,
    timeout: Duration,
    stream: bool,
    counters: Arc<RoundCounters>,
    outcomes: mpsc::Sender<RequestOutcome>,
) {
    counters.record_issue();
    let result = if stream {
        stream_request(client.as_ref(), &params, &prompt, timeout).await
    } else {
        plain_request(client.as_ref(), &params, &prompt, timeout).await
    };
    match result {
        Ok(outcome) => {
            counters.record_success();
            if outcomes.send(outcome).await.is_err() {
                warn!("outcome channel closed before the round finished");
            }
        }
        Err(err) => {
            counters.record_failure();
            warn!(backend = client.backend().as_str(), "request failed: {err:#}");
        }
    }
}

async fn plain_request(
    client: &dyn InferenceClient,
    params: &InferParams,
    prompt: &str,
    timeout: Duration,
) -> Result<RequestOutcome> {
    let started = Instant::now();
    let reply = client.send(prompt, params, timeout).await?;
    Ok(RequestOutcome::from_reply(prompt, reply, elapsed_ms(started)))
}

pub(crate) async fn stream_request(
    client: &dyn InferenceClient,
    params: &InferParams,
    prompt: &str,
    timeout: Duration,
) -> Result<RequestOutcome> {
    let started = Instant::now();
    let handle = client.send_streaming(prompt, params, timeout).await?;
    let metrics = client.stream_reducer().reduce(handle.frames, started).await;
    handle.status.wait().await?;
    Ok(RequestOutcome {
        prompt: prompt.to_string(),
        input_len: prompt.chars().count(),
        input_tokens: metrics.input_tokens,
        output: String::new(),
        output_len: 0,
        output_tokens: metrics.output_tokens,
        time_spent: elapsed_ms(started),
        tokens_per_second: metrics.tokens_per_second,
        first_token_time: metrics.first_token_ms,
    })
}
