// 并发爬坡：逐轮提升并发度，汇总每轮指标并按停止条件结束测试。
use crate::core::config::TestConfig;
use crate::core::error::ProfilerError;
use crate::core::prompts::load_prompts;
use crate::core::schemas::RequestOutcome;
use crate::infer::InferenceClient;
use crate::ops::dispatcher::{RoundDispatcher, RoundReport};
use crate::ops::speed::SpeedProbe;
use crate::ops::statistics::{aggregate, drain_outcomes, RoundSummary};
use crate::ops::stop::{RampOutcome, StopDecision, StopEvaluator};
use crate::services::notify::notify_report;
use crate::storage::ResultSink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Round summaries of one ramp, keyed by concurrency.
#[derive(Debug, Clone, Default)]
pub struct SummaryTable {
    rounds: BTreeMap<usize, RoundSummary>,
}

impl SummaryTable {
    pub fn insert(&mut self, summary: RoundSummary) {
        self.rounds.insert(summary.concurrency, summary);
    }

    pub fn remove(&mut self, concurrency: usize) -> Option<RoundSummary> {
        self.rounds.remove(&concurrency)
    }

    pub fn get(&self, concurrency: usize) -> Option<&RoundSummary> {
        self.rounds.get(&concurrency)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn sorted(&self) -> Vec<RoundSummary> {
        self.rounds.values().cloned().collect()
    }

    /// Highest kept concurrency level, the reported maximum.
    pub fn last_valid(&self) -> Option<&RoundSummary> {
        self.rounds.values().next_back()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RampReport {
    pub run_id: String,
    pub outcome: RampOutcome,
    pub summaries: Vec<RoundSummary>,
    pub max_round: Option<RoundSummary>,
    pub location: Option<String>,
}

pub struct RampController {
    config: TestConfig,
    client: Arc<dyn InferenceClient>,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
}

impl RampController {
    pub fn new(
        config: TestConfig,
        client: Arc<dyn InferenceClient>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            client,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Ends the ramp with `RampOutcome::Cancelled` once `cancel` fires. The
    /// running round stops issuing, drains, and is left out of the table.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub async fn run(&self, prompts: Arc<Vec<String>>) -> Result<RampReport, ProfilerError> {
        self.config.validate()?;
        if prompts.is_empty() {
            return Err(ProfilerError::prompt_corpus("prompt pool is empty"));
        }
        let run_id = Uuid::new_v4().simple().to_string();
        let levels = self.config.concurrency_levels();
        let duration = self.config.round_duration();
        let evaluator = StopEvaluator::new(&self.config, self.config.max_stream_speed);
        let dispatcher = RoundDispatcher::new(
            Arc::clone(&self.client),
            self.config.infer_params(),
            self.config.request_timeout(),
            self.config.stream,
        );
        info!(
            run_id = %run_id,
            backend = self.client.backend().as_str(),
            "ramp over concurrency {:?}, {} min per round",
            levels,
            self.config.duration
        );

        let mut table = SummaryTable::default();
        let mut pending_writes = JoinSet::new();
        let mut outcome = RampOutcome::Exhausted;
        for (index, concurrency) in levels.iter().copied().enumerate() {
            if self.cancel.is_cancelled() {
                outcome = RampOutcome::Cancelled;
                break;
            }
            info!(
                "start testing at concurrency {concurrency}, duration: {} min",
                self.config.duration
            );
            let (tx, rx) = mpsc::channel(concurrency.max(1));
            let (report, outcomes) = tokio::join!(
                dispatcher.run(concurrency, duration, Arc::clone(&prompts), tx, &self.cancel),
                drain_outcomes(rx)
            );
            if self.cancel.is_cancelled() {
                let counters = report.counters;
                warn!(
                    concurrency,
                    total = counters.total,
                    success = counters.success,
                    "round interrupted by cancel, discarded"
                );
                outcome = RampOutcome::Cancelled;
                break;
            }
            let summary = aggregate(&report, &outcomes, &self.config.time_thresholds);
            self.log_round(&report, &summary);
            self.spawn_outcome_write(&mut pending_writes, concurrency, outcomes);

            table.insert(summary);
            let decision = evaluator.evaluate(&mut table, concurrency);
            self.persist_table(&table).await;
            if let StopDecision::Stop(reason) = decision {
                outcome = reason;
                break;
            }
            if index + 1 < levels.len() {
                tokio::select! {
                    _ = time::sleep(self.config.cooldown()) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        while let Some(joined) = pending_writes.join_next().await {
            if let Err(err) = joined {
                warn!("result write task aborted: {err}");
            }
        }
        if let Err(err) = self.sink.persist_config(&self.config).await {
            warn!("save config failed: {err:#}");
        }
        if let Err(err) = self.sink.keep_final_result().await {
            warn!("clean up statistics files failed: {err:#}");
        }

        let max_round = table.last_valid().cloned();
        match max_round.as_ref() {
            Some(round) => info!(
                outcome = outcome.as_str(),
                "Max throughput {:.3} tokens/s, {:.3} req/s at concurrency {}, prompt length: {}",
                round.server_output_tokens_per_second,
                round.request_per_second,
                round.concurrency,
                self.config.input_tokens
            ),
            None => warn!(outcome = outcome.as_str(), "no usable throughput"),
        }
        Ok(RampReport {
            run_id,
            outcome,
            summaries: table.sorted(),
            max_round,
            location: self.sink.location(),
        })
    }

    fn spawn_outcome_write(
        &self,
        pending: &mut JoinSet<()>,
        concurrency: usize,
        outcomes: Vec<RequestOutcome>,
    ) {
        let sink = Arc::clone(&self.sink);
        pending.spawn(async move {
            if let Err(err) = sink.persist_outcomes(concurrency, &outcomes).await {
                warn!(concurrency, "save round results failed: {err:#}");
            }
        });
    }

    async fn persist_table(&self, table: &SummaryTable) {
        if let Err(err) = self.sink.persist_summaries(&table.sorted()).await {
            warn!("save statistics failed: {err:#}");
        }
    }

    fn log_round(&self, report: &RoundReport, summary: &RoundSummary) {
        let seconds = report.elapsed.as_secs_f64();
        if self.config.stream {
            info!(
                "[time: {seconds:.1} s, total: {}, success: {}, fail: {}] | Server: [ {:.1} tokens/s, {:.1} req/s ] | Client: {:.1} tokens/s | Stream thresholds: {}% | MaxStreamSpeed: {:.1} tokens/s, FirstToken: {:.1} ms | Prompt length: {}",
                summary.total,
                summary.success,
                summary.fail,
                summary.server_output_tokens_per_second,
                summary.request_per_second,
                summary.client_output_tokens_per_second,
                self.config.stream_thresholds,
                self.config.max_stream_speed,
                summary.first_token_time,
                self.config.input_tokens
            );
        } else {
            info!(
                "[time: {seconds:.1} s, total: {}, success: {}, fail: {}] | Server: [ {:.1} tokens/s, {:.1} req/s ] | Prompt length: {}",
                summary.total,
                summary.success,
                summary.fail,
                summary.server_output_tokens_per_second,
                summary.request_per_second,
                self.config.input_tokens
            );
        }
    }
}

/// Full ramp entry: loads the prompt pool, measures the stream baseline when
/// none is configured, runs the ramp and sends the notification. Returns
/// `None` when the run cannot start.
pub async fn run_ramp(
    mut config: TestConfig,
    client: Arc<dyn InferenceClient>,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationToken,
) -> Option<RampReport> {
    if let Err(err) = config.validate() {
        error!("invalid test config: {err}");
        return None;
    }
    let prompts = match load_prompts(&config.prompt_path()) {
        Ok(prompts) => Arc::new(prompts),
        Err(err) => {
            error!("read inputs error: {err}");
            return None;
        }
    };
    if config.stream && config.max_stream_speed <= 0.0 {
        let measured = SpeedProbe::default()
            .measure_stream_speed(
                client.as_ref(),
                &config.infer_params(),
                &prompts,
                config.request_timeout(),
            )
            .await;
        let speed = match measured {
            Ok(speed) => speed,
            Err(err) => {
                error!("measure stream baseline failed: {err}");
                return None;
            }
        };
        info!(
            "single stream speed: {:.1} tokens/s, first token: {:.1} ms",
            speed.tokens_per_second, speed.first_token_time
        );
        if let Err(err) = sink.persist_stream_speed(&speed).await {
            warn!("save stream speed failed: {err:#}");
        }
        config.max_stream_speed = speed.tokens_per_second;
    }
    let controller = RampController::new(config, client, sink).with_cancel(cancel);
    match controller.run(prompts).await {
        Ok(report) => {
            notify_report(controller.config(), &report).await;
            Some(report)
        }
        Err(err) => {
            error!("ramp aborted: {err}");
            None
        }
    }
}
