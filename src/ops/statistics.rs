// 轮次统计：汇总请求结果，计算分位数、去极值均值与服务端吞吐。
use crate::core::schemas::RequestOutcome;
use crate::ops::dispatcher::RoundReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub const TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const MINIMUM_TRIM_COUNT: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub concurrency: usize,
    pub success: u64,
    pub fail: u64,
    pub total: u64,
    pub avg_time_server_side: f64,
    pub avg_time_client_side: f64,
    pub avg_input_len: f64,
    pub avg_output_len: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub server_input_tokens_per_second: f64,
    pub server_output_tokens_per_second: f64,
    pub client_output_tokens_per_second: f64,
    pub first_token_time: f64,
    pub request_per_second: f64,
    pub time_spent_summary: BTreeMap<String, u64>,
    pub start_time: String,
    pub end_time: String,
    pub p99: f64,
    pub p90: f64,
    pub p80: f64,
}

impl RoundSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.success as f64 / self.total as f64
    }
}

/// Mean after dropping one minimum and one maximum sample; 0 below three samples.
pub fn trimmed_mean(values: &[f64]) -> f64 {
    if values.len() < MINIMUM_TRIM_COUNT {
        return 0.0;
    }
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;
    for value in values {
        sum += value;
        min = min.min(*value);
        max = max.max(*value);
    }
    (sum - min - max) / (values.len() - 2) as f64
}

pub fn is_close(a: f64, b: f64, tolerance: f64) -> bool {
    if a == 0.0 && b == 0.0 {
        return true;
    }
    if a == 0.0 || b == 0.0 {
        return false;
    }
    let relative = ((a - b) / a.abs().max(b.abs())).abs();
    relative <= tolerance
}

/// Percentile over the whole sample set. A whole rank picks that element,
/// a fractional rank averages the two neighbours.
pub fn percentile(values: &[f64], percent: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (percent / 100.0) * sorted.len() as f64;
    if rank < 1.0 {
        return sorted[0];
    }
    let index = rank as usize;
    if rank == index as f64 {
        return sorted[(index - 1).min(sorted.len() - 1)];
    }
    if index >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    (sorted[index - 1] + sorted[index]) / 2.0
}

pub fn latency_histogram(latencies: &[u64], thresholds: &[u64]) -> BTreeMap<String, u64> {
    thresholds
        .iter()
        .map(|threshold| {
            let count = latencies
                .iter()
                .filter(|latency| **latency <= *threshold)
                .count() as u64;
            (format!("less than {threshold} ms"), count)
        })
        .collect()
}

/// Collects outcomes until every sender of the round is gone.
pub async fn drain_outcomes(mut rx: mpsc::Receiver<RequestOutcome>) -> Vec<RequestOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes
}

fn per_success(total: f64, success: u64) -> f64 {
    if success == 0 {
        return 0.0;
    }
    total / success as f64
}

fn per_second(total: f64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    total / seconds
}

pub fn aggregate(
    report: &RoundReport,
    outcomes: &[RequestOutcome],
    thresholds: &[u64],
) -> RoundSummary {
    let counters = report.counters;
    let seconds = report.elapsed.as_secs_f64();
    let latencies = outcomes
        .iter()
        .map(|outcome| outcome.time_spent)
        .collect::<Vec<_>>();
    let latency_samples = latencies.iter().map(|value| *value as f64).collect::<Vec<_>>();
    let total_latency: u64 = latencies.iter().sum();
    let input_len: usize = outcomes.iter().map(|outcome| outcome.input_len).sum();
    let output_len: usize = outcomes.iter().map(|outcome| outcome.output_len).sum();
    let input_tokens: u64 = outcomes.iter().map(|outcome| outcome.input_tokens).sum();
    let output_tokens: u64 = outcomes.iter().map(|outcome| outcome.output_tokens).sum();
    let client_rates = outcomes
        .iter()
        .map(|outcome| outcome.tokens_per_second)
        .filter(|value| *value != 0.0)
        .collect::<Vec<_>>();
    let first_tokens = outcomes
        .iter()
        .map(|outcome| outcome.first_token_time)
        .filter(|value| *value != 0.0)
        .collect::<Vec<_>>();

    RoundSummary {
        concurrency: report.concurrency,
        success: counters.success,
        fail: counters.failed,
        total: counters.total,
        avg_time_server_side: per_success(seconds * 1000.0, counters.success),
        avg_time_client_side: per_success(total_latency as f64, counters.success),
        avg_input_len: per_success(input_len as f64, counters.success),
        avg_output_len: per_success(output_len as f64, counters.success),
        avg_input_tokens: per_success(input_tokens as f64, counters.success),
        avg_output_tokens: per_success(output_tokens as f64, counters.success),
        server_input_tokens_per_second: per_second(input_tokens as f64, seconds),
        server_output_tokens_per_second: per_second(output_tokens as f64, seconds),
        client_output_tokens_per_second: trimmed_mean(&client_rates),
        first_token_time: trimmed_mean(&first_tokens),
        request_per_second: per_second(counters.success as f64, seconds),
        time_spent_summary: latency_histogram(&latencies, thresholds),
        start_time: report.start_time.format(TIME_FORMAT).to_string(),
        end_time: report.end_time.format(TIME_FORMAT).to_string(),
        p99: percentile(&latency_samples, 99.0),
        p90: percentile(&latency_samples, 90.0),
        p80: percentile(&latency_samples, 80.0),
    }
}
