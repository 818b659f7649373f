// 参数矩阵扫描：按 输入长度 × 输出长度（inline 模式再乘超时）逐组执行并发爬坡，汇总每组最大吞吐。
use crate::core::config::TestConfig;
use crate::infer::InferenceClient;
use crate::ops::ramp::{run_ramp, RampReport};
use crate::ops::stop::RampOutcome;
use crate::storage::ResultSink;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as tokio_fs;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const INPUT_TOKENS_ENV: &str = "INPUT_TOKENS";
pub const MAX_NEW_TOKENS_ENV: &str = "MAX_NEW_TOKENS";
pub const TIMEOUT_SECONDS_ENV: &str = "TIME";

/// `peak` looks for the highest throughput without a latency bound, `inline`
/// repeats the matrix under each request timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    Peak,
    Inline,
}

impl SweepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepMode::Peak => "peak",
            SweepMode::Inline => "inline",
        }
    }

    fn default_input_tokens(&self) -> &'static [u32] {
        match self {
            SweepMode::Peak => &[500, 1000, 1500, 2000],
            SweepMode::Inline => &[100, 200, 400, 600, 800, 1000],
        }
    }

    fn default_max_new_tokens(&self) -> &'static [u32] {
        match self {
            SweepMode::Peak => &[8, 16, 32, 64, 128, 256],
            SweepMode::Inline => &[16, 32],
        }
    }

    fn default_timeouts(&self) -> &'static [u64] {
        match self {
            SweepMode::Peak => &[],
            SweepMode::Inline => &[1, 2],
        }
    }

    fn default_pause(&self) -> Duration {
        match self {
            SweepMode::Peak => Duration::from_secs(30),
            SweepMode::Inline => Duration::from_secs(15),
        }
    }

    pub fn results_file_name(&self) -> &'static str {
        match self {
            SweepMode::Peak => "peak_results.json",
            SweepMode::Inline => "inline_results.json",
        }
    }

    /// Ramp range and timeout shared by every case of the mode.
    pub fn base_config(&self, template: TestConfig) -> TestConfig {
        let (start, increment) = match self {
            SweepMode::Peak => (100, 100),
            SweepMode::Inline => (30, 30),
        };
        TestConfig {
            start_concurrency: start,
            end_concurrency: 5000,
            increment,
            duration: 1.0,
            request_timeout: 1_200_000,
            ..template
        }
    }
}

impl FromStr for SweepMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "peak" => Ok(SweepMode::Peak),
            "inline" => Ok(SweepMode::Inline),
            other => Err(anyhow!("unknown sweep mode: {other}")),
        }
    }
}

/// Comma separated integers. Invalid items are skipped; an empty result
/// falls back to `defaults`.
pub fn parse_list<T>(value: Option<&str>, defaults: &[T]) -> Vec<T>
where
    T: FromStr + Copy,
{
    let parsed = value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match item.parse::<T>() {
            Ok(number) => Some(number),
            Err(_) => {
                warn!("skip invalid sweep value: {item}");
                None
            }
        })
        .collect::<Vec<_>>();
    if parsed.is_empty() {
        defaults.to_vec()
    } else {
        parsed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub mode: SweepMode,
    pub input_tokens: Vec<u32>,
    pub max_new_tokens: Vec<u32>,
    /// Request timeouts in seconds; empty keeps the config timeout.
    pub timeouts: Vec<u64>,
    /// Pause between two cases.
    pub pause: Duration,
}

impl SweepPlan {
    pub fn new(mode: SweepMode) -> Self {
        Self {
            mode,
            input_tokens: mode.default_input_tokens().to_vec(),
            max_new_tokens: mode.default_max_new_tokens().to_vec(),
            timeouts: mode.default_timeouts().to_vec(),
            pause: mode.default_pause(),
        }
    }

    /// Reads `INPUT_TOKENS`, `MAX_NEW_TOKENS` and, for `inline`, `TIME`.
    pub fn from_env(mode: SweepMode) -> Self {
        let mut plan = Self::new(mode);
        plan.input_tokens = parse_list(
            env::var(INPUT_TOKENS_ENV).ok().as_deref(),
            &plan.input_tokens,
        );
        plan.max_new_tokens = parse_list(
            env::var(MAX_NEW_TOKENS_ENV).ok().as_deref(),
            &plan.max_new_tokens,
        );
        if mode == SweepMode::Inline {
            plan.timeouts = parse_list(
                env::var(TIMEOUT_SECONDS_ENV).ok().as_deref(),
                &plan.timeouts,
            );
        }
        plan
    }

    /// Timeout outermost, then input length, then output length.
    pub fn cases(&self) -> Vec<SweepCase> {
        let timeouts = if self.timeouts.is_empty() {
            vec![None]
        } else {
            self.timeouts.iter().copied().map(Some).collect()
        };
        let mut cases = Vec::new();
        for timeout in timeouts {
            for input_tokens in &self.input_tokens {
                for max_tokens in &self.max_new_tokens {
                    cases.push(SweepCase {
                        timeout,
                        input_tokens: *input_tokens,
                        max_tokens: *max_tokens,
                    });
                }
            }
        }
        cases
    }

    pub fn estimated_minutes(&self, base: &TestConfig) -> f64 {
        base.estimated_minutes() * self.cases().len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCase {
    pub timeout: Option<u64>,
    pub input_tokens: u32,
    pub max_tokens: u32,
}

impl SweepCase {
    pub fn save_dir(&self, root: &Path) -> PathBuf {
        let base = match self.timeout {
            Some(seconds) => root.join(format!("timeout_{seconds}s")),
            None => root.to_path_buf(),
        };
        base.join(format!("input_tokens_{}", self.input_tokens))
            .join(format!("output_tokens_{}", self.max_tokens))
    }

    pub fn apply(&self, base: &TestConfig, root: &Path) -> TestConfig {
        let mut config = base.clone();
        config.input_tokens = self.input_tokens;
        config.max_tokens = self.max_tokens;
        if let Some(seconds) = self.timeout {
            config.request_timeout = seconds.saturating_mul(1000);
        }
        config.save_dir = self.save_dir(root).display().to_string();
        config
    }
}

/// Best kept round of one case. Throughputs are rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub outcome: Option<RampOutcome>,
    pub max_concurrency: Option<usize>,
    pub output_tokens_per_seconds: f64,
    pub input_tokens_per_seconds: f64,
    pub request_per_seconds: f64,
    pub save_dir: String,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl SweepEntry {
    fn new(case: &SweepCase, save_dir: &Path, report: Option<&RampReport>) -> Self {
        let max_round = report.and_then(|report| report.max_round.as_ref());
        Self {
            timeout_seconds: case.timeout,
            input_tokens: case.input_tokens,
            output_tokens: case.max_tokens,
            outcome: report.map(|report| report.outcome),
            max_concurrency: max_round.map(|round| round.concurrency),
            output_tokens_per_seconds: round2(
                max_round.map_or(0.0, |round| round.server_output_tokens_per_second),
            ),
            input_tokens_per_seconds: round2(
                max_round.map_or(0.0, |round| round.server_input_tokens_per_second),
            ),
            request_per_seconds: round2(max_round.map_or(0.0, |round| round.request_per_second)),
            save_dir: save_dir.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepResults {
    pub data: Vec<SweepEntry>,
    pub config: BTreeMap<String, String>,
}

/// Runs one full ramp per case of `plan`, each writing into its own sink from
/// `make_sink`, then saves the collected maxima under `root`.
pub async fn run_sweep<F>(
    base: &TestConfig,
    plan: &SweepPlan,
    root: &Path,
    client: Arc<dyn InferenceClient>,
    make_sink: F,
    cancel: CancellationToken,
) -> Result<SweepResults>
where
    F: Fn(&Path) -> Arc<dyn ResultSink>,
{
    let cases = plan.cases();
    info!(
        mode = plan.mode.as_str(),
        "timeout: {:?}, max_new_tokens: {:?}, input_tokens: {:?}, {} cases, estimated time: {:.1} min",
        plan.timeouts,
        plan.max_new_tokens,
        plan.input_tokens,
        cases.len(),
        plan.estimated_minutes(base)
    );
    let started = Instant::now();
    let mut results = SweepResults::default();
    for (index, case) in cases.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("sweep cancelled before case {}", index + 1);
            break;
        }
        let config = case.apply(base, root);
        let save_dir = case.save_dir(root);
        debug!(
            "Configuration of this iteration: timeout: {:?} | input_tokens: {} | max_new_tokens: {}",
            case.timeout, case.input_tokens, case.max_tokens
        );
        let report = run_ramp(
            config,
            Arc::clone(&client),
            make_sink(&save_dir),
            cancel.clone(),
        )
        .await;
        let entry = SweepEntry::new(case, &save_dir, report.as_ref());
        info!(
            "Max throughput [req/s: {}, input_tokens/s: {}, output_tokens/s: {}], prompt length: {}",
            entry.request_per_seconds,
            entry.input_tokens_per_seconds,
            entry.output_tokens_per_seconds,
            case.input_tokens
        );
        results.data.push(entry);
        if report.as_ref().is_some_and(|report| report.outcome == RampOutcome::Cancelled) {
            break;
        }
        if index + 1 < cases.len() {
            tokio::select! {
                _ = time::sleep(plan.pause) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    let config = &mut results.config;
    config.insert("mode".to_string(), plan.mode.as_str().to_string());
    config.insert("user".to_string(), base.user.clone());
    config.insert("model".to_string(), base.model.name.clone());
    config.insert("backend".to_string(), base.backend.as_str().to_string());
    config.insert("url".to_string(), base.base_url());
    config.insert(
        "time".to_string(),
        format!("{:.3} min", started.elapsed().as_secs_f64() / 60.0),
    );
    config.insert("save".to_string(), "local".to_string());

    let path = root.join(plan.mode.results_file_name());
    tokio_fs::create_dir_all(root)
        .await
        .with_context(|| format!("create {} failed", root.display()))?;
    let payload = serde_json::to_vec_pretty(&results)?;
    tokio_fs::write(&path, payload)
        .await
        .with_context(|| format!("write {} failed", path.display()))?;
    info!("sweep results saved to {}", path.display());
    Ok(results)
}
