// 压测配置：读取 YAML、展开环境变量占位符并校验参数。
use crate::core::error::ProfilerError;
use crate::infer::{Backend, InferParams};
use anyhow::{Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "LLM_PROFILER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
pub const WEBHOOK_URL_ENV: &str = "WEBHOOK_URL";

const DEFAULT_TIME_THRESHOLDS_MS: [u64; 8] = [500, 1000, 2000, 3000, 5000, 10000, 20000, 30000];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub version: String,
}

/// Thresholds used by the stop-condition evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StopPolicy {
    pub success_rate_floor: f64,
    pub convergence_tolerance: f64,
    pub degradation_ratio: f64,
    /// Number of rounds compared for convergence, the current one included:
    /// the current round is checked against the mean of the `window - 1`
    /// rounds before it.
    pub window: usize,
    pub stream_slack: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            success_rate_floor: 0.95,
            convergence_tolerance: 0.02,
            degradation_ratio: 0.95,
            window: 5,
            stream_slack: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestConfig {
    pub model: ModelConfig,
    pub server_ip: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
    /// Per-request timeout in milliseconds.
    pub request_timeout: u64,
    pub backend: Backend,
    pub stop_words: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stream: bool,
    pub input_tokens: u32,
    pub prompt_dir: String,
    pub prompt_file: Option<String>,
    pub start_concurrency: usize,
    pub end_concurrency: usize,
    pub increment: usize,
    /// Round duration in minutes.
    pub duration: f64,
    pub time_thresholds: Vec<u64>,
    /// Percentage of the baseline stream speed a round must keep.
    pub stream_thresholds: f64,
    pub max_stream_speed: f64,
    pub save_dir: String,
    pub cooldown_seconds: f64,
    pub stop_policy: StopPolicy,
    pub send_msg: bool,
    pub user: String,
    pub webhook_url: Option<String>,
    pub log_level: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            server_ip: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout: 60_000,
            backend: Backend::Vllm,
            stop_words: Vec::new(),
            max_tokens: 512,
            temperature: 1.0,
            top_p: 1.0,
            stream: false,
            input_tokens: 1024,
            prompt_dir: crate::core::prompts::DEFAULT_PROMPT_DIR.to_string(),
            prompt_file: None,
            start_concurrency: 1,
            end_concurrency: 10,
            increment: 1,
            duration: 1.0,
            time_thresholds: DEFAULT_TIME_THRESHOLDS_MS.to_vec(),
            stream_thresholds: 80.0,
            max_stream_speed: 0.0,
            save_dir: "results".to_string(),
            cooldown_seconds: 30.0,
            stop_policy: StopPolicy::default(),
            send_msg: false,
            user: String::new(),
            webhook_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl TestConfig {
    pub fn validate(&self) -> Result<(), ProfilerError> {
        if self.model.name.trim().is_empty() {
            return Err(ProfilerError::invalid_config("model name is empty"));
        }
        if self.server_ip.trim().is_empty() {
            return Err(ProfilerError::invalid_config("server ip is empty"));
        }
        if self.start_concurrency == 0 {
            return Err(ProfilerError::invalid_config(
                "start concurrency must be greater than 0",
            ));
        }
        if self.start_concurrency > self.end_concurrency {
            return Err(ProfilerError::invalid_config(format!(
                "start concurrency {} exceeds end concurrency {}",
                self.start_concurrency, self.end_concurrency
            )));
        }
        if self.increment == 0 {
            return Err(ProfilerError::invalid_config(
                "concurrency increment must be greater than 0",
            ));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(ProfilerError::invalid_config(
                "round duration must be a positive number of minutes",
            ));
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            return Err(ProfilerError::invalid_config(
                "cool-down must be a non-negative number of seconds",
            ));
        }
        if self.stream && !self.backend.supports_stream() {
            return Err(ProfilerError::invalid_config(format!(
                "backend {} does not support streaming",
                self.backend.as_str()
            )));
        }
        if self.stop_policy.window < 2 {
            return Err(ProfilerError::invalid_config(
                "convergence window must cover at least 2 rounds",
            ));
        }
        Ok(())
    }

    pub fn concurrency_levels(&self) -> Vec<usize> {
        if self.increment == 0 || self.start_concurrency > self.end_concurrency {
            return Vec::new();
        }
        (self.start_concurrency..=self.end_concurrency)
            .step_by(self.increment)
            .collect()
    }

    pub fn round_duration(&self) -> Duration {
        Duration::from_secs_f64((self.duration * 60.0).max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds.max(0.0))
    }

    /// Worst-case wall-clock minutes for the whole ramp, cool-down excluded.
    pub fn estimated_minutes(&self) -> f64 {
        self.concurrency_levels().len() as f64 * self.duration
    }

    pub fn base_url(&self) -> String {
        let host = self.server_ip.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }

    pub fn infer_params(&self) -> InferParams {
        InferParams {
            model: self.model.name.clone(),
            model_version: self.model.version.clone(),
            stop_words: self.stop_words.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    pub fn prompt_path(&self) -> PathBuf {
        match self.prompt_file.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => crate::core::prompts::corpus_path(&self.prompt_dir, self.input_tokens),
        }
    }

    pub fn resolved_webhook_url(&self) -> Option<String> {
        self.webhook_url
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| env::var(WEBHOOK_URL_ENV).ok())
            .filter(|value| !value.trim().is_empty())
    }

    fn normalize(&mut self) {
        // 温度为 0 时按 1 处理，与推理服务默认值一致。
        if self.temperature == 0.0 {
            self.temperature = 1.0;
        }
        if self.time_thresholds.is_empty() {
            self.time_thresholds = DEFAULT_TIME_THRESHOLDS_MS.to_vec();
        }
        self.time_thresholds.sort_unstable();
        self.time_thresholds.dedup();
    }
}

/// `--config` wins over `LLM_PROFILER_CONFIG_PATH`, which wins over the default path.
pub fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: Option<&Path>) -> Result<TestConfig> {
    let path = resolve_config_path(path);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config failed: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("parse config failed: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<TestConfig> {
    let mut value: Value = serde_yaml::from_str(content)?;
    expand_yaml_env(&mut value);
    let mut config = if value.is_null() {
        TestConfig::default()
    } else {
        serde_yaml::from_value::<TestConfig>(value)?
    };
    config.normalize();
    Ok(config)
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_yaml_env(item);
            }
        }
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        match (env::var(name).ok().filter(|v| !v.is_empty()), default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortVisitor;

    impl<'de> Visitor<'de> for PortVisitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("port number or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("port out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("port must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| E::custom("port must be numeric"))
        }
    }

    deserializer.deserialize_any(PortVisitor)
}
