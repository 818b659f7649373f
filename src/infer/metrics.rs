// 流式指标：统计输出 token 数、首 token 时延与每秒输出 token 数。
use crate::infer::stream::{FrameReceiver, StreamFrame};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetrics {
    pub output_tokens: u64,
    /// Prompt tokens when the backend reports usage, otherwise 0.
    pub input_tokens: u64,
    pub tokens_per_second: f64,
    pub first_token_ms: f64,
    pub elapsed_s: f64,
}

#[async_trait]
pub trait StreamReducer: Send + Sync {
    async fn reduce(&self, frames: FrameReceiver, started: Instant) -> StreamMetrics;
}

/// Prefers `usage.completion_tokens` from the stream and falls back to counting frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageObjectReducer;

/// Treats every content frame as one token, minus the leading frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPerTokenReducer;

#[derive(Debug, Deserialize)]
struct UsageEnvelope {
    usage: Option<UsageCounts>,
}

#[derive(Debug, Deserialize)]
struct UsageCounts {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn data_json_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^data:\s*(\{.*\})").expect("invalid data json regex"))
}

fn data_json(line: &str) -> Option<&str> {
    data_json_regex()
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str())
}

/// Synthetic finish payload: every choice has empty text and a finish reason.
fn is_terminal_payload(line: &str) -> bool {
    let Some(json) = data_json(line) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(json) else {
        return false;
    };
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return false;
    };
    !choices.is_empty()
        && choices.iter().all(|choice| {
            let text = choice.get("text").and_then(Value::as_str).unwrap_or("");
            let finished = choice
                .get("finish_reason")
                .map(|reason| !reason.is_null())
                .unwrap_or(false);
            text.is_empty() && finished
        })
}

fn is_content_line(line: &str) -> bool {
    !line.trim().is_empty() && !line.contains("[DONE]") && !is_terminal_payload(line)
}

struct FrameClock {
    started: Instant,
    first_token_ms: Option<f64>,
}

impl FrameClock {
    fn new(started: Instant) -> Self {
        Self {
            started,
            first_token_ms: None,
        }
    }

    fn observe(&mut self) {
        if self.first_token_ms.is_none() {
            self.first_token_ms = Some(self.started.elapsed().as_secs_f64() * 1000.0);
        }
    }

    fn finish(self, output_tokens: u64, input_tokens: u64) -> StreamMetrics {
        let elapsed_s = self.started.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed_s > 0.0 && output_tokens > 0 {
            output_tokens as f64 / elapsed_s
        } else {
            0.0
        };
        StreamMetrics {
            output_tokens,
            input_tokens,
            tokens_per_second,
            first_token_ms: self.first_token_ms.unwrap_or(0.0),
            elapsed_s,
        }
    }
}

#[async_trait]
impl StreamReducer for UsageObjectReducer {
    async fn reduce(&self, mut frames: FrameReceiver, started: Instant) -> StreamMetrics {
        let mut clock = FrameClock::new(started);
        let mut counted = 0u64;
        let mut reported: Option<u64> = None;
        let mut input_tokens = 0u64;
        while let Some(frame) = frames.recv().await {
            clock.observe();
            let StreamFrame::Data(bytes) = frame else {
                continue;
            };
            let line = String::from_utf8_lossy(&bytes);
            if !is_content_line(&line) {
                continue;
            }
            counted += 1;
            let usage = data_json(&line)
                .and_then(|json| serde_json::from_str::<UsageEnvelope>(json).ok())
                .and_then(|envelope| envelope.usage);
            if let Some(usage) = usage {
                if usage.completion_tokens > 1 {
                    reported = Some(usage.completion_tokens);
                }
                if usage.prompt_tokens > 0 {
                    input_tokens = usage.prompt_tokens;
                }
            }
        }
        // 部分 vLLM 版本流式响应不带 usage，退化为按帧计数。
        clock.finish(reported.unwrap_or(counted), input_tokens)
    }
}

#[async_trait]
impl StreamReducer for ChunkPerTokenReducer {
    async fn reduce(&self, mut frames: FrameReceiver, started: Instant) -> StreamMetrics {
        let mut clock = FrameClock::new(started);
        let mut counted = 0u64;
        while let Some(frame) = frames.recv().await {
            clock.observe();
            if let StreamFrame::Data(bytes) = frame {
                if is_content_line(&String::from_utf8_lossy(&bytes)) {
                    counted += 1;
                }
            }
        }
        clock.finish(counted.saturating_sub(1), 0)
    }
}
