// 单请求速度：流式基线速度测量与 max_tokens 扫描测试。
use crate::core::error::ProfilerError;
use crate::infer::{InferParams, InferenceClient};
use crate::ops::dispatcher::stream_request;
use crate::ops::statistics::trimmed_mean;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

pub const BASELINE_SAMPLES: usize = 20;
pub const PROBE_PAUSE: Duration = Duration::from_millis(500);
pub const SWEEP_TIMEOUT: Duration = Duration::from_secs(100);
pub const SWEEP_REQUESTS: usize = 10;
pub const SWEEP_PROMPT: &str = "The meaning of life is";
pub const SWEEP_PROMPT_TOKENS: u64 = 5;
const SWEEP_MAX_TOKENS: [u32; 8] = [32, 64, 96, 128, 160, 192, 224, 256];

/// Single-request streaming speed, used as the reference for the stream floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpeed {
    pub tokens_per_second: f64,
    /// Milliseconds.
    pub first_token_time: f64,
}

#[derive(Debug, Clone)]
pub struct SpeedProbe {
    pub samples: usize,
    pub pause: Duration,
}

impl Default for SpeedProbe {
    fn default() -> Self {
        Self {
            samples: BASELINE_SAMPLES,
            pause: PROBE_PAUSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepStep {
    pub max_tokens: u32,
    pub success: usize,
    pub avg_output_tokens: f64,
    pub avg_time_s: f64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub steps: Vec<SweepStep>,
    pub tokens_per_second: f64,
}

impl SpeedProbe {
    /// Streams the first prompts one at a time. Replies that stop before
    /// `max_tokens` would understate the decode speed and are skipped. Fails
    /// when the samples left after trimming give no positive speed.
    pub async fn measure_stream_speed(
        &self,
        client: &dyn InferenceClient,
        params: &InferParams,
        prompts: &[String],
        timeout: Duration,
    ) -> Result<StreamSpeed, ProfilerError> {
        let mut speeds = Vec::new();
        let mut first_tokens = Vec::new();
        for prompt in prompts.iter().take(self.samples) {
            match stream_request(client, params, prompt, timeout).await {
                Ok(outcome) if outcome.output_tokens < u64::from(params.max_tokens) => {
                    warn!(
                        "stream tokens {} is less than max tokens {}, skip",
                        outcome.output_tokens, params.max_tokens
                    );
                }
                Ok(outcome) => {
                    debug!(
                        "stream output tokens: {}, time: {:.1}s, speed: {:.1} tokens/s, firstToken: {:.1} ms",
                        outcome.output_tokens,
                        outcome.time_spent as f64 / 1000.0,
                        outcome.tokens_per_second,
                        outcome.first_token_time
                    );
                    speeds.push(outcome.tokens_per_second);
                    if outcome.first_token_time > 0.0 {
                        first_tokens.push(outcome.first_token_time);
                    }
                }
                Err(err) => warn!("stream speed baseline request failed: {err:#}"),
            }
            time::sleep(self.pause).await;
        }
        let speed = StreamSpeed {
            tokens_per_second: trimmed_mean(&speeds),
            first_token_time: trimmed_mean(&first_tokens),
        };
        if speed.tokens_per_second.is_nan() || speed.tokens_per_second <= 0.0 {
            return Err(ProfilerError::stream_baseline(format!(
                "{} of {} baseline requests usable, no stream speed measured",
                speeds.len(),
                prompts.len().min(self.samples)
            )));
        }
        Ok(speed)
    }

    /// Sends `SWEEP_REQUESTS` non-streaming requests per max-token setting and
    /// reports the average decode speed of each setting.
    pub async fn single_request_sweep(
        &self,
        client: &dyn InferenceClient,
        params: &InferParams,
        prompt: &str,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        for max_tokens in SWEEP_MAX_TOKENS {
            let params = InferParams {
                max_tokens,
                top_p: 1.0,
                ..params.clone()
            };
            let mut success = 0usize;
            let mut total_tokens = 0u64;
            let mut total_time = 0.0;
            for _ in 0..SWEEP_REQUESTS {
                let started = Instant::now();
                match client.send(prompt, &params, SWEEP_TIMEOUT).await {
                    Ok(reply) if reply.output_tokens > 0 => {
                        success += 1;
                        total_tokens += reply.output_tokens;
                        total_time += started.elapsed().as_secs_f64();
                    }
                    Ok(_) => warn!("send {} request returned no tokens", client.backend().as_str()),
                    Err(err) => warn!("send {} request error: {err:#}", client.backend().as_str()),
                }
                time::sleep(self.pause).await;
            }
            if success == 0 {
                warn!(max_tokens, "no successful request for this setting");
                continue;
            }
            let avg_output_tokens = total_tokens as f64 / success as f64;
            let avg_time_s = total_time / success as f64;
            let tokens_per_second = if avg_time_s > 0.0 {
                avg_output_tokens / avg_time_s
            } else {
                0.0
            };
            info!(
                "output_tokens: {avg_output_tokens:.1}, avg_time: {avg_time_s:.1} s, tokens/s: {tokens_per_second:.1}"
            );
            report.steps.push(SweepStep {
                max_tokens,
                success,
                avg_output_tokens,
                avg_time_s,
                tokens_per_second,
            });
        }
        let speeds = report
            .steps
            .iter()
            .map(|step| step.tokens_per_second)
            .collect::<Vec<_>>();
        report.tokens_per_second = trimmed_mean(&speeds);
        info!(
            "speed for single request: {:.1} tokens/s",
            report.tokens_per_second
        );
        report
    }
}
