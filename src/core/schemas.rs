// 请求结果数据结构，字段名与历史结果文件保持一致。
use serde::{Deserialize, Serialize};

/// Reply of a non-streaming completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One successful request of a round. Failed requests only touch the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOutcome {
    pub prompt: String,
    pub input_len: usize,
    pub input_tokens: u64,
    pub output: String,
    pub output_len: usize,
    pub output_tokens: u64,
    /// Client-observed latency in milliseconds.
    pub time_spent: u64,
    #[serde(default)]
    pub tokens_per_second: f64,
    /// Milliseconds until the first streamed frame.
    #[serde(default)]
    pub first_token_time: f64,
}

impl RequestOutcome {
    pub fn from_reply(prompt: &str, reply: InferenceReply, time_spent: u64) -> Self {
        Self {
            prompt: prompt.to_string(),
            input_len: prompt.chars().count(),
            input_tokens: reply.input_tokens,
            output_len: reply.text.chars().count(),
            output: reply.text,
            output_tokens: reply.output_tokens,
            time_spent,
            tokens_per_second: 0.0,
            first_token_time: 0.0,
        }
    }
}
