// vLLM 适配：OpenAI 兼容的 /v1/completions，流式响应携带 usage。
use crate::core::schemas::InferenceReply;
use crate::infer::http::HttpTransport;
use crate::infer::metrics::{StreamReducer, UsageObjectReducer};
use crate::infer::postprocess::{attach, StreamHandle, UsageObjectPostProcessor};
use crate::infer::{Backend, InferParams, InferenceClient};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const COMPLETIONS_PATH: &str = "v1/completions";

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stop: &'a [String],
    temperature: f32,
    max_tokens: u32,
    n: u32,
    stream: bool,
    ignore_eos: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompletionChoice {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<CompletionUsage>,
}

impl CompletionResponse {
    pub(crate) fn into_reply(self) -> Result<InferenceReply> {
        if self.object == "error" {
            return Err(anyhow!(
                "backend error: {}",
                self.message.unwrap_or_else(|| "unknown".to_string())
            ));
        }
        let text = self
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| anyhow!("completion response has no choices"))?;
        let usage = self.usage.unwrap_or_default();
        Ok(InferenceReply {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

pub struct VllmClient {
    transport: HttpTransport,
}

impl VllmClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn request<'a>(prompt: &'a str, params: &'a InferParams, stream: bool) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &params.model,
            prompt,
            stop: &params.stop_words,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            n: 1,
            stream,
            // 压测需要固定输出长度，忽略 EOS 提前结束。
            ignore_eos: true,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[async_trait]
impl InferenceClient for VllmClient {
    fn backend(&self) -> Backend {
        Backend::Vllm
    }

    async fn send(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<InferenceReply> {
        let url = self.transport.endpoint(COMPLETIONS_PATH)?;
        let body = Self::request(prompt, params, false);
        let payload = self.transport.post_json(url, &body, timeout).await?;
        serde_json::from_slice::<CompletionResponse>(&payload)
            .context("decode vLLM completion response failed")?
            .into_reply()
    }

    async fn send_streaming(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<StreamHandle> {
        let url = self.transport.endpoint(COMPLETIONS_PATH)?;
        let body = Self::request(prompt, params, true);
        let frames = self
            .transport
            .post_stream(url, &body, timeout)
            .await
            .with_context(|| format!("call vLLM completions API failed, model: {}", params.model))?;
        Ok(attach(UsageObjectPostProcessor, &params.model, frames))
    }

    fn stream_reducer(&self) -> &dyn StreamReducer {
        &UsageObjectReducer
    }
}
