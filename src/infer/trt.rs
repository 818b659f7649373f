// Triton TensorRT-LLM 适配：generate / generate_stream 接口，流式每帧对应一个 token。
use crate::core::schemas::InferenceReply;
use crate::infer::http::HttpTransport;
use crate::infer::metrics::{ChunkPerTokenReducer, StreamReducer};
use crate::infer::postprocess::{attach, ErrorPatternPostProcessor, StreamHandle};
use crate::infer::vllm::CompletionResponse;
use crate::infer::{Backend, InferParams, InferenceClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    text_input: &'a str,
    max_tokens: u32,
    bad_words: &'a str,
    stop_words: String,
    stream: bool,
    top_p: f32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text_output: String,
}

pub struct TrtClient {
    transport: HttpTransport,
}

impl TrtClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn request<'a>(prompt: &'a str, params: &InferParams, stream: bool) -> GenerateRequest<'a> {
        GenerateRequest {
            text_input: prompt,
            max_tokens: params.max_tokens,
            bad_words: "",
            stop_words: params.stop_words.join(","),
            stream,
            top_p: params.top_p,
            temperature: params.temperature,
        }
    }

    fn generate_path(model: &str, stream: bool) -> String {
        if stream {
            format!("v2/models/{model}/generate_stream")
        } else {
            format!("v2/models/{model}/generate")
        }
    }
}

/// `text_output` holds a completion document when the model repository wraps
/// the engine output, otherwise plain text.
fn parse_text_output(text_output: String, params: &InferParams) -> InferenceReply {
    match serde_json::from_str::<CompletionResponse>(&text_output)
        .ok()
        .and_then(|response| response.into_reply().ok())
    {
        Some(mut reply) => {
            if reply.output_tokens == 0 {
                reply.output_tokens = u64::from(params.max_tokens);
            }
            reply
        }
        None => InferenceReply {
            text: text_output,
            input_tokens: 0,
            output_tokens: u64::from(params.max_tokens),
        },
    }
}

#[async_trait]
impl InferenceClient for TrtClient {
    fn backend(&self) -> Backend {
        Backend::Trt
    }

    async fn send(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<InferenceReply> {
        let url = self
            .transport
            .endpoint(&Self::generate_path(&params.model, false))?;
        let body = Self::request(prompt, params, false);
        let payload = self.transport.post_json(url, &body, timeout).await?;
        let response = serde_json::from_slice::<GenerateResponse>(&payload)
            .context("decode trt generate response failed")?;
        Ok(parse_text_output(response.text_output, params))
    }

    async fn send_streaming(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<StreamHandle> {
        let url = self
            .transport
            .endpoint(&Self::generate_path(&params.model, true))?;
        let body = Self::request(prompt, params, true);
        let frames = self
            .transport
            .post_stream(url, &body, timeout)
            .await
            .with_context(|| format!("call trt stream API failed, model: {}", params.model))?;
        Ok(attach(ErrorPatternPostProcessor, &params.model, frames))
    }

    fn stream_reducer(&self) -> &dyn StreamReducer {
        &ChunkPerTokenReducer
    }
}
