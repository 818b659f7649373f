// TGI 适配：仅支持非流式 /generate，token 数来自 details。
use crate::core::schemas::InferenceReply;
use crate::infer::http::HttpTransport;
use crate::infer::metrics::{ChunkPerTokenReducer, StreamReducer};
use crate::infer::postprocess::StreamHandle;
use crate::infer::{Backend, InferParams, InferenceClient};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GENERATE_PATH: &str = "generate";

#[derive(Debug, Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
    details: bool,
    decoder_input_details: bool,
    temperature: f32,
    do_sample: bool,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateDetails {
    #[serde(default)]
    prefill: Vec<serde_json::Value>,
    #[serde(default)]
    tokens: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    generated_text: String,
    #[serde(default)]
    details: GenerateDetails,
}

pub struct TgiClient {
    transport: HttpTransport,
}

impl TgiClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl InferenceClient for TgiClient {
    fn backend(&self) -> Backend {
        Backend::Tgi
    }

    async fn send(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<InferenceReply> {
        let url = self.transport.endpoint(GENERATE_PATH)?;
        let body = GenerateRequest {
            inputs: prompt,
            parameters: GenerateParameters {
                max_new_tokens: params.max_tokens,
                details: true,
                decoder_input_details: true,
                temperature: params.temperature,
                do_sample: true,
            },
        };
        let payload = self.transport.post_json(url, &body, timeout).await?;
        let response = serde_json::from_slice::<GenerateResponse>(&payload)
            .context("decode tgi generate response failed")?;
        Ok(InferenceReply {
            text: response.generated_text,
            input_tokens: response.details.prefill.len() as u64,
            output_tokens: response.details.tokens.len() as u64,
        })
    }

    async fn send_streaming(
        &self,
        _prompt: &str,
        _params: &InferParams,
        _timeout: Duration,
    ) -> Result<StreamHandle> {
        Err(anyhow!("tgi backend does not support streaming"))
    }

    fn stream_reducer(&self) -> &dyn StreamReducer {
        &ChunkPerTokenReducer
    }
}
