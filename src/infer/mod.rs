// 推理后端适配：统一的客户端接口，按配置选择具体后端实现。
pub mod http;
pub mod metrics;
pub mod postprocess;
pub mod stream;
pub mod tgi;
pub mod trt;
pub mod vllm;

use crate::core::config::TestConfig;
use crate::core::schemas::InferenceReply;
use anyhow::Result;
use async_trait::async_trait;
use metrics::StreamReducer;
use postprocess::StreamHandle;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Vllm,
    #[serde(alias = "triton", alias = "trtllm")]
    Trt,
    Tgi,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Trt => "trt",
            Backend::Tgi => "tgi",
        }
    }

    pub fn supports_stream(&self) -> bool {
        !matches!(self, Backend::Tgi)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vllm" => Ok(Backend::Vllm),
            "trt" | "triton" | "trtllm" => Ok(Backend::Trt),
            "tgi" => Ok(Backend::Tgi),
            other => Err(format!("unsupported backend: {other}")),
        }
    }
}

/// Generation parameters shared by every backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InferParams {
    pub model: String,
    pub model_version: String,
    pub stop_words: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn backend(&self) -> Backend;

    async fn send(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<InferenceReply>;

    async fn send_streaming(
        &self,
        prompt: &str,
        params: &InferParams,
        timeout: Duration,
    ) -> Result<StreamHandle>;

    fn stream_reducer(&self) -> &dyn StreamReducer;
}

/// Picks the client for the configured backend. Cancelling `cancel` aborts
/// every in-flight request of the returned client.
pub fn build_client(
    config: &TestConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn InferenceClient>> {
    let transport = http::HttpTransport::new(&config.base_url(), cancel)?;
    let client: Arc<dyn InferenceClient> = match config.backend {
        Backend::Vllm => Arc::new(vllm::VllmClient::new(transport)),
        Backend::Trt => Arc::new(trt::TrtClient::new(transport)),
        Backend::Tgi => Arc::new(tgi::TgiClient::new(transport)),
    };
    Ok(client)
}
