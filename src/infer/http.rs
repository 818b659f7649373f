// HTTP 传输：JSON 请求与流式请求共用一个连接池和取消令牌。
use crate::infer::stream::{decode_lines, FrameReceiver};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 2048;

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(base_url: &str, cancel: CancellationToken) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid inference server url: {base_url}"))?;
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("build http client failed")?;
        Ok(Self {
            client,
            base_url,
            cancel,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid endpoint path: {path}"))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        timeout: Duration,
    ) -> Result<Bytes> {
        let request = self.client.post(url.clone()).json(body);
        let request = if timeout.is_zero() {
            request
        } else {
            request.timeout(timeout)
        };
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(anyhow!("request to {url} canceled")),
            response = request.send() => response.with_context(|| format!("request to {url} failed"))?,
        };
        let status = response.status();
        let payload = response
            .bytes()
            .await
            .with_context(|| format!("read response from {url} failed"))?;
        if !status.is_success() {
            return Err(anyhow!(
                "inference request failed: {status} {}",
                truncate_text(&String::from_utf8_lossy(&payload), MAX_ERROR_BODY_CHARS)
            ));
        }
        Ok(payload)
    }

    /// Sends the request and hands the body to the line decoder. `timeout`
    /// bounds the whole exchange, headers included.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
        timeout: Duration,
    ) -> Result<FrameReceiver> {
        let started = Instant::now();
        let send = self.client.post(url.clone()).json(body).send();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(anyhow!("stream request to {url} canceled")),
            response = wait_with_timeout(send, timeout) => response
                .ok_or_else(|| anyhow!("stream request to {url} timed out"))?
                .with_context(|| format!("stream request to {url} failed"))?,
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "inference stream request failed: {status} {}",
                truncate_text(&text, MAX_ERROR_BODY_CHARS)
            ));
        }
        let remaining = if timeout.is_zero() {
            None
        } else {
            Some(timeout.saturating_sub(started.elapsed()))
        };
        Ok(decode_lines(
            response.bytes_stream(),
            self.cancel.child_token(),
            remaining,
        ))
    }
}

async fn wait_with_timeout<F: std::future::Future>(future: F, timeout: Duration) -> Option<F::Output> {
    if timeout.is_zero() {
        return Some(future.await);
    }
    tokio::time::timeout(timeout, future).await.ok()
}

pub(crate) fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut output = text.chars().take(max_chars).collect::<String>();
    output.push_str("...");
    output
}
