// 流式解码：把 HTTP 响应体按行切分为帧，并在结束、取消或出错时追加控制帧。
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const FRAME_CHANNEL_CAPACITY: usize = 4096;
pub const DONE_LINE: &str = "data: [DONE]\n";
pub const NEW_LINE: &str = "\n";

pub type FrameReceiver = mpsc::Receiver<StreamFrame>;
pub type FrameSender = mpsc::Sender<StreamFrame>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// One body line, delimiter included.
    Data(Bytes),
    EndOfStream,
    Canceled,
    TransportError(String),
}

impl StreamFrame {
    pub fn data(line: impl Into<Bytes>) -> Self {
        StreamFrame::Data(line.into())
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, StreamFrame::Data(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StreamFrame::Data(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }
}

/// Splits `body` into line frames on a background task. The channel always
/// ends with exactly one control frame unless the receiver goes away first.
pub fn decode_lines<S, E>(
    body: S,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> FrameReceiver
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(pump_lines(body, tx, cancel, timeout));
    rx
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn pump_lines<S, E>(
    body: S,
    tx: FrameSender,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut body = Box::pin(body);
    let mut buffer = BytesMut::new();
    let expiry = wait_deadline(timeout.map(|value| Instant::now() + value));
    tokio::pin!(expiry);
    let terminal = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamFrame::Canceled,
            _ = &mut expiry => break StreamFrame::Canceled,
            item = body.next() => item,
        };
        match item {
            Some(Ok(chunk)) => {
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line = buffer.split_to(pos + 1).freeze();
                    if tx.send(StreamFrame::Data(line)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => break StreamFrame::TransportError(err.to_string()),
            None => {
                if !buffer.is_empty() {
                    let tail = buffer.split().freeze();
                    warn!(
                        "stream ended with an incomplete line: {}",
                        String::from_utf8_lossy(&tail)
                    );
                    if tx.send(StreamFrame::Data(tail)).await.is_err() {
                        return;
                    }
                }
                break StreamFrame::EndOfStream;
            }
        }
    };
    // 先释放响应体，再发送控制帧并关闭通道。
    drop(body);
    if matches!(terminal, StreamFrame::Canceled) {
        debug!("stream read canceled");
    }
    let _ = tx.send(terminal).await;
}

/// Terminal frames emitted in place of an aborted backend stream.
pub fn finish_completion(model: &str) -> Vec<StreamFrame> {
    let payload = json!({
        "object": "text_completion",
        "model": model,
        "choices": [{
            "index": 0,
            "text": "",
            "finish_reason": "length",
        }],
    });
    vec![
        StreamFrame::data(format!("data: {payload}\n")),
        StreamFrame::data(NEW_LINE),
        StreamFrame::data(DONE_LINE),
        StreamFrame::data(NEW_LINE),
    ]
}
