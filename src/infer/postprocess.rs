// 流式后处理：识别后端在 200 响应中内嵌的错误，补发结束帧后停止转发。
use crate::core::error::ProfilerError;
use crate::infer::stream::{
    finish_completion, FrameReceiver, FrameSender, StreamFrame, FRAME_CHANNEL_CAPACITY,
};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

pub trait StreamPostProcessor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Returns the error text when `line` carries an embedded backend error.
    fn detect_error(&self, line: &str) -> Option<String>;

    /// True when `line` is the backend's own end-of-stream marker. The stream
    /// is closed with finish frames and counts as a success.
    fn is_clean_end(&self, _line: &str) -> bool {
        false
    }
}

/// vLLM style: errors arrive as an OpenAI error envelope or an `event: {error: ..}` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageObjectPostProcessor;

/// TensorRT-LLM on Triton: errors arrive as `data: {"error":"..."}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPatternPostProcessor;

const EOF_MARKER: &str = "EOF";

fn event_error_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"event: \{error: [^"]+\}"#).expect("invalid event regex"))
}

fn data_error_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"data: \{"error":"[^"]+"\}"#).expect("invalid data error regex")
    })
}

fn error_envelope_message(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    if object.get("object").and_then(Value::as_str) == Some("error") {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("backend returned an error object");
        return Some(message.to_string());
    }
    match object.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(inner) => Some(
            inner
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend returned an error object")
                .to_string(),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl StreamPostProcessor for UsageObjectPostProcessor {
    fn name(&self) -> &'static str {
        "usage-object"
    }

    fn detect_error(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if let Some(found) = event_error_regex().find(trimmed) {
            if found.as_str().contains(EOF_MARKER) {
                return None;
            }
            return Some(found.as_str().to_string());
        }
        let body = trimmed
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(trimmed);
        if !body.starts_with('{') {
            return None;
        }
        let value = serde_json::from_str::<Value>(body).ok()?;
        error_envelope_message(&value)
    }

    fn is_clean_end(&self, line: &str) -> bool {
        event_error_regex()
            .find(line.trim())
            .is_some_and(|found| found.as_str().contains(EOF_MARKER))
    }
}

impl StreamPostProcessor for ErrorPatternPostProcessor {
    fn name(&self) -> &'static str {
        "error-pattern"
    }

    fn detect_error(&self, line: &str) -> Option<String> {
        data_error_regex()
            .find(line)
            .map(|found| found.as_str().to_string())
    }
}

/// Completion state of the post-processor task behind a stream.
pub struct StreamStatus(Option<JoinHandle<Result<(), ProfilerError>>>);

impl StreamStatus {
    pub fn ok() -> Self {
        Self(None)
    }

    pub async fn wait(self) -> Result<(), ProfilerError> {
        match self.0 {
            None => Ok(()),
            Some(handle) => handle.await.map_err(|err| {
                ProfilerError::backend(format!("stream post-processor aborted: {err}"))
            })?,
        }
    }
}

pub struct StreamHandle {
    pub frames: FrameReceiver,
    pub status: StreamStatus,
}

impl StreamHandle {
    /// Wraps frames that need no post-processing.
    pub fn passthrough(frames: FrameReceiver) -> Self {
        Self {
            frames,
            status: StreamStatus::ok(),
        }
    }
}

/// Runs `processor` between the decoder and the metrics reducer.
pub fn attach<P: StreamPostProcessor>(processor: P, model: &str, input: FrameReceiver) -> StreamHandle {
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let model = model.to_string();
    let handle = tokio::spawn(async move { run_post_processor(processor, model, input, tx).await });
    StreamHandle {
        frames: rx,
        status: StreamStatus(Some(handle)),
    }
}

async fn emit_finish(out: &FrameSender, model: &str) {
    for frame in finish_completion(model) {
        if out.send(frame).await.is_err() {
            return;
        }
    }
}

async fn run_post_processor<P: StreamPostProcessor>(
    processor: P,
    model: String,
    mut input: FrameReceiver,
    out: FrameSender,
) -> Result<(), ProfilerError> {
    while let Some(frame) = input.recv().await {
        let failure = match &frame {
            StreamFrame::Data(line) => {
                let text = String::from_utf8_lossy(line);
                if processor.is_clean_end(&text) {
                    emit_finish(&out, &model).await;
                    let _ = out.send(StreamFrame::EndOfStream).await;
                    return Ok(());
                }
                processor.detect_error(&text).map(ProfilerError::backend)
            }
            StreamFrame::EndOfStream => {
                let _ = out.send(frame).await;
                return Ok(());
            }
            StreamFrame::Canceled => Some(ProfilerError::cancelled("stream read canceled")),
            StreamFrame::TransportError(reason) => Some(ProfilerError::transport(reason.clone())),
        };
        if let Some(err) = failure {
            error!(
                "{} stream of model {model} aborted: {}",
                processor.name(),
                err.message()
            );
            emit_finish(&out, &model).await;
            return Err(err);
        }
        if out.send(frame).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}
