// 统一错误类型：配置、语料与后端流错误共用同一结构。
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerError {
    code: &'static str,
    message: String,
}

impl ProfilerError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new("INVALID_CONFIG", message)
    }

    pub fn prompt_corpus(message: impl Into<String>) -> Self {
        Self::new("PROMPT_CORPUS", message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new("BACKEND_ERROR", message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new("TRANSPORT_ERROR", message)
    }

    pub fn stream_baseline(message: impl Into<String>) -> Self {
        Self::new("STREAM_BASELINE", message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new("CANCELLED", message)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProfilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ProfilerError {}
