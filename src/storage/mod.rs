// 存储模块：压测结果的持久化接口，默认实现按时间戳写入 JSON 文件目录。

mod json_dir;

use crate::core::config::TestConfig;
use crate::core::schemas::RequestOutcome;
use crate::ops::speed::StreamSpeed;
use crate::ops::statistics::RoundSummary;
use anyhow::Result;
use async_trait::async_trait;

pub use json_dir::{statistics_file_regex, JsonDirSink};

/// Durable destination of ramp artifacts. Callers log failures and move on.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Cumulative table, sorted ascending by concurrency.
    async fn persist_summaries(&self, summaries: &[RoundSummary]) -> Result<()>;

    async fn persist_outcomes(&self, concurrency: usize, outcomes: &[RequestOutcome])
        -> Result<()>;

    async fn persist_config(&self, config: &TestConfig) -> Result<()>;

    async fn persist_stream_speed(&self, speed: &StreamSpeed) -> Result<()>;

    /// Drops superseded cumulative tables. Sinks without history keep the default.
    async fn keep_final_result(&self) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> Option<String>;
}
