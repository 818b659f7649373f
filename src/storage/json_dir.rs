// JSON 目录存储：results/statistics/config/stream_speed 文件按时间戳命名。
use super::ResultSink;
use crate::core::config::TestConfig;
use crate::core::schemas::RequestOutcome;
use crate::ops::speed::StreamSpeed;
use crate::ops::statistics::{RoundSummary, TIME_FORMAT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs as tokio_fs;
use tracing::debug;

pub fn statistics_file_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^statistics_\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.json$")
            .expect("invalid statistics file regex")
    })
}

#[derive(Debug, Clone)]
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn timestamp() -> String {
        Local::now().format(TIME_FORMAT).to_string()
    }

    async fn write_json<T: Serialize + ?Sized>(&self, file_name: String, value: &T) -> Result<()> {
        tokio_fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create result dir {} failed", self.dir.display()))?;
        let payload = serde_json::to_vec_pretty(value)?;
        let path = self.dir.join(file_name);
        tokio_fs::write(&path, payload)
            .await
            .with_context(|| format!("write {} failed", path.display()))?;
        debug!("saved {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonDirSink {
    async fn persist_summaries(&self, summaries: &[RoundSummary]) -> Result<()> {
        self.write_json(format!("statistics_{}.json", Self::timestamp()), summaries)
            .await
    }

    async fn persist_outcomes(
        &self,
        concurrency: usize,
        outcomes: &[RequestOutcome],
    ) -> Result<()> {
        self.write_json(
            format!("results_{}_concurrency_{concurrency}.json", Self::timestamp()),
            outcomes,
        )
        .await
    }

    async fn persist_config(&self, config: &TestConfig) -> Result<()> {
        self.write_json(format!("config_{}.json", Self::timestamp()), config)
            .await
    }

    async fn persist_stream_speed(&self, speed: &StreamSpeed) -> Result<()> {
        self.write_json(format!("stream_speed_{}.json", Self::timestamp()), speed)
            .await
    }

    /// Timestamps sort lexically, so the greatest name is the newest table.
    async fn keep_final_result(&self) -> Result<()> {
        let mut entries = match tokio_fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut tables = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if statistics_file_regex().is_match(&name) {
                tables.push(entry.path());
            }
        }
        tables.sort();
        tables.pop();
        for path in tables {
            tokio_fs::remove_file(&path)
                .await
                .with_context(|| format!("remove {} failed", path.display()))?;
        }
        Ok(())
    }

    fn location(&self) -> Option<String> {
        Some(self.dir.display().to_string())
    }
}
