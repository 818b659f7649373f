// 日志初始化：控制台输出，可选同时写入结果目录下的日志文件。
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_NAME: &str = "test.log";

fn build_filter(level: &str) -> EnvFilter {
    let level = level.trim();
    let level = if level.is_empty() {
        "info".to_string()
    } else {
        level.to_lowercase()
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber. Keep the returned guard alive until exit,
/// otherwise buffered file lines are lost.
pub fn init_tracing(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = build_filter(level);
    let console = fmt::layer().with_target(false);
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init();
            None
        }
    }
}
