use clap::{Args, Parser, Subcommand};
use llm_profiler::infer::Backend;
use llm_profiler::sweep::SweepMode;
use std::path::PathBuf;

/// LLM Profiler（推理服务压测工具）
///
/// Ramps concurrency against an inference server until throughput converges.
/// 逐步提升并发度压测推理服务，直到吞吐收敛或服务质量下降。
#[derive(Debug, Parser)]
#[command(author, version, bin_name = "llm-profiler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the concurrency ramp from a config file / 按配置文件执行并发爬坡压测。
    Run(RunArgs),
    /// Single request speed sweep / 单请求速度测试。
    Speed(SpeedArgs),
    /// Ramp over an input × output length matrix / 按输入、输出长度矩阵逐组压测。
    Sweep(SweepArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Config path / 配置文件路径（默认 config/config.yaml，可由 LLM_PROFILER_CONFIG_PATH 覆盖）。
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Result dir override / 结果目录覆盖，必须为空或不存在。
    #[arg(long = "save-dir")]
    pub save_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct SpeedArgs {
    /// Server address / 推理服务地址。
    #[arg(long = "server-ip", default_value = "127.0.0.1")]
    pub server_ip: String,

    /// Server port / 推理服务端口。
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Model name / 模型名称。
    #[arg(long, short = 'm')]
    pub model: String,

    /// Backend: vllm / trt / tgi / 推理后端。
    #[arg(long, default_value = "vllm")]
    pub backend: Backend,

    /// Prompt corpus token length, 0 uses a fixed short prompt / 输入 token 长度，0 表示使用固定短句。
    #[arg(long = "input-tokens", default_value_t = 0)]
    pub input_tokens: u32,

    /// Sampling temperature / 采样温度。
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,

    /// Log level / 日志级别。
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Args)]
pub struct SweepArgs {
    /// peak: no latency bound; inline: repeat per TIME timeout / peak 测峰值吞吐，inline 测给定超时下的吞吐。
    #[arg(long, default_value = "peak")]
    pub mode: SweepMode,

    /// Server address / 推理服务地址。
    #[arg(long = "server-ip", short = 'i', default_value = "127.0.0.1")]
    pub server_ip: String,

    /// Server port / 推理服务端口。
    #[arg(long, short = 'p', default_value_t = 8000)]
    pub port: u16,

    /// Model name / 模型名称。
    #[arg(long, short = 'm')]
    pub model: String,

    /// Backend: vllm / trt / tgi / 推理后端。
    #[arg(long, short = 'b', default_value = "vllm")]
    pub backend: Backend,

    /// User id, also the default result root / 用户标识，同时作为默认结果根目录。
    #[arg(long, short = 'u', default_value = "local")]
    pub user: String,

    /// Prompt corpus dir / 提示词语料目录。
    #[arg(long = "prompt-dir")]
    pub prompt_dir: Option<String>,

    /// Result root, must be empty or missing / 结果根目录，必须为空或不存在。
    #[arg(long = "save-dir")]
    pub save_dir: Option<PathBuf>,

    /// Send a webhook message after every ramp / 每组压测结束后发送通知。
    #[arg(long)]
    pub notify: bool,

    /// Log level / 日志级别。
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}
