// Rust 入口：解析命令行，执行并发爬坡压测或单请求速度测试。
mod args;

use anyhow::{anyhow, bail, Context, Result};
use args::{Cli, Command, RunArgs, SpeedArgs, SweepArgs};
use chrono::Local;
use clap::Parser;
use llm_profiler::config::{load_config, TestConfig};
use llm_profiler::infer::build_client;
use llm_profiler::logging::init_tracing;
use llm_profiler::prompts::{corpus_path, load_entries, DEFAULT_PROMPT_DIR};
use llm_profiler::ramp::run_ramp;
use llm_profiler::shutdown::cancel_on_shutdown;
use llm_profiler::speed::{SpeedProbe, SWEEP_PROMPT, SWEEP_PROMPT_TOKENS};
use llm_profiler::statistics::TIME_FORMAT;
use llm_profiler::storage::{JsonDirSink, ResultSink};
use llm_profiler::sweep::{run_sweep, SweepPlan};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Speed(args) => speed(args).await,
        Command::Sweep(args) => sweep(args).await,
    }
}

/// Result files of different runs must not mix, so only an empty or missing
/// directory is accepted.
fn ensure_empty_dir(dir: &Path) -> Result<()> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                bail!("save dir {} is not empty", dir.display());
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => std::fs::create_dir_all(dir)
            .with_context(|| format!("create save dir {} failed", dir.display())),
        Err(err) => Err::<(), _>(err).with_context(|| format!("read save dir {} failed", dir.display())),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config_path.as_deref())?;
    if let Some(save_dir) = args.save_dir {
        config.save_dir = save_dir.display().to_string();
    }
    let save_dir = Path::new(&config.save_dir).to_path_buf();
    ensure_empty_dir(&save_dir)?;
    let _log_guard = init_tracing(&config.log_level, Some(save_dir.as_path()));
    info!(
        "model: {}, backend: {}, estimated time: {:.1} min",
        config.model.name,
        config.backend.as_str(),
        config.estimated_minutes()
    );

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let client = build_client(&config, cancel.clone())?;
    let sink = Arc::new(JsonDirSink::new(&save_dir));
    let report = run_ramp(config, client, sink, cancel)
        .await
        .ok_or_else(|| anyhow!("ramp did not run, see log for details"))?;
    info!(
        outcome = report.outcome.as_str(),
        "test finished, results saved to {}",
        report.location.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn pick_prompt(input_tokens: u32) -> Result<(String, u64)> {
    if input_tokens == 0 {
        return Ok((SWEEP_PROMPT.to_string(), SWEEP_PROMPT_TOKENS));
    }
    let entries = load_entries(&corpus_path(DEFAULT_PROMPT_DIR, input_tokens))?;
    if entries.is_empty() {
        bail!("prompt corpus for {input_tokens} tokens is empty");
    }
    let index = (Uuid::new_v4().as_u128() % entries.len() as u128) as usize;
    let entry = entries
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("prompt index {index} out of range"))?;
    Ok((entry.prompt, u64::from(entry.tokens)))
}

async fn speed(args: SpeedArgs) -> Result<()> {
    let _log_guard = init_tracing(&args.log_level, None);
    let mut config = TestConfig {
        server_ip: args.server_ip,
        port: args.port,
        backend: args.backend,
        temperature: args.temperature,
        ..TestConfig::default()
    };
    config.model.name = args.model;
    config.model.version = "1".to_string();
    info!(
        "Single request speed test on model {} at {}",
        config.model.name,
        config.base_url()
    );
    let (prompt, tokens) = pick_prompt(args.input_tokens)?;
    info!(
        "prompt string len: {}, estimated tokens: {tokens}",
        prompt.chars().count()
    );
    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let client = build_client(&config, cancel)?;
    SpeedProbe::default()
        .single_request_sweep(client.as_ref(), &config.infer_params(), &prompt)
        .await;
    Ok(())
}

async fn sweep(args: SweepArgs) -> Result<()> {
    let root = args.save_dir.clone().unwrap_or_else(|| {
        PathBuf::from(&args.user).join(format!("auto_{}", Local::now().format(TIME_FORMAT)))
    });
    ensure_empty_dir(&root)?;
    let _log_guard = init_tracing(&args.log_level, Some(root.as_path()));
    let mut template = TestConfig {
        server_ip: args.server_ip,
        port: args.port,
        backend: args.backend,
        user: args.user,
        send_msg: args.notify,
        ..TestConfig::default()
    };
    template.model.name = args.model;
    template.model.version = "1".to_string();
    if let Some(prompt_dir) = args.prompt_dir {
        template.prompt_dir = prompt_dir;
    }
    let base = args.mode.base_config(template);
    let plan = SweepPlan::from_env(args.mode);
    info!(
        "Begin {} sweep on the model {} at {}",
        args.mode.as_str(),
        base.model.name,
        base.base_url()
    );

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let client = build_client(&base, cancel.clone())?;
    let results = run_sweep(
        &base,
        &plan,
        &root,
        client,
        |dir: &Path| -> Arc<dyn ResultSink> { Arc::new(JsonDirSink::new(dir)) },
        cancel,
    )
    .await?;
    info!(cases = results.data.len(), "Done");
    Ok(())
}
