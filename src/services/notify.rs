// 结果通知：压测结束后通过企业微信机器人 webhook 推送 markdown 摘要。
use crate::core::config::TestConfig;
use crate::ops::ramp::RampReport;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub fn render_message(config: &TestConfig, report: &RampReport) -> String {
    let mut text = String::from("## Performance Test Done\n");
    text.push_str(&format!(
        "> model: <font color=\"info\">{}</font>\n> backend: <font color=\"info\">{}</font>\n> outcome: <font color=\"info\">{}</font>\n",
        config.model.name,
        config.backend.as_str(),
        report.outcome.as_str()
    ));
    match report.max_round.as_ref() {
        Some(round) => text.push_str(&format!(
            "> max throughput: <font color=\"info\">{:.3} tokens/s, {:.3} req/s at concurrency {}</font>\n",
            round.server_output_tokens_per_second, round.request_per_second, round.concurrency
        )),
        None => text.push_str("> max throughput: <font color=\"warning\">none</font>\n"),
    }
    if let Some(location) = report.location.as_deref() {
        text.push_str(&format!("> path: <font color=\"info\">{location}</font>\n"));
    }
    text.push('\n');
    if !config.user.trim().is_empty() {
        text.push_str(&format!("<@{}>\n", config.user.trim()));
    }
    text
}

pub async fn post_markdown(http: &Client, webhook_url: &str, content: &str) -> Result<()> {
    let payload = json!({
        "msgtype": "markdown",
        "markdown": { "content": content }
    });
    let response = http
        .post(webhook_url)
        .timeout(WEBHOOK_TIMEOUT)
        .json(&payload)
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("webhook post failed: {status} {body}"));
    }
    info!("webhook response: {body}");
    Ok(())
}

/// Posts the ramp summary when `sendMsg` is set. Failures are only logged.
pub async fn notify_report(config: &TestConfig, report: &RampReport) {
    if !config.send_msg {
        return;
    }
    let Some(webhook_url) = config.resolved_webhook_url() else {
        warn!("sendMsg is set but no webhook url is configured");
        return;
    };
    let content = render_message(config, report);
    if let Err(err) = post_markdown(&Client::new(), &webhook_url, &content).await {
        warn!("send webhook message failed: {err:#}");
    }
}
