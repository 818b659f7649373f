// 停止判断：成功率、流式速度下限、非流式吞吐收敛与恶化。
use crate::core::config::{StopPolicy, TestConfig};
use crate::ops::ramp::SummaryTable;
use crate::ops::statistics::is_close;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RampOutcome {
    Converged,
    Degraded,
    SuccessRateCollapse,
    StreamSpeedFloor,
    Exhausted,
    Cancelled,
}

impl RampOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RampOutcome::Converged => "converged",
            RampOutcome::Degraded => "degraded",
            RampOutcome::SuccessRateCollapse => "success_rate_collapse",
            RampOutcome::StreamSpeedFloor => "stream_speed_floor",
            RampOutcome::Exhausted => "exhausted",
            RampOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Continue,
    Stop(RampOutcome),
}

#[derive(Debug, Clone)]
pub struct StopEvaluator {
    policy: StopPolicy,
    stream: bool,
    start: usize,
    increment: usize,
    input_tokens: u32,
    stream_floor: f64,
}

impl StopEvaluator {
    pub fn new(config: &TestConfig, baseline_speed: f64) -> Self {
        let policy = config.stop_policy.clone();
        let stream_floor = baseline_speed * config.stream_thresholds / 100.0 * policy.stream_slack;
        Self {
            policy,
            stream: config.stream,
            start: config.start_concurrency,
            increment: config.increment,
            input_tokens: config.input_tokens,
            stream_floor,
        }
    }

    pub fn stream_floor(&self) -> f64 {
        self.stream_floor
    }

    /// Judges the round just inserted at `concurrency`. Discarded rounds are
    /// removed from `table` before returning.
    pub fn evaluate(&self, table: &mut SummaryTable, concurrency: usize) -> StopDecision {
        let Some(current) = table.get(concurrency) else {
            warn!(concurrency, "no summary recorded for round");
            return StopDecision::Continue;
        };
        let success_rate = current.success_rate();
        if success_rate < self.policy.success_rate_floor {
            warn!("The success rate is {success_rate:.3}");
            table.remove(concurrency);
            self.log_previous(table, concurrency);
            return StopDecision::Stop(RampOutcome::SuccessRateCollapse);
        }

        if self.stream {
            let client_speed = current.client_output_tokens_per_second;
            if client_speed < self.stream_floor {
                warn!(
                    "client output speed {client_speed:.3} tokens/s is below the floor {:.3} tokens/s",
                    self.stream_floor
                );
                table.remove(concurrency);
                self.log_previous(table, concurrency);
                return StopDecision::Stop(RampOutcome::StreamSpeedFloor);
            }
            return StopDecision::Continue;
        }

        self.check_convergence(table, concurrency)
    }

    /// Compares `concurrency` with the mean of the `window - 1` kept rounds
    /// directly below it. Applies only once that many rounds exist above `start`.
    fn check_convergence(&self, table: &mut SummaryTable, concurrency: usize) -> StopDecision {
        let history = self.policy.window.saturating_sub(1);
        let span = history.saturating_mul(self.increment);
        if history == 0 || concurrency < self.start.saturating_add(span) {
            return StopDecision::Continue;
        }
        let mut past = 0.0;
        for step in 1..=history {
            let level = concurrency - step * self.increment;
            let Some(summary) = table.get(level) else {
                debug!(level, "convergence window has a gap");
                return StopDecision::Continue;
            };
            past += summary.server_output_tokens_per_second;
        }
        let history_avg = past / history as f64;
        let current = table
            .get(concurrency)
            .map(|summary| summary.server_output_tokens_per_second)
            .unwrap_or_default();

        if is_close(current, history_avg, self.policy.convergence_tolerance) {
            info!("The throughput have converged to {history_avg:.3} tokens/s, early stop");
            return StopDecision::Stop(RampOutcome::Converged);
        }
        if current < history_avg * self.policy.degradation_ratio {
            warn!("The throughput begin to drop, history: {history_avg:.3}, current: {current:.3}");
            table.remove(concurrency);
            return StopDecision::Stop(RampOutcome::Degraded);
        }
        StopDecision::Continue
    }

    fn log_previous(&self, table: &SummaryTable, concurrency: usize) {
        let previous = concurrency
            .checked_sub(self.increment)
            .and_then(|level| table.get(level));
        match previous {
            Some(summary) => info!(
                "Max throughput {:.3} tokens/s, {:.3} req/s, prompt length: {}",
                summary.server_output_tokens_per_second,
                summary.request_per_second,
                self.input_tokens
            ),
            None => info!("Max throughput is zero, please decrease your concurrency"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::statistics::RoundSummary;

    fn summary(concurrency: usize, success: u64, total: u64, server_tps: f64) -> RoundSummary {
        RoundSummary {
            concurrency,
            success,
            total,
            fail: total - success,
            server_output_tokens_per_second: server_tps,
            ..RoundSummary::default()
        }
    }

    fn config(stream: bool) -> TestConfig {
        TestConfig {
            stream,
            start_concurrency: 10,
            end_concurrency: 100,
            increment: 10,
            stream_thresholds: 80.0,
            ..TestConfig::default()
        }
    }

    #[test]
    fn collapse_discards_round() {
        let evaluator = StopEvaluator::new(&config(false), 0.0);
        let mut table = SummaryTable::default();
        table.insert(summary(10, 100, 100, 50.0));
        table.insert(summary(20, 90, 100, 60.0));
        assert_eq!(
            evaluator.evaluate(&mut table, 20),
            StopDecision::Stop(RampOutcome::SuccessRateCollapse)
        );
        assert!(table.get(20).is_none());
        assert_eq!(table.last_valid().map(|s| s.concurrency), Some(10));
    }

    #[test]
    fn empty_round_counts_as_collapse() {
        let evaluator = StopEvaluator::new(&config(false), 0.0);
        let mut table = SummaryTable::default();
        table.insert(summary(10, 0, 0, 0.0));
        assert_eq!(
            evaluator.evaluate(&mut table, 10),
            StopDecision::Stop(RampOutcome::SuccessRateCollapse)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn convergence_needs_a_full_window() {
        let evaluator = StopEvaluator::new(&config(false), 0.0);
        let mut table = SummaryTable::default();
        for level in [10, 20, 30, 40] {
            table.insert(summary(level, 10, 10, 100.0));
            assert_eq!(evaluator.evaluate(&mut table, level), StopDecision::Continue);
        }
        table.insert(summary(50, 10, 10, 101.0));
        assert_eq!(
            evaluator.evaluate(&mut table, 50),
            StopDecision::Stop(RampOutcome::Converged)
        );
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn degradation_discards_round() {
        let evaluator = StopEvaluator::new(&config(false), 0.0);
        let mut table = SummaryTable::default();
        for (level, tps) in [(10, 100.0), (20, 110.0), (30, 120.0), (40, 130.0)] {
            table.insert(summary(level, 10, 10, tps));
        }
        table.insert(summary(50, 10, 10, 80.0));
        assert_eq!(
            evaluator.evaluate(&mut table, 50),
            StopDecision::Stop(RampOutcome::Degraded)
        );
        assert!(table.get(50).is_none());
    }

    #[test]
    fn rising_throughput_continues() {
        let evaluator = StopEvaluator::new(&config(false), 0.0);
        let mut table = SummaryTable::default();
        for (level, tps) in [(10, 100.0), (20, 110.0), (30, 120.0), (40, 130.0), (50, 160.0)] {
            table.insert(summary(level, 10, 10, tps));
        }
        assert_eq!(evaluator.evaluate(&mut table, 50), StopDecision::Continue);
    }

    #[test]
    fn stream_floor_discards_round() {
        let evaluator = StopEvaluator::new(&config(true), 50.0);
        assert!((evaluator.stream_floor() - 38.0).abs() < 1e-9);
        let mut table = SummaryTable::default();
        let mut fast = summary(10, 10, 10, 0.0);
        fast.client_output_tokens_per_second = 45.0;
        table.insert(fast);
        assert_eq!(evaluator.evaluate(&mut table, 10), StopDecision::Continue);

        let mut slow = summary(20, 10, 10, 0.0);
        slow.client_output_tokens_per_second = 30.0;
        table.insert(slow);
        assert_eq!(
            evaluator.evaluate(&mut table, 20),
            StopDecision::Stop(RampOutcome::StreamSpeedFloor)
        );
        assert_eq!(table.last_valid().map(|s| s.concurrency), Some(10));
    }

    #[test]
    fn window_averages_only_the_rounds_before_current() {
        let mut config = config(false);
        config.stop_policy.window = 3;
        let evaluator = StopEvaluator::new(&config, 0.0);
        let mut table = SummaryTable::default();
        for (level, tps) in [(10, 50.0), (20, 100.0), (30, 100.0)] {
            table.insert(summary(level, 10, 10, tps));
        }
        table.insert(summary(40, 10, 10, 100.0));
        // 只比较 20 与 30 两轮，10 这一轮不在窗口内。
        assert_eq!(
            evaluator.evaluate(&mut table, 40),
            StopDecision::Stop(RampOutcome::Converged)
        );
    }
}
