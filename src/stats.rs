//! # Invocation Statistics
//!
//! Samples produced by the device loops and the accumulator that turns them
//! into run statistics.
//!
//! The accumulator is the only structure written by several loops at once; a
//! mutex serialises inserts. Mean and variance are maintained incrementally
//! (Welford) as samples arrive. The latency list is kept as well, because the
//! median and percentiles need every value.
//!
//! Only succeeded samples contribute to the numeric statistics. Failed
//! samples are counted in the attempted total. A run without a single
//! succeeded call reports [`LatencyStats::NoData`] instead of numbers.

use crate::utils::{calculate_stats, format_timestamp, median_of_sorted, percentile_of_sorted, sorted};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why a call did not count as a success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The device answered with a status other than 200
    Status(u16),
    /// The transport reported an error (timeout, I/O, protocol)
    Transport(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Status(status) => write!(f, "status {}", status),
            FailureCause::Transport(message) => write!(f, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleOutcome {
    Succeeded { adjusted_latency_ms: f64 },
    Failed(FailureCause),
}

/// One measured call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSample {
    pub device_id: String,
    pub sequence_number: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub outcome: SampleOutcome,
}

impl InvocationSample {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SampleOutcome::Succeeded { .. })
    }

    /// Adjusted latency in milliseconds, only for succeeded calls
    pub fn adjusted_latency_ms(&self) -> Option<f64> {
        match self.outcome {
            SampleOutcome::Succeeded { adjusted_latency_ms } => Some(adjusted_latency_ms),
            SampleOutcome::Failed(_) => None,
        }
    }
}

impl std::fmt::Display for InvocationSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} -> {}",
            self.device_id,
            self.sequence_number,
            format_timestamp(&self.started_at),
            format_timestamp(&self.finished_at)
        )?;
        match &self.outcome {
            SampleOutcome::Succeeded {
                adjusted_latency_ms,
            } => write!(f, " = {:.3}", adjusted_latency_ms),
            SampleOutcome::Failed(cause) => write!(f, " failed: {}", cause),
        }
    }
}

/// Summary of the succeeded latencies, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub population_std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    /// Compute every statistic directly from a list of latencies.
    pub fn from_latencies(latencies: &[f64]) -> Option<Self> {
        let (mean, min, max, population_std_dev) = calculate_stats(latencies)?;
        let ordered = sorted(latencies);
        Some(Self {
            count: latencies.len(),
            mean,
            median: median_of_sorted(&ordered)?,
            population_std_dev,
            min,
            max,
            p95: percentile_of_sorted(&ordered, 95.0)?,
            p99: percentile_of_sorted(&ordered, 99.0)?,
        })
    }
}

/// Latency statistics, or an explicit marker that nothing succeeded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LatencyStats {
    NoData,
    Computed(LatencySummary),
}

impl LatencyStats {
    pub fn summary(&self) -> Option<&LatencySummary> {
        match self {
            LatencyStats::NoData => None,
            LatencyStats::Computed(summary) => Some(summary),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, LatencyStats::NoData)
    }
}

impl std::fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyStats::NoData => write!(f, "Mean:n/a,Median:n/a,PSD:n/a (no succeeded invocations)"),
            LatencyStats::Computed(s) => write!(
                f,
                "Mean:{:.3},Median:{:.3},PSD:{:.3}",
                s.mean, s.median, s.population_std_dev
            ),
        }
    }
}

/// Statistics for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatistics {
    pub device_id: String,
    pub total_attempted: usize,
    pub succeeded: usize,
    pub latency: LatencyStats,
}

/// Statistics snapshot for the whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded samples whose adjusted latency came out below zero
    pub negative_latencies: usize,
    pub latency: LatencyStats,
    pub per_device: Vec<DeviceStatistics>,
}

/// Welford running mean and sum of squared deviations
#[derive(Debug, Default, Clone, Copy)]
struct RunningMoments {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn population_std_dev(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).max(0.0).sqrt())
    }
}

#[derive(Debug, Default)]
struct DeviceTally {
    attempted: usize,
    latencies: Vec<f64>,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    attempted: usize,
    failed: usize,
    negative: usize,
    moments: RunningMoments,
    latencies: Vec<f64>,
    per_device: BTreeMap<String, DeviceTally>,
}

/// Thread-safe collector of invocation samples
#[derive(Debug, Default)]
pub struct StatisticsAccumulator {
    state: Mutex<AccumulatorState>,
}

impl StatisticsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample. Negative latencies are stored unchanged.
    pub fn record(&self, sample: &InvocationSample) {
        let mut state = self.state.lock();
        state.attempted += 1;
        let tally = state.per_device.entry(sample.device_id.clone()).or_default();
        tally.attempted += 1;

        match sample.adjusted_latency_ms() {
            Some(latency) => {
                tally.latencies.push(latency);
                state.moments.push(latency);
                state.latencies.push(latency);
                if latency < 0.0 {
                    state.negative += 1;
                }
            }
            None => state.failed += 1,
        }
    }

    /// Take a statistics snapshot over everything recorded so far.
    pub fn snapshot(&self) -> RunStatistics {
        let state = self.state.lock();

        let latency = match (
            state.moments.population_std_dev(),
            sorted_median(&state.latencies),
            calculate_stats(&state.latencies),
        ) {
            (Some(population_std_dev), Some((median, ordered)), Some((_, min, max, _))) => {
                match (
                    percentile_of_sorted(&ordered, 95.0),
                    percentile_of_sorted(&ordered, 99.0),
                ) {
                    (Some(p95), Some(p99)) => LatencyStats::Computed(LatencySummary {
                        count: state.moments.count,
                        mean: state.moments.mean,
                        median,
                        population_std_dev,
                        min,
                        max,
                        p95,
                        p99,
                    }),
                    _ => LatencyStats::NoData,
                }
            }
            _ => LatencyStats::NoData,
        };

        let per_device = state
            .per_device
            .iter()
            .map(|(device_id, tally)| DeviceStatistics {
                device_id: device_id.clone(),
                total_attempted: tally.attempted,
                succeeded: tally.latencies.len(),
                latency: LatencySummary::from_latencies(&tally.latencies)
                    .map_or(LatencyStats::NoData, LatencyStats::Computed),
            })
            .collect();

        RunStatistics {
            total_attempted: state.attempted,
            succeeded: state.latencies.len(),
            failed: state.failed,
            negative_latencies: state.negative,
            latency,
            per_device,
        }
    }
}

fn sorted_median(latencies: &[f64]) -> Option<(f64, Vec<f64>)> {
    let ordered = sorted(latencies);
    median_of_sorted(&ordered).map(|median| (median, ordered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample(device_id: &str, seq: usize, outcome: SampleOutcome) -> InvocationSample {
        let now = Local::now();
        InvocationSample {
            device_id: device_id.to_string(),
            sequence_number: seq,
            started_at: now,
            finished_at: now,
            outcome,
        }
    }

    fn ok(device_id: &str, seq: usize, latency: f64) -> InvocationSample {
        sample(
            device_id,
            seq,
            SampleOutcome::Succeeded {
                adjusted_latency_ms: latency,
            },
        )
    }

    #[test]
    fn test_population_std_dev_of_two_values() {
        let acc = StatisticsAccumulator::new();
        acc.record(&ok("d", 0, 10.0));
        acc.record(&ok("d", 1, 20.0));

        let stats = acc.snapshot();
        let summary = stats.latency.summary().unwrap();
        assert_eq!(summary.count, 2);
        assert!((summary.mean - 15.0).abs() < 1e-12);
        assert!((summary.median - 15.0).abs() < 1e-12);
        assert!((summary.population_std_dev - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_succeeded_samples_is_no_data() {
        let acc = StatisticsAccumulator::new();
        assert!(acc.snapshot().latency.is_no_data());

        acc.record(&sample("d", 0, SampleOutcome::Failed(FailureCause::Status(500))));
        let stats = acc.snapshot();
        assert!(stats.latency.is_no_data());
        assert_eq!(stats.total_attempted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert!(stats.latency.to_string().contains("no succeeded invocations"));
    }

    #[test]
    fn test_failed_samples_only_count_as_attempts() {
        let acc = StatisticsAccumulator::new();
        acc.record(&ok("d", 0, 4.0));
        acc.record(&sample(
            "d",
            1,
            SampleOutcome::Failed(FailureCause::Transport("no response within 1s".into())),
        ));
        acc.record(&ok("d", 2, 8.0));

        let stats = acc.snapshot();
        assert_eq!(stats.total_attempted, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.latency.summary().unwrap().mean - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_latency_is_kept() {
        let acc = StatisticsAccumulator::new();
        acc.record(&ok("d", 0, -2.5));
        acc.record(&ok("d", 1, 1.5));

        let stats = acc.snapshot();
        let summary = stats.latency.summary().unwrap();
        assert_eq!(summary.min, -2.5);
        assert!((summary.mean + 0.5).abs() < 1e-12);
        assert_eq!(stats.negative_latencies, 1);
    }

    #[test]
    fn test_incremental_matches_batch() {
        let latencies: Vec<f64> = (0..257)
            .map(|i| ((i * 7919) % 113) as f64 * 0.37 - 5.0)
            .collect();
        let acc = StatisticsAccumulator::new();
        for (i, latency) in latencies.iter().enumerate() {
            acc.record(&ok(if i % 2 == 0 { "a" } else { "b" }, i, *latency));
        }

        let incremental = acc.snapshot();
        let incremental = incremental.latency.summary().unwrap();
        let batch = LatencySummary::from_latencies(&latencies).unwrap();

        assert_eq!(incremental.count, batch.count);
        assert!((incremental.mean - batch.mean).abs() < 1e-9);
        assert!((incremental.median - batch.median).abs() < 1e-9);
        assert!((incremental.population_std_dev - batch.population_std_dev).abs() < 1e-9);
        assert_eq!(incremental.min, batch.min);
        assert_eq!(incremental.max, batch.max);
        assert!((incremental.p99 - batch.p99).abs() < 1e-9);
    }

    #[test]
    fn test_per_device_breakdown() {
        let acc = StatisticsAccumulator::new();
        acc.record(&ok("b", 0, 3.0));
        acc.record(&ok("a", 0, 1.0));
        acc.record(&sample("a", 1, SampleOutcome::Failed(FailureCause::Status(404))));

        let stats = acc.snapshot();
        assert_eq!(stats.per_device.len(), 2);
        assert_eq!(stats.per_device[0].device_id, "a");
        assert_eq!(stats.per_device[0].total_attempted, 2);
        assert_eq!(stats.per_device[0].succeeded, 1);
        assert_eq!(stats.per_device[1].device_id, "b");
        assert_eq!(stats.per_device[1].latency.summary().unwrap().mean, 3.0);
    }

    #[test]
    fn test_concurrent_inserts_are_all_counted() {
        let acc = Arc::new(StatisticsAccumulator::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        acc.record(&ok(&format!("device-{}", t), i, i as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = acc.snapshot();
        assert_eq!(stats.total_attempted, 2000);
        assert_eq!(stats.succeeded, 2000);
        assert_eq!(stats.per_device.len(), 8);
    }

    #[test]
    fn test_single_negative_sample_bounds() {
        let acc = StatisticsAccumulator::new();
        acc.record(&ok("d", 0, -3.0));

        let summary = acc.snapshot().latency.summary().cloned().unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.min, -3.0);
        assert_eq!(summary.max, -3.0);
        assert_eq!(summary.median, -3.0);
        assert_eq!(summary.p95, -3.0);
        assert_eq!(summary.p99, -3.0);
        assert_eq!(summary.population_std_dev, 0.0);
    }

    #[test]
    fn test_sample_display() {
        let line = ok("device-1", 4, 12.3456).to_string();
        assert!(line.starts_with("device-1 [4] "));
        assert!(line.contains(" -> "));
        assert!(line.ends_with(" = 12.346"));

        let failed = sample("device-1", 5, SampleOutcome::Failed(FailureCause::Status(500)));
        assert!(failed.to_string().ends_with(" failed: status 500"));
    }
}
