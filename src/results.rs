use crate::config::InvocationSpec;
use crate::stats::{LatencyStats, RunStatistics};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Parameters of the run, echoed in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConditions {
    pub method_name: String,
    pub payload_size: usize,
    pub response_data_size: usize,
    pub wait_in_method_ms: u64,
    pub interval_ms: u64,
    pub iteration_count: usize,
    pub call_timeout_ms: u64,
    pub transport: String,
}

impl RunConditions {
    pub fn new(spec: &InvocationSpec, transport: impl Into<String>) -> Self {
        Self {
            method_name: spec.method_name.clone(),
            payload_size: spec.payload_size,
            response_data_size: spec.response_data_size,
            wait_in_method_ms: spec.wait_in_method_ms,
            interval_ms: spec.interval_ms,
            iteration_count: spec.iteration_count,
            call_timeout_ms: spec.call_timeout().as_millis() as u64,
            transport: transport.into(),
        }
    }
}

/// How the run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every loop exhausted its iterations
    Completed,
    /// A stop request ended the run early
    Cancelled,
    /// No transport could be opened
    NoDevicesAvailable,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "stopped by operator"),
            RunOutcome::NoDevicesAvailable => write!(f, "no devices available"),
        }
    }
}

/// Device left out of the run because its transport did not open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedDevice {
    pub device_id: String,
    pub reason: String,
}

/// Complete outcome of one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    pub conditions: RunConditions,
    pub outcome: RunOutcome,
    pub devices_requested: usize,
    pub devices_connected: usize,
    pub excluded_devices: Vec<ExcludedDevice>,
    pub statistics: RunStatistics,
}

impl RunReport {
    /// Summary block written to the result sink after the last call
    pub fn summary_lines(&self) -> Vec<String> {
        let c = &self.conditions;
        let stats = &self.statistics;
        let mut lines = vec![
            "Statistics".to_string(),
            format!(
                "Condition - InvokePayloadSize={},ResponseDataSize={},SleepInMethod={},InvokeInterval={}",
                c.payload_size, c.response_data_size, c.wait_in_method_ms, c.interval_ms
            ),
            format!("Condition - transport={}", c.transport),
            format!(
                "Devices - requested={},connected={}",
                self.devices_requested, self.devices_connected
            ),
        ];

        for excluded in &self.excluded_devices {
            lines.push(format!(
                "Excluded - {}: {}",
                excluded.device_id, excluded.reason
            ));
        }
        if self.outcome != RunOutcome::Completed {
            lines.push(format!("Outcome - {}", self.outcome));
        }

        lines.push(format!("Total Invocation Count:{}", stats.total_attempted));
        lines.push(format!("Succeeded Count:{}", stats.succeeded));
        lines.push(stats.latency.to_string());

        if let Some(summary) = stats.latency.summary() {
            lines.push(format!(
                "Min:{:.3},Max:{:.3},P95:{:.3},P99:{:.3}",
                summary.min, summary.max, summary.p95, summary.p99
            ));
        }
        if stats.negative_latencies > 0 {
            lines.push(format!(
                "Note - {} invocation(s) finished faster than the in-method sleep (negative latency)",
                stats.negative_latencies
            ));
        }

        if stats.per_device.len() > 1 {
            for device in &stats.per_device {
                let latency = match &device.latency {
                    LatencyStats::Computed(s) => format!(
                        "Mean:{:.3},Median:{:.3},PSD:{:.3}",
                        s.mean, s.median, s.population_std_dev
                    ),
                    LatencyStats::NoData => "no data".to_string(),
                };
                lines.push(format!(
                    "Device {} - Succeeded {}/{},{}",
                    device.device_id, device.succeeded, device.total_attempted, latency
                ));
            }
        }

        lines
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Report metadata
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Document written to the output file
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalRunResults {
    pub metadata: ReportMetadata,
    pub report: RunReport,
}

/// Writes run reports as JSON
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Write the report with its metadata, replacing any previous file
    pub fn write_report(&self, report: &RunReport) -> Result<()> {
        let final_results = FinalRunResults {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::collect(),
            },
            report: report.clone(),
        };

        let json = serde_json::to_string_pretty(&final_results)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("failed to write {}", self.output_file.display()))?;

        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}
