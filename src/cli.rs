use crate::transport::TransportConfig;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Method Benchmark - concurrent direct-method invocation benchmark for device fleets
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Run the benchmark (invoke) or host a simulated fleet broker (device)
    #[clap(long, value_enum, default_value_t = RunMode::Invoke, help_heading = "Core Options")]
    pub mode: RunMode,

    /// Run file (.yaml, .yml or .json) with a `method-invocation-spec` section
    #[clap(short = 'c', long, help_heading = "Core Options")]
    pub config: Option<PathBuf>,

    /// How calls reach the devices
    #[clap(short = 't', long, value_enum, default_value_t = TransportKind::Loopback, help_heading = "Core Options")]
    pub transport: TransportKind,

    /// Broker host for the TCP transport (bind address in device mode)
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "Broker")]
    pub host: String,

    /// Broker port for the TCP transport (listen port in device mode)
    #[clap(long, default_value_t = crate::defaults::PORT, help_heading = "Broker")]
    pub port: u16,

    /// Socket buffer size for TCP connections
    #[clap(long, default_value_t = 8192, help_heading = "Broker")]
    pub buffer_size: usize,

    /// Give up connecting to the broker after this long
    #[clap(long, value_parser = parse_duration, default_value = "10s", help_heading = "Broker")]
    pub connect_timeout: Duration,

    /// Devices in the simulated fleet when selecting by device type
    #[clap(long, default_value_t = crate::defaults::SIMULATED_DEVICES, help_heading = "Fleet")]
    pub simulated_devices: usize,

    /// Interval between configuration job status polls (e.g. "2s", "500ms")
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Fleet")]
    pub job_poll_interval: Duration,

    /// Give up on the configuration job after this long
    #[clap(long, value_parser = parse_duration, default_value = "120s", help_heading = "Fleet")]
    pub job_timeout: Duration,

    /// Do not push sleep time and response length to the devices before the run
    #[clap(long, default_value_t = false, help_heading = "Fleet")]
    pub skip_config_push: bool,

    /// File receiving the per-call record and the summary
    #[clap(short = 'l', long, help_heading = "Output")]
    pub log: Option<PathBuf>,

    /// Append to the record file instead of truncating it
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub append_log: bool,

    /// Do not echo the record to the console when a record file is set
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Output file for the run report (JSON format)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Increase diagnostic verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Also write diagnostics to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// TCP connection settings derived from the broker options
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Whether record lines go to the console
    pub fn console_output(&self) -> bool {
        !self.quiet || self.log.is_none()
    }
}

/// Process role
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum RunMode {
    /// Run the benchmark against a fleet
    Invoke,
    /// Serve a simulated fleet over TCP
    Device,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Invoke => write!(f, "invoke"),
            RunMode::Device => write!(f, "device"),
        }
    }
}

/// Available transports for reaching devices
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process simulated fleet
    Loopback,
    /// Remote broker over TCP
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Loopback => write!(f, "Loopback"),
            TransportKind::Tcp => write!(f, "TCP"),
        }
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
