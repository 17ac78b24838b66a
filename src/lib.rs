//! # Method Benchmark Library
//!
//! A concurrent benchmark harness for remote procedure calls ("direct
//! methods") issued to a fleet of devices through a broker. It pushes the
//! device-side settings for a run, invokes a named method on every device a
//! fixed number of times in parallel, measures each call and summarises the
//! latencies.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `config`: Run file loading and validation into an `InvocationSpec`
//! - `fleet`: Device directory and configuration push interfaces, job polling
//! - `transport`: The `RpcTransport` abstraction with loopback and TCP implementations
//! - `device`: Simulated devices and the in-process fleet that hosts them
//! - `invocation`: The per-device invocation loop
//! - `benchmark`: The orchestrator that fans out loops and tears them down
//! - `stats`: Samples and the thread-safe statistics accumulator
//! - `sink`: Destinations for the human-readable benchmark record
//! - `results`: Run report, summary block and JSON output
//! - `cancel`: Run-wide cancellation signal
//! - `cli` / `logging`: Command line and diagnostics setup for the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use method_bench::{
//!     BenchmarkOrchestrator, InvocationSpec, LogWriter, SimulatedFleet, TransportFactory,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = InvocationSpec {
//!         method_name: "DeviceMethodTest".to_string(),
//!         payload_size: 256,
//!         response_data_size: 128,
//!         iteration_count: 100,
//!         interval_ms: 10,
//!         call_timeout_ms: 5_000,
//!         wait_in_method_ms: 0,
//!         module_id: None,
//!     };
//!     let fleet = Arc::new(SimulatedFleet::with_devices(4));
//!     let devices: Vec<String> = (0..4).map(|i| format!("sim-device-{:03}", i)).collect();
//!
//!     let orchestrator = BenchmarkOrchestrator::new(spec, Arc::new(LogWriter::console()));
//!     let report = orchestrator
//!         .run(&devices, &TransportFactory::Loopback(fleet), async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     println!("{}", report.statistics.latency);
//!     Ok(())
//! }
//! ```

/// Benchmark orchestration
///
/// Contains the `BenchmarkOrchestrator`, which opens one transport per
/// device, runs the device loops concurrently, handles stop requests and
/// closes every transport before producing the run report.
pub mod benchmark;

pub mod cancel;

/// Command-line interface
///
/// Argument parsing using clap, including duration parsing with
/// human-readable formats (e.g., "2s", "500ms").
pub mod cli;

/// Run file loading and validation
pub mod config;

/// Simulated devices and fleet
///
/// Device-side behaviour (in-method sleep, response body of configurable
/// length) and the in-process fleet used by the loopback transport and the
/// TCP broker.
pub mod device;

pub mod fleet;

pub mod invocation;

pub mod logging;

/// Run report, summary block and JSON output
///
/// Collects the outcome of a run with system information for
/// reproducibility and writes it as structured JSON.
pub mod results;

pub mod sink;

/// Latency samples and statistics
///
/// Thread-safe collection of per-call samples with incremental mean and
/// variance, median, percentiles and a per-device breakdown.
pub mod stats;

/// Transport abstraction and implementations
///
/// The `RpcTransport` trait plus an in-process loopback transport and a TCP
/// broker transport using length-prefixed bincode frames.
pub mod transport;

pub mod utils;

// Re-export key types for convenient library usage

pub use benchmark::{BenchmarkOrchestrator, RunError};
pub use cancel::CancellationSignal;
pub use cli::{Args, RunMode, TransportKind};
pub use config::{ConfigError, InvocationSpec, RunConfig};
pub use device::{DeviceSimulator, SimulatedFleet};
pub use fleet::{ConfigurationPush, DesiredSettings, DeviceDirectory, DeviceQuery, JobStatus};
pub use invocation::DeviceInvocationLoop;
pub use results::{ResultsManager, RunOutcome, RunReport};
pub use sink::{LogWriter, MemorySink, ResultSink};
pub use stats::{LatencyStats, RunStatistics, StatisticsAccumulator};
pub use transport::{MethodRequest, MethodResponse, RpcTransport, TransportFactory};

/// The current version of the method benchmark
///
/// Populated from Cargo.toml and recorded in every JSON report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Per-call timeout used when the run file sets `response-timeout` to 0
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Longest wait for a TCP connection to the broker
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Interval between configuration job status polls
    pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Longest wait for a configuration job to reach a terminal state
    ///
    /// Matches the maximum execution time given to the job itself.
    pub const JOB_TIMEOUT: Duration = Duration::from_secs(120);

    /// Size of the simulated fleet when devices are selected by type
    pub const SIMULATED_DEVICES: usize = 4;

    /// Default broker host
    pub const HOST: &str = "127.0.0.1";

    /// Default broker port
    pub const PORT: u16 = 8080;

    /// Device type reported by simulated devices
    pub const DEVICE_TYPE: &str = "method-invocation-test-device";
}
