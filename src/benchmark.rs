//! # Benchmark Orchestrator
//!
//! Runs one benchmark over a set of devices: opens a transport per device,
//! fans out one [`DeviceInvocationLoop`] per opened device, waits for them to
//! finish or for a stop request, closes every transport and produces the
//! [`RunReport`].
//!
//! ## Run Lifecycle
//!
//! 1. **Open**: Every device gets its own transport, opened concurrently. A
//!    device whose transport fails to open is excluded and reported; the run
//!    carries on with the rest. A stop request during this phase lets the
//!    pending opens finish, then closes them without starting any loop.
//! 2. **Fan out**: One tokio task per opened device. Each task holds its
//!    transport for the whole run, so calls to one device stay sequential.
//! 3. **Wait**: The orchestrator waits for all loops. A stop request sets the
//!    shared cancellation signal and the orchestrator keeps waiting until
//!    every loop has exited on its own; no loop is aborted mid-call.
//! 4. **Close**: Every opened transport gets a close attempt, including those
//!    whose loop panicked. Close failures are logged only.
//! 5. **Report**: The statistics snapshot and the summary block are written
//!    to the result sink, and the report is returned.
//!
//! ## Failure Model
//!
//! Only an empty device list is an error. A run where no transport opened
//! still returns a report, with [`RunOutcome::NoDevicesAvailable`], so the
//! summary is always emitted.

use crate::cancel::CancellationSignal;
use crate::config::InvocationSpec;
use crate::invocation::{DeviceInvocationLoop, DeviceRunSummary};
use crate::results::{ExcludedDevice, RunConditions, RunOutcome, RunReport};
use crate::sink::ResultSink;
use crate::stats::StatisticsAccumulator;
use crate::transport::{RpcTransport, TransportProvider};
use crate::utils::{format_duration, generate_id};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Run-level failures. Everything else is reported inside the [`RunReport`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no devices resolved for the run")]
    NoDevicesResolved,

    #[error("none of the {requested} requested device(s) could be connected")]
    NoDevicesAvailable { requested: usize },
}

type SharedTransport = Arc<Mutex<Box<dyn RpcTransport>>>;

/// Single source for the banner logged before the loops start
struct RunBanner<'a> {
    spec: &'a InvocationSpec,
    transport: &'a str,
    devices: usize,
}

impl<'a> std::fmt::Display for RunBanner<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark for: {}", self.spec.method_name)?;
        writeln!(f, "  Transport:          {}", self.transport)?;
        writeln!(f, "  Devices:            {}", self.devices)?;
        writeln!(f, "  Invocations:        {}", self.spec.iteration_count)?;
        writeln!(f, "  Payload Size:       {} bytes", self.spec.payload_size)?;
        writeln!(
            f,
            "  Response Size:      {} bytes",
            self.spec.response_data_size
        )?;
        writeln!(f, "  Interval:           {} ms", self.spec.interval_ms)?;
        writeln!(f, "  Sleep In Method:    {} ms", self.spec.wait_in_method_ms)?;
        writeln!(f, "  Call Timeout:       {:?}", self.spec.call_timeout())?;
        if let Some(module_id) = &self.spec.module_id {
            writeln!(f, "  Module:             {}", module_id)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Coordinates the per-device loops of one run
pub struct BenchmarkOrchestrator {
    spec: Arc<InvocationSpec>,
    sink: Arc<dyn ResultSink>,
    cancel: CancellationSignal,
}

impl BenchmarkOrchestrator {
    pub fn new(spec: InvocationSpec, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            spec: Arc::new(spec),
            sink,
            cancel: CancellationSignal::new(),
        }
    }

    /// Handle to the run's cancellation signal
    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    /// Open every transport concurrently, keeping device order.
    async fn open_transports<P>(
        &self,
        devices: &[String],
        provider: &P,
    ) -> (Vec<(String, SharedTransport)>, Vec<ExcludedDevice>)
    where
        P: TransportProvider + ?Sized,
    {
        let pending: Vec<(String, JoinHandle<_>)> = devices
            .iter()
            .map(|device_id| {
                let mut transport = provider.create(device_id);
                let handle = tokio::spawn(async move {
                    let result = transport.open().await;
                    (transport, result)
                });
                (device_id.clone(), handle)
            })
            .collect();

        let mut opened = Vec::with_capacity(pending.len());
        let mut excluded = Vec::new();
        for (device_id, handle) in pending {
            match handle.await {
                Ok((transport, Ok(()))) => {
                    debug!("Opened {} transport for {}", transport.name(), device_id);
                    opened.push((device_id, Arc::new(Mutex::new(transport))));
                }
                Ok((_, Err(e))) => {
                    warn!("Excluding {}: {}", device_id, e);
                    excluded.push(ExcludedDevice {
                        device_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!("Opening transport for {} panicked: {}", device_id, e);
                    excluded.push(ExcludedDevice {
                        device_id,
                        reason: format!("open task failed: {}", e),
                    });
                }
            }
        }
        (opened, excluded)
    }

    fn spawn_loop(
        &self,
        device_id: &str,
        transport: SharedTransport,
        accumulator: &Arc<StatisticsAccumulator>,
    ) -> JoinHandle<DeviceRunSummary> {
        let device_loop = DeviceInvocationLoop::new(
            device_id,
            self.spec.clone(),
            self.cancel.clone(),
            accumulator.clone(),
            self.sink.clone(),
        );
        tokio::spawn(async move {
            let mut transport = transport.lock().await;
            device_loop.run(&mut **transport).await
        })
    }

    /// Run the benchmark against `devices` until every loop finishes or
    /// `stop` resolves.
    pub async fn run<P, S>(
        &self,
        devices: &[String],
        provider: &P,
        stop: S,
    ) -> Result<RunReport, RunError>
    where
        P: TransportProvider + ?Sized,
        S: Future<Output = ()>,
    {
        if devices.is_empty() {
            return Err(RunError::NoDevicesResolved);
        }

        let run_id = generate_id();
        let started_at = chrono::Utc::now();
        let clock = Instant::now();
        let transport_label = provider.label();
        let conditions = RunConditions::new(&self.spec, transport_label.clone());

        tokio::pin!(stop);
        let opening = self.open_transports(devices, provider);
        tokio::pin!(opening);
        // Opens already under way are allowed to finish so they can be closed.
        let (opened, excluded) = tokio::select! {
            biased;
            result = &mut opening => result,
            _ = &mut stop => {
                info!("Stop requested while opening transports");
                self.cancel.cancel();
                opening.await
            }
        };
        let accumulator = Arc::new(StatisticsAccumulator::new());

        let outcome = if opened.is_empty() {
            error!(
                "No devices available: all {} transport(s) failed to open",
                devices.len()
            );
            RunOutcome::NoDevicesAvailable
        } else if self.cancel.is_cancelled() {
            info!("Run stopped before the first invocation");
            self.close_transports(&opened).await;
            RunOutcome::Cancelled
        } else {
            info!(
                "\n{}",
                RunBanner {
                    spec: &self.spec,
                    transport: &transport_label,
                    devices: opened.len(),
                }
            );

            let handles: Vec<(String, JoinHandle<DeviceRunSummary>)> = opened
                .iter()
                .map(|(device_id, transport)| {
                    (
                        device_id.clone(),
                        self.spawn_loop(device_id, transport.clone(), &accumulator),
                    )
                })
                .collect();

            let joined = join_loops(handles);
            tokio::pin!(joined);

            let summaries = tokio::select! {
                biased;
                summaries = &mut joined => summaries,
                _ = &mut stop => {
                    info!("Stop requested, waiting for device loops to finish");
                    self.cancel.cancel();
                    joined.await
                }
            };

            let stopped = summaries.iter().any(|s| s.cancelled);
            self.close_transports(&opened).await;
            if stopped || self.cancel.is_cancelled() {
                RunOutcome::Cancelled
            } else {
                RunOutcome::Completed
            }
        };

        let report = RunReport {
            run_id,
            started_at,
            duration: clock.elapsed(),
            conditions,
            outcome,
            devices_requested: devices.len(),
            devices_connected: opened.len(),
            excluded_devices: excluded,
            statistics: accumulator.snapshot(),
        };

        for line in report.summary_lines() {
            self.sink.write_line(&line);
        }
        if let Err(e) = self.sink.flush() {
            warn!("Failed to flush results: {:#}", e);
        }

        info!(
            "Run {} {} in {}",
            report.run_id,
            report.outcome,
            format_duration(report.duration)
        );
        Ok(report)
    }

    /// Best-effort close of every opened transport
    async fn close_transports(&self, opened: &[(String, SharedTransport)]) {
        for (device_id, transport) in opened {
            let mut transport = transport.lock().await;
            match transport.close().await {
                Ok(()) => debug!("Closed transport for {}", device_id),
                Err(e) => warn!("Failed to close transport for {}: {}", device_id, e),
            }
        }
    }
}

/// Await every loop; a panicked loop is logged and left out.
async fn join_loops(handles: Vec<(String, JoinHandle<DeviceRunSummary>)>) -> Vec<DeviceRunSummary> {
    let mut summaries = Vec::with_capacity(handles.len());
    for (device_id, handle) in handles {
        match handle.await {
            Ok(summary) => summaries.push(summary),
            Err(e) => error!("Invocation loop for {} failed: {}", device_id, e),
        }
    }
    summaries
}
