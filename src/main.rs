//! # Method Benchmark - Main Entry Point
//!
//! Runs the direct-method benchmark or hosts a simulated device fleet.
//!
//! ## Invoke Mode
//!
//! 1. **Initialize logging**: Colorized diagnostics on stderr, optional file
//! 2. **Load the run file**: Validated into an `InvocationSpec` and a device target
//! 3. **Resolve devices**: Explicit ids, or a device-type query against the directory
//! 4. **Push configuration**: Schedule the device-side settings and poll the job
//! 5. **Run**: One loop per device; Ctrl-C or Enter stops the run early
//! 6. **Report**: Summary to the record sink, optional JSON report file
//!
//! ## Device Mode
//!
//! Serves a simulated fleet over TCP so that `--transport tcp` runs have a
//! broker to talk to. Stops on Ctrl-C.
//!
//! ## Error Handling
//!
//! Configuration problems and runs with no resolvable or reachable devices
//! end the process with an error. Individual call failures never do; they
//! are part of the statistics.

use anyhow::{Context, Result};
use clap::Parser;
use method_bench::{
    benchmark::{BenchmarkOrchestrator, RunError},
    cancel::CancellationSignal,
    cli::{Args, RunMode, TransportKind},
    config::RunConfig,
    device::SimulatedFleet,
    fleet::{
        resolve_devices, wait_for_job, ConfigurationPush, DesiredSettings, DeviceDirectory,
        DeviceQuery, FleetError,
    },
    logging::init_logging,
    results::{ResultsManager, RunOutcome},
    sink::LogWriter,
    transport::{serve_fleet, TcpBrokerClient, TransportFactory},
    VERSION,
};
use std::io::BufRead;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so the file layer flushes on exit.
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting Method Benchmark {} ({} mode)", VERSION, args.mode);
    debug!("Configuration: {:?}", args);

    match args.mode {
        RunMode::Invoke => run_invoke(&args).await,
        RunMode::Device => run_device(&args).await,
    }
}

/// Resolve on Ctrl-C, or when a line is entered on stdin.
///
/// End of input on stdin is not a stop request, so the benchmark can run
/// with stdin closed.
async fn operator_stop() {
    let (enter_tx, enter_rx) = oneshot::channel::<()>();
    std::thread::spawn(move || {
        let mut line = String::new();
        if let Ok(n) = std::io::stdin().lock().read_line(&mut line) {
            if n > 0 {
                let _ = enter_tx.send(());
            }
        }
    });

    let enter = async {
        if enter_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = enter => info!("Stop requested from the console"),
    }
}

async fn run_invoke(args: &Args) -> Result<()> {
    let path = args
        .config
        .as_deref()
        .context("--config is required in invoke mode")?;
    let run = RunConfig::load(path).with_context(|| format!("invalid run file {}", path.display()))?;
    info!("Loaded run file {:?}: target {}", path, run.target);

    let (directory, push, factory): (
        Arc<dyn DeviceDirectory>,
        Arc<dyn ConfigurationPush>,
        TransportFactory,
    ) = match args.transport {
        TransportKind::Loopback => {
            let fleet = Arc::new(SimulatedFleet::for_target(
                &run.target,
                args.simulated_devices,
                run.spec.module_id.as_deref(),
            ));
            (
                fleet.clone() as Arc<dyn DeviceDirectory>,
                fleet.clone() as Arc<dyn ConfigurationPush>,
                TransportFactory::Loopback(fleet),
            )
        }
        TransportKind::Tcp => {
            let config = args.transport_config();
            let client = Arc::new(TcpBrokerClient::new(config.address()));
            (
                client.clone() as Arc<dyn DeviceDirectory>,
                client as Arc<dyn ConfigurationPush>,
                TransportFactory::Tcp(config),
            )
        }
    };

    let stop = CancellationSignal::new();
    let stop_trigger = stop.clone();
    tokio::spawn(async move {
        operator_stop().await;
        stop_trigger.cancel();
    });

    let devices = resolve_devices(directory.as_ref(), &run.target)
        .await
        .with_context(|| format!("failed to resolve devices for {}", run.target))?;
    if devices.is_empty() {
        error!("No devices match {}", run.target);
        return Err(RunError::NoDevicesResolved.into());
    }
    info!("Resolved {} device(s)", devices.len());

    if args.skip_config_push {
        info!("Skipping configuration push");
    } else {
        push_configuration(push.as_ref(), &run, args, &stop).await?;
        if stop.is_cancelled() {
            warn!("Stopped before the first invocation; nothing was measured");
            return Ok(());
        }
    }

    let sink = Arc::new(LogWriter::open(
        args.log.as_deref(),
        args.append_log,
        args.console_output(),
    ));
    let orchestrator = BenchmarkOrchestrator::new(run.spec.clone(), sink);
    let report = orchestrator
        .run(&devices, &factory, stop.cancelled())
        .await?;

    if let Some(output_file) = &args.output_file {
        ResultsManager::new(output_file).write_report(&report)?;
    }

    if report.outcome == RunOutcome::NoDevicesAvailable {
        return Err(RunError::NoDevicesAvailable {
            requested: report.devices_requested,
        }
        .into());
    }
    Ok(())
}

/// Push the device-side settings and wait for the job to settle.
///
/// A failed or timed-out job is logged and the run goes ahead with whatever
/// settings the devices already have.
async fn push_configuration(
    push: &dyn ConfigurationPush,
    run: &RunConfig,
    args: &Args,
    stop: &CancellationSignal,
) -> Result<()> {
    let settings = DesiredSettings::from(&run.spec);
    let job_id = push
        .schedule_update(&run.target, settings)
        .await
        .context("failed to schedule the configuration push")?;
    info!(
        "Pushing sleep-time={} response-data-length={} to {} (job {})",
        settings.sleep_time_ms, settings.response_data_length, run.target, job_id
    );

    match wait_for_job(
        push,
        &job_id,
        args.job_poll_interval,
        args.job_timeout,
        stop,
    )
    .await
    {
        Ok(status) => debug!("Configuration job {} ended {}", job_id, status),
        Err(FleetError::Cancelled(_)) => info!("Configuration push interrupted"),
        Err(e) => warn!("{}; continuing with current device settings", e),
    }
    Ok(())
}

async fn run_device(args: &Args) -> Result<()> {
    let fleet = match &args.config {
        Some(path) => {
            let run = RunConfig::load(path)
                .with_context(|| format!("invalid run file {}", path.display()))?;
            SimulatedFleet::for_target(
                &run.target,
                args.simulated_devices,
                run.spec.module_id.as_deref(),
            )
        }
        None => SimulatedFleet::for_target(
            &DeviceQuery::DeviceType(method_bench::defaults::DEVICE_TYPE.to_string()),
            args.simulated_devices,
            None,
        ),
    };

    let address = args.transport_config().address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;

    let cancel = CancellationSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received, stopping broker");
        trigger.cancel();
    });

    serve_fleet(listener, Arc::new(fleet), cancel)
        .await
        .context("broker failed")
}
