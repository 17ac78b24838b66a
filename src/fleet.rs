//! # Fleet Collaborators
//!
//! Interfaces to the services that surround a benchmark run but are not part
//! of it: the device directory that turns a `device-type` filter into concrete
//! device ids, and the configuration push that distributes the device-side
//! sleep time and response length before the first call is made.
//!
//! Both are traits so the harness can run against an in-process
//! [`SimulatedFleet`](crate::device::SimulatedFleet) or a remote broker
//! reached over TCP.

use crate::cancel::CancellationSignal;
use crate::config::InvocationSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Key under which the benchmark settings live in a desired-properties document.
pub const DESIRED_SECTION: &str = "device-method-test";

/// Identifier of a scheduled configuration job
pub type JobId = String;

/// Selection of devices taking part in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceQuery {
    /// Explicit device identifiers, in run order
    Ids(Vec<String>),
    /// Every device that reports this `device-type`
    DeviceType(String),
}

impl DeviceQuery {
    /// Check whether a device with the given id and reported type is selected.
    pub fn matches(&self, device_id: &str, device_type: Option<&str>) -> bool {
        match self {
            DeviceQuery::Ids(ids) => ids.iter().any(|id| id == device_id),
            DeviceQuery::DeviceType(wanted) => device_type == Some(wanted.as_str()),
        }
    }
}

impl std::fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceQuery::Ids(ids) => write!(f, "DeviceId IN ['{}']", ids.join("','")),
            DeviceQuery::DeviceType(device_type) => {
                write!(f, "properties.reported.device-type = '{}'", device_type)
            }
        }
    }
}

/// Device-side settings pushed before the run starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSettings {
    #[serde(rename = "sleep-time")]
    pub sleep_time_ms: u64,
    #[serde(rename = "response-data-length")]
    pub response_data_length: usize,
}

impl DesiredSettings {
    /// Render the settings as a desired-properties document.
    pub fn to_desired_json(&self) -> serde_json::Value {
        serde_json::json!({ DESIRED_SECTION: self })
    }
}

impl From<&InvocationSpec> for DesiredSettings {
    fn from(spec: &InvocationSpec) -> Self {
        Self {
            sleep_time_ms: spec.wait_in_method_ms,
            response_data_length: spec.response_data_size,
        }
    }
}

/// Lifecycle of a configuration job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("device query failed: {0}")]
    Query(String),

    #[error("failed to schedule configuration job: {0}")]
    Schedule(String),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {job_id} did not reach a terminal state within {timeout:?}")]
    JobTimeout { job_id: JobId, timeout: Duration },

    #[error("stopped while waiting for job {0}")]
    Cancelled(JobId),

    #[error("broker communication failed: {0}")]
    Broker(String),
}

/// Resolves device filters into device identifiers
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn query_devices(&self, query: &DeviceQuery) -> Result<Vec<String>, FleetError>;
}

/// Distributes desired settings to a set of devices as a tracked job
#[async_trait]
pub trait ConfigurationPush: Send + Sync {
    async fn schedule_update(
        &self,
        query: &DeviceQuery,
        settings: DesiredSettings,
    ) -> Result<JobId, FleetError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, FleetError>;
}

/// Turn the run's device target into the ordered list of devices to exercise.
///
/// Explicit ids are used as given (duplicates dropped, first occurrence wins);
/// a type filter is handed to the directory.
pub async fn resolve_devices(
    directory: &dyn DeviceDirectory,
    query: &DeviceQuery,
) -> Result<Vec<String>, FleetError> {
    match query {
        DeviceQuery::Ids(ids) => {
            let mut devices: Vec<String> = Vec::with_capacity(ids.len());
            for id in ids {
                if !devices.contains(id) {
                    devices.push(id.clone());
                }
            }
            Ok(devices)
        }
        DeviceQuery::DeviceType(_) => {
            let devices = directory.query_devices(query).await?;
            debug!("Directory resolved {} device(s) for {}", devices.len(), query);
            Ok(devices)
        }
    }
}

/// Poll a configuration job until it completes or fails.
///
/// Returns the terminal status. A `Failed` job is not an error here; the
/// caller decides whether a run without the pushed settings is acceptable.
pub async fn wait_for_job(
    push: &dyn ConfigurationPush,
    job_id: &str,
    poll_interval: Duration,
    timeout: Duration,
    cancel: &CancellationSignal,
) -> Result<JobStatus, FleetError> {
    let started = Instant::now();
    loop {
        let status = push.job_status(job_id).await?;
        info!("Job {} status: {}", job_id, status);
        if status.is_terminal() {
            if status == JobStatus::Failed {
                warn!("Configuration job {} failed", job_id);
            }
            return Ok(status);
        }

        if started.elapsed() >= timeout {
            return Err(FleetError::JobTimeout {
                job_id: job_id.to_string(),
                timeout,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(FleetError::Cancelled(job_id.to_string())),
            _ = sleep(poll_interval) => {}
        }
    }
}
