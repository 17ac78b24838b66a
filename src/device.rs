//! # Simulated Devices
//!
//! Device-side fixture answering direct-method calls: it waits for its
//! configured in-method delay and echoes back a response body of the
//! configured length. Settings are pushed as desired properties and kept per
//! simulator instance, so several fleets (or several tests) never share them.
//!
//! A [`SimulatedFleet`] groups simulators, routes method calls to them and
//! doubles as the device directory and configuration-push collaborator for
//! loopback runs and for the TCP broker in device mode.

use crate::fleet::{
    ConfigurationPush, DesiredSettings, DeviceDirectory, DeviceQuery, FleetError, JobId,
    JobStatus, DESIRED_SECTION,
};
use crate::transport::{MethodRequest, MethodResponse};
use crate::utils::{digit_cycle, format_timestamp};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Per-device behaviour currently in force
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceSettings {
    pub sleep_time_ms: Option<u64>,
    pub response_data_length: Option<usize>,
}

/// One simulated device (or module on a device)
#[derive(Debug)]
pub struct DeviceSimulator {
    device_id: String,
    device_type: String,
    settings: RwLock<DeviceSettings>,
}

impl DeviceSimulator {
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            settings: RwLock::new(DeviceSettings::default()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Reported `device-type` property
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn settings(&self) -> DeviceSettings {
        *self.settings.read()
    }

    /// Apply a desired-properties document.
    ///
    /// Only the benchmark section is read; documents without it leave the
    /// current settings untouched. Returns whether anything changed.
    pub fn apply_desired(&self, desired: &serde_json::Value) -> bool {
        let Some(section) = desired.get(DESIRED_SECTION) else {
            return false;
        };
        let sleep_time_ms = section.get("sleep-time").and_then(|v| v.as_u64());
        let response_data_length = section
            .get("response-data-length")
            .and_then(|v| v.as_u64())
            .and_then(|n| usize::try_from(n).ok());

        let mut settings = self.settings.write();
        let updated = DeviceSettings {
            sleep_time_ms: sleep_time_ms.or(settings.sleep_time_ms),
            response_data_length: response_data_length.or(settings.response_data_length),
        };
        let changed = updated != *settings;
        *settings = updated;
        debug!("{} settings now {:?}", self.device_id, updated);
        changed
    }

    /// Answer one method call.
    pub async fn handle(&self, request: &MethodRequest) -> MethodResponse {
        let settings = self.settings();
        let started = chrono::Local::now();
        debug!(
            "Invocation received - {} on {} at {}",
            request.method_name,
            self.device_id,
            format_timestamp(&started)
        );

        if let Some(ms) = settings.sleep_time_ms {
            sleep(Duration::from_millis(ms)).await;
        }

        let response_data = match settings.response_data_length {
            Some(len) => String::from_utf8_lossy(&digit_cycle(len)).into_owned(),
            None => "invoked".to_string(),
        };
        let finished = chrono::Local::now();

        MethodResponse::json(
            MethodResponse::SUCCESS,
            &serde_json::json!({
                "start-timestamp": started.to_rfc3339(),
                "end-timestamp": finished.to_rfc3339(),
                "response-data": response_data,
            }),
        )
    }
}

type Address = (String, Option<String>);

#[derive(Debug)]
struct JobRecord {
    query: DeviceQuery,
    settings: DesiredSettings,
    status: JobStatus,
    /// Simulators updated when the job ran
    applied: usize,
}

/// Set of simulators addressable by device id and optional module id
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    devices: BTreeMap<Address, DeviceSimulator>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    offline: AtomicBool,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet of `count` devices named `sim-device-000`, `sim-device-001`, ...
    pub fn with_devices(count: usize) -> Self {
        let mut fleet = Self::new();
        for i in 0..count {
            fleet.add_device(format!("sim-device-{:03}", i));
        }
        fleet
    }

    /// Fleet containing exactly the given device ids
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fleet = Self::new();
        for id in ids {
            fleet.add_device(id);
        }
        fleet
    }

    /// Fleet shaped to answer a run target.
    ///
    /// Explicit ids get one simulator each; a device-type filter gets `count`
    /// simulators reporting that type. With a module id every device also
    /// hosts that module.
    pub fn for_target(query: &DeviceQuery, count: usize, module_id: Option<&str>) -> Self {
        let (ids, device_type): (Vec<String>, &str) = match query {
            DeviceQuery::Ids(ids) => (ids.clone(), crate::defaults::DEVICE_TYPE),
            DeviceQuery::DeviceType(device_type) => (
                (0..count).map(|i| format!("sim-device-{:03}", i)).collect(),
                device_type.as_str(),
            ),
        };

        let mut fleet = Self::new();
        for id in ids {
            if let Some(module_id) = module_id {
                fleet.add_simulator(
                    Some(module_id.to_string()),
                    DeviceSimulator::new(id.clone(), device_type),
                );
            }
            fleet.add_simulator(None, DeviceSimulator::new(id, device_type));
        }
        fleet
    }

    /// Register a device reporting the default test device type
    pub fn add_device(&mut self, device_id: impl Into<String>) {
        self.add_simulator(None, DeviceSimulator::new(device_id, crate::defaults::DEVICE_TYPE));
    }

    /// Register a module hosted on `device_id`
    pub fn add_module(&mut self, device_id: impl Into<String>, module_id: impl Into<String>) {
        let device_id = device_id.into();
        self.add_simulator(
            Some(module_id.into()),
            DeviceSimulator::new(device_id, crate::defaults::DEVICE_TYPE),
        );
    }

    pub fn add_simulator(&mut self, module_id: Option<String>, simulator: DeviceSimulator) {
        let address = (simulator.device_id.clone(), module_id);
        self.devices.insert(address, simulator);
    }

    pub fn simulator(&self, device_id: &str, module_id: Option<&str>) -> Option<&DeviceSimulator> {
        self.devices
            .get(&(device_id.to_string(), module_id.map(str::to_string)))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Refuse (or accept again) new transport connections
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::Acquire)
    }

    /// Route a call to its simulator; unknown targets get a 404.
    pub async fn dispatch(&self, request: &MethodRequest) -> MethodResponse {
        match self.simulator(&request.device_id, request.module_id.as_deref()) {
            Some(simulator) => simulator.handle(request).await,
            None => MethodResponse::json(
                MethodResponse::NOT_FOUND,
                &serde_json::json!({
                    "message": format!("device {} is not registered", request.device_id),
                }),
            ),
        }
    }

    fn matching(&self, query: &DeviceQuery) -> impl Iterator<Item = &DeviceSimulator> + '_ {
        let query = query.clone();
        self.devices
            .values()
            .filter(move |sim| query.matches(&sim.device_id, Some(&sim.device_type)))
    }
}

#[async_trait]
impl DeviceDirectory for SimulatedFleet {
    async fn query_devices(&self, query: &DeviceQuery) -> Result<Vec<String>, FleetError> {
        let mut ids: Vec<String> = Vec::new();
        for sim in self.matching(query) {
            if !ids.iter().any(|id| id == &sim.device_id) {
                ids.push(sim.device_id.clone());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ConfigurationPush for SimulatedFleet {
    async fn schedule_update(
        &self,
        query: &DeviceQuery,
        settings: DesiredSettings,
    ) -> Result<JobId, FleetError> {
        let job_id = crate::utils::generate_id();
        info!("Scheduled configuration job {} for {}", job_id, query);
        self.jobs.lock().insert(
            job_id.clone(),
            JobRecord {
                query: query.clone(),
                settings,
                status: JobStatus::Queued,
                applied: 0,
            },
        );
        Ok(job_id)
    }

    /// Jobs advance one state per poll: the first poll applies the settings
    /// and reports `Running`, the next one reports the terminal state. A job
    /// is forgotten once its terminal state has been reported.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, FleetError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| FleetError::UnknownJob(job_id.to_string()))?;

        match job.status {
            JobStatus::Queued => {
                let desired = job.settings.to_desired_json();
                for sim in self.matching(&job.query) {
                    sim.apply_desired(&desired);
                    job.applied += 1;
                }
                job.status = JobStatus::Running;
                debug!("Job {} applied to {} simulator(s)", job_id, job.applied);
            }
            JobStatus::Running => {
                job.status = if job.applied > 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
            }
            _ => {}
        }

        let status = job.status;
        if status.is_terminal() {
            jobs.remove(job_id);
            debug!("Job {} finished {}", job_id, status);
        }
        Ok(status)
    }
}
