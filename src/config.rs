//! # Run Configuration
//!
//! Loads the run file (YAML or JSON) and validates it into a strongly typed
//! [`InvocationSpec`] plus the [`DeviceQuery`] naming the devices to exercise.
//!
//! The file carries a single `method-invocation-spec` section:
//!
//! ```yaml
//! method-invocation-spec:
//!   device-type: method-invocation-test-device
//!   method-name: echo
//!   invocation-interval: 100
//!   sleep-msec-in-method: 10
//!   test-loop-count: 50
//!   data-size-of-payload: 256
//!   data-size-of-response: 128
//!   response-timeout: 5000
//! ```
//!
//! Numeric fields accept either numbers or numeric strings. Every field is
//! checked at load time; the first problem is reported with the offending
//! field name and nothing is run.

use crate::fleet::DeviceQuery;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read run file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse run file: {0}")]
    Parse(String),

    #[error("unsupported run file {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("missing section `method-invocation-spec`")]
    MissingSection,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be a non-negative integer, got `{value}`")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("no devices selected: set `device-id` or `device-type`")]
    NoDeviceTarget,
}

/// Immutable parameters of one benchmark run
///
/// Built once before any device loop starts and shared read-only (behind an
/// `Arc`) by all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationSpec {
    /// Remote procedure to invoke
    pub method_name: String,

    /// Number of synthetic payload characters sent with each call
    pub payload_size: usize,

    /// Size of the echo response requested from devices
    pub response_data_size: usize,

    /// Calls per device
    pub iteration_count: usize,

    /// Pause between successive calls on the same device
    pub interval_ms: u64,

    /// Per-call timeout handed to the transport; 0 selects the default
    pub call_timeout_ms: u64,

    /// Artificial device-side delay subtracted from every measured latency
    pub wait_in_method_ms: u64,

    /// Optional module addressed on each device
    pub module_id: Option<String>,
}

impl InvocationSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Effective per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        if self.call_timeout_ms == 0 {
            crate::defaults::CALL_TIMEOUT
        } else {
            Duration::from_millis(self.call_timeout_ms)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.method_name.trim().is_empty() {
            return Err(ConfigError::EmptyField("method-name"));
        }
        if matches!(self.module_id.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err(ConfigError::EmptyField("module-id"));
        }
        Ok(())
    }
}

/// A validated run file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub spec: InvocationSpec,
    pub target: DeviceQuery,
}

impl RunConfig {
    /// Load a run file, picking the parser from the file extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let document: RunDocument =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        document.into_config()
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let document: RunDocument =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        document.into_config()
    }
}

#[derive(Debug, Deserialize)]
struct RunDocument {
    #[serde(rename = "method-invocation-spec")]
    spec: Option<RawInvocationSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawInvocationSpec {
    device_id: Option<Vec<String>>,
    device_type: Option<String>,
    method_name: Option<String>,
    invocation_interval: Option<RawNumber>,
    sleep_msec_in_method: Option<RawNumber>,
    test_loop_count: Option<RawNumber>,
    data_size_of_payload: Option<RawNumber>,
    data_size_of_response: Option<RawNumber>,
    response_timeout: Option<RawNumber>,
    module_id: Option<String>,
}

/// Numeric field as written in the file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Integer(i64),
    Float(f64),
    Text(String),
    Flag(bool),
}

impl RawNumber {
    fn to_u64(&self, field: &'static str) -> Result<u64, ConfigError> {
        let invalid = |value: String| ConfigError::InvalidNumber { field, value };
        match self {
            RawNumber::Integer(n) => u64::try_from(*n).map_err(|_| invalid(n.to_string())),
            RawNumber::Text(s) => s.trim().parse::<u64>().map_err(|_| invalid(s.clone())),
            RawNumber::Float(f) => Err(invalid(f.to_string())),
            RawNumber::Flag(b) => Err(invalid(b.to_string())),
        }
    }
}

fn required_u64(value: &Option<RawNumber>, field: &'static str) -> Result<u64, ConfigError> {
    value
        .as_ref()
        .ok_or(ConfigError::MissingField(field))?
        .to_u64(field)
}

fn required_usize(value: &Option<RawNumber>, field: &'static str) -> Result<usize, ConfigError> {
    let n = required_u64(value, field)?;
    usize::try_from(n).map_err(|_| ConfigError::InvalidNumber {
        field,
        value: n.to_string(),
    })
}

impl RunDocument {
    fn into_config(self) -> Result<RunConfig, ConfigError> {
        let raw = self.spec.ok_or(ConfigError::MissingSection)?;

        let method_name = raw
            .method_name
            .clone()
            .ok_or(ConfigError::MissingField("method-name"))?;

        let spec = InvocationSpec {
            method_name,
            payload_size: required_usize(&raw.data_size_of_payload, "data-size-of-payload")?,
            response_data_size: required_usize(
                &raw.data_size_of_response,
                "data-size-of-response",
            )?,
            iteration_count: required_usize(&raw.test_loop_count, "test-loop-count")?,
            interval_ms: required_u64(&raw.invocation_interval, "invocation-interval")?,
            call_timeout_ms: required_u64(&raw.response_timeout, "response-timeout")?,
            wait_in_method_ms: required_u64(&raw.sleep_msec_in_method, "sleep-msec-in-method")?,
            module_id: raw.module_id.clone(),
        };
        spec.validate()?;

        // An explicit id list wins over a type filter.
        let target = match (raw.device_id, raw.device_type) {
            (Some(ids), _) if !ids.is_empty() => {
                if ids.iter().any(|id| id.trim().is_empty()) {
                    return Err(ConfigError::EmptyField("device-id"));
                }
                DeviceQuery::Ids(ids)
            }
            (_, Some(device_type)) if !device_type.trim().is_empty() => {
                DeviceQuery::DeviceType(device_type)
            }
            _ => return Err(ConfigError::NoDeviceTarget),
        };

        Ok(RunConfig { spec, target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_YAML: &str = r#"
method-invocation-spec:
  device-id:
    - device-a
    - device-b
  method-name: echo
  invocation-interval: "100"
  sleep-msec-in-method: 10
  test-loop-count: 50
  data-size-of-payload: 256
  data-size-of-response: "128"
  response-timeout: 5000
  module-id: method-module
"#;

    #[test]
    fn test_yaml_with_mixed_number_forms() {
        let config = RunConfig::from_yaml_str(FULL_YAML).unwrap();
        assert_eq!(
            config.target,
            DeviceQuery::Ids(vec!["device-a".into(), "device-b".into()])
        );
        let spec = config.spec;
        assert_eq!(spec.method_name, "echo");
        assert_eq!(spec.interval_ms, 100);
        assert_eq!(spec.wait_in_method_ms, 10);
        assert_eq!(spec.iteration_count, 50);
        assert_eq!(spec.payload_size, 256);
        assert_eq!(spec.response_data_size, 128);
        assert_eq!(spec.call_timeout_ms, 5000);
        assert_eq!(spec.module_id.as_deref(), Some("method-module"));
    }

    #[test]
    fn test_json_with_device_type() {
        let json = r#"{
            "method-invocation-spec": {
                "device-type": "method-invocation-test-device",
                "method-name": "echo",
                "invocation-interval": 0,
                "sleep-msec-in-method": 0,
                "test-loop-count": 3,
                "data-size-of-payload": 5,
                "data-size-of-response": 0,
                "response-timeout": 1000
            }
        }"#;
        let config = RunConfig::from_json_str(json).unwrap();
        assert_eq!(
            config.target,
            DeviceQuery::DeviceType("method-invocation-test-device".into())
        );
        assert_eq!(config.spec.module_id, None);
    }

    #[test]
    fn test_missing_field_is_named() {
        let yaml = FULL_YAML.replace("  test-loop-count: 50\n", "");
        match RunConfig::from_yaml_str(&yaml) {
            Err(ConfigError::MissingField(field)) => assert_eq!(field, "test-loop-count"),
            other => panic!("expected missing field error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_value_is_rejected() {
        let yaml = FULL_YAML.replace("response-timeout: 5000", "response-timeout: soon");
        match RunConfig::from_yaml_str(&yaml) {
            Err(ConfigError::InvalidNumber { field, value }) => {
                assert_eq!(field, "response-timeout");
                assert_eq!(value, "soon");
            }
            other => panic!("expected invalid number error, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_value_is_rejected() {
        let yaml = FULL_YAML.replace("test-loop-count: 50", "test-loop-count: -1");
        assert!(matches!(
            RunConfig::from_yaml_str(&yaml),
            Err(ConfigError::InvalidNumber {
                field: "test-loop-count",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_section_and_target() {
        assert!(matches!(
            RunConfig::from_yaml_str("other: 1\n"),
            Err(ConfigError::MissingSection)
        ));

        let yaml = FULL_YAML.replace("  device-id:\n    - device-a\n    - device-b\n", "");
        assert!(matches!(
            RunConfig::from_yaml_str(&yaml),
            Err(ConfigError::NoDeviceTarget)
        ));
    }

    #[test]
    fn test_empty_method_name_is_rejected() {
        let yaml = FULL_YAML.replace("method-name: echo", "method-name: \"\"");
        assert!(matches!(
            RunConfig::from_yaml_str(&yaml),
            Err(ConfigError::EmptyField("method-name"))
        ));
    }

    #[test]
    fn test_zero_timeout_selects_default() {
        let mut spec = RunConfig::from_yaml_str(FULL_YAML).unwrap().spec;
        assert_eq!(spec.call_timeout(), Duration::from_millis(5000));
        spec.call_timeout_ms = 0;
        assert_eq!(spec.call_timeout(), crate::defaults::CALL_TIMEOUT);
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("run.yaml");
        std::fs::File::create(&yaml_path)
            .unwrap()
            .write_all(FULL_YAML.as_bytes())
            .unwrap();
        assert_eq!(RunConfig::load(&yaml_path).unwrap().spec.iteration_count, 50);

        let txt_path = dir.path().join("run.txt");
        std::fs::write(&txt_path, FULL_YAML).unwrap();
        assert!(matches!(
            RunConfig::load(&txt_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            RunConfig::load(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
