//! Data model shared by the backend client, the aggregators and the workflow
//!
//! Field names on the wire follow the backend's snake_case JSON.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// ============ Configs ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_deletable: bool,
}

/// Stream topology of a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Fullmesh,
    Incast,
    P2p,
    Localtest,
}

impl StreamType {
    pub fn is_peer_to_peer(self) -> bool {
        matches!(self, StreamType::P2p)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Fullmesh => write!(f, "fullmesh"),
            StreamType::Incast => write!(f, "incast"),
            StreamType::P2p => write!(f, "p2p"),
            StreamType::Localtest => write!(f, "localtest"),
        }
    }
}

/// Full test configuration as stored by the backend
///
/// Only the handful of fields the console reads are typed; the rest is kept
/// verbatim so `show` can print the whole object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestConfig(pub serde_json::Value);

impl TestConfig {
    pub fn stream_type(&self) -> StreamType {
        self.0
            .get("stream_type")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Configured link speed in Gbps
    pub fn speed(&self) -> Option<f64> {
        self.0.get("speed").and_then(|s| s.as_f64())
    }

    pub fn server_hosts(&self) -> Vec<String> {
        self.hosts("server")
    }

    pub fn client_hosts(&self) -> Vec<String> {
        self.hosts("client")
    }

    fn hosts(&self, role: &str) -> Vec<String> {
        self.0
            .get(role)
            .and_then(|r| r.get("hostname"))
            .and_then(|h| h.as_array())
            .map(|arr| arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

// ============ Precheck ============

/// State of one HCA as reported by the backend's precheck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HcaRecord {
    pub hostname: String,
    #[serde(rename = "hca")]
    pub device_id: String,
    #[serde(rename = "phys_state", default)]
    pub physical_state: String,
    #[serde(rename = "state", default)]
    pub logical_state: String,
    #[serde(default)]
    pub speed: String,
    #[serde(rename = "fw_ver", default)]
    pub firmware_version: String,
    #[serde(default)]
    pub board_id: String,
    #[serde(default)]
    pub is_healthy: bool,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of the backend's precheck answer; counters are recomputed locally
#[derive(Debug, Clone, Deserialize)]
pub struct PrecheckPayload {
    #[serde(rename = "results", default)]
    pub records: Vec<HcaRecord>,
}

// ============ Run / Probe / Collect ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostProbe {
    pub hostname: String,
    #[serde(default)]
    pub process_count: u32,
    pub status: ProcessStatus,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of the remote test processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub running_hosts: u32,
    #[serde(default)]
    pub completed_hosts: u32,
    #[serde(default)]
    pub error_hosts: u32,
    #[serde(default)]
    pub total_processes: u32,
    #[serde(default)]
    pub all_completed: bool,
    #[serde(rename = "results", default)]
    pub per_host: Vec<HostProbe>,
}

impl ProbeSnapshot {
    pub fn progress_line(&self) -> String {
        format!(
            "running: {}, completed: {}, error: {}",
            self.running_hosts, self.completed_hosts, self.error_hosts
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "collected_files", default)]
    pub collected_file_counts: BTreeMap<String, u32>,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectResult {
    pub fn total_files(&self) -> u32 {
        self.collected_file_counts.values().sum()
    }
}

// ============ Report ============

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientMeasurement {
    pub actual_bw: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerMeasurement {
    pub rx_bw: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PairMeasurement {
    pub avg_speed: f64,
    pub count: u32,
}

/// Raw measurements keyed by hostname then device
pub type DeviceMap<T> = BTreeMap<String, BTreeMap<String, T>>;

/// Body of the backend's report answer, before aggregation
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawReport {
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default)]
    pub total_server_bw: f64,
    #[serde(default)]
    pub client_count: u32,
    #[serde(default)]
    pub client_data: DeviceMap<ClientMeasurement>,
    #[serde(default)]
    pub server_data: DeviceMap<ServerMeasurement>,
    #[serde(default)]
    pub p2p_data: DeviceMap<PairMeasurement>,
}

/// The backend reports missing strings as `""`
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hca_record_empty_error_is_none() {
        let record: HcaRecord = serde_json::from_value(json!({
            "hostname": "node-1",
            "hca": "mlx5_0",
            "phys_state": "LinkUp",
            "state": "ACTIVE",
            "speed": "200 Gb/sec",
            "fw_ver": "28.39.1002",
            "board_id": "MT_0000000838",
            "is_healthy": true,
            "serial_number": "abc",
            "error": ""
        }))
        .unwrap();
        assert_eq!(record.device_id, "mlx5_0");
        assert_eq!(record.error, None);
    }

    #[test]
    fn test_test_config_accessors() {
        let cfg = TestConfig(json!({
            "stream_type": "p2p",
            "speed": 400.0,
            "server": { "hostname": ["s1", "s2"], "hca": ["mlx5_0"] },
            "client": { "hostname": ["c1"], "hca": ["mlx5_0"] }
        }));
        assert_eq!(cfg.stream_type(), StreamType::P2p);
        assert_eq!(cfg.speed(), Some(400.0));
        assert_eq!(cfg.server_hosts(), vec!["s1", "s2"]);
        assert_eq!(cfg.client_hosts(), vec!["c1"]);
    }

    #[test]
    fn test_unknown_stream_type_defaults_to_fullmesh() {
        let cfg = TestConfig(json!({ "stream_type": "ring" }));
        assert_eq!(cfg.stream_type(), StreamType::Fullmesh);
    }

    #[test]
    fn test_probe_snapshot_decodes_host_status() {
        let snap: ProbeSnapshot = serde_json::from_value(json!({
            "timestamp": "2025-01-01 10:00:00",
            "results": [
                { "hostname": "h1", "process_count": 4, "status": "RUNNING" },
                { "hostname": "h2", "process_count": 0, "status": "ERROR", "error": "SSH error" }
            ],
            "running_hosts": 1,
            "completed_hosts": 0,
            "error_hosts": 1,
            "total_processes": 4,
            "all_completed": false
        }))
        .unwrap();
        assert_eq!(snap.per_host[0].status, ProcessStatus::Running);
        assert_eq!(snap.per_host[1].error.as_deref(), Some("SSH error"));
        assert_eq!(snap.progress_line(), "running: 1, completed: 0, error: 1");
    }
}
