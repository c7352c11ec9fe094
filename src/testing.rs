//! Scripted backend double shared by unit tests

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::TestBackend;
use crate::error::{BackendError, BackendResult};
use crate::models::{
    CollectResult, ConfigEntry, HcaRecord, PrecheckPayload, ProbeSnapshot, RawReport,
    RunOutcome, TestConfig, ValidationReport,
};

/// Backend whose answers are set up front; every call is recorded by name
pub struct ScriptedBackend {
    pub precheck: Mutex<BackendResult<PrecheckPayload>>,
    pub run: Mutex<BackendResult<RunOutcome>>,
    /// Consumed front to back; the last entry repeats forever
    pub probes: Mutex<VecDeque<BackendResult<ProbeSnapshot>>>,
    pub collect: Mutex<BackendResult<CollectResult>>,
    pub report: Mutex<BackendResult<RawReport>>,
    pub calls: Mutex<Vec<String>>,
    /// Calls that stall for a while before answering, unless cancelled
    pub delays: Mutex<BTreeMap<String, Duration>>,
    /// Call that cancels the run's token as it returns
    pub cancel_after: Mutex<Option<String>>,
}

impl ScriptedBackend {
    /// Every stage succeeds; the report is a fullmesh run with 400 Gbps over 4 clients
    pub fn happy() -> Self {
        Self {
            precheck: Mutex::new(Ok(PrecheckPayload { records: healthy_records(4) })),
            run: Mutex::new(Ok(RunOutcome {
                success: true,
                message: "Test scripts distributed and started successfully".to_string(),
                error: None,
            })),
            probes: Mutex::new(VecDeque::from(vec![Ok(snapshot(true, 0))])),
            collect: Mutex::new(Ok(CollectResult {
                success: true,
                message: "Report collection completed from 2 hosts".to_string(),
                collected_file_counts: [("c1".to_string(), 2), ("s1".to_string(), 2)].into_iter().collect(),
                error: None,
            })),
            report: Mutex::new(Ok(traditional_report())),
            calls: Mutex::new(Vec::new()),
            delays: Mutex::new(BTreeMap::new()),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_probes(&self, probes: Vec<BackendResult<ProbeSnapshot>>) {
        *self.probes.lock().unwrap() = probes.into();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    pub fn delay(&self, op: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(op.to_string(), delay);
    }

    pub fn cancel_after(&self, op: &str) {
        *self.cancel_after.lock().unwrap() = Some(op.to_string());
    }

    async fn record(&self, op: &str, cancel: &CancellationToken) -> BackendResult<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.cancel_after.lock().unwrap().as_deref() == Some(op) {
            cancel.cancel();
        }
        Ok(())
    }
}

pub fn hca(host: &str, dev: &str, speed: &str, healthy: bool) -> HcaRecord {
    HcaRecord {
        hostname: host.to_string(),
        device_id: dev.to_string(),
        physical_state: "LinkUp".to_string(),
        logical_state: if healthy { "ACTIVE" } else { "DOWN" }.to_string(),
        speed: speed.to_string(),
        firmware_version: "28.39.1002".to_string(),
        board_id: "MT_0000000838".to_string(),
        is_healthy: healthy,
        error: None,
    }
}

pub fn healthy_records(n: usize) -> Vec<HcaRecord> {
    (0..n)
        .map(|i| hca(&format!("node-{}", i), "mlx5_0", "200 Gb/sec", true))
        .collect()
}

pub fn snapshot(all_completed: bool, error_hosts: u32) -> ProbeSnapshot {
    ProbeSnapshot {
        timestamp: "2025-01-01 10:00:00".to_string(),
        running_hosts: if all_completed { 0 } else { 1 },
        completed_hosts: if all_completed { 2 } else { 1 },
        error_hosts,
        total_processes: if all_completed { 0 } else { 8 },
        all_completed,
        per_host: Vec::new(),
    }
}

pub fn traditional_report() -> RawReport {
    serde_json::from_value(json!({
        "stream_type": "fullmesh",
        "total_server_bw": 400.0,
        "client_count": 4,
        "client_data": {
            "c1": { "mlx5_0": { "actual_bw": 98.0 }, "mlx5_1": { "actual_bw": 97.5 } },
            "c2": { "mlx5_0": { "actual_bw": 99.1 }, "mlx5_1": { "actual_bw": 96.0 } }
        },
        "server_data": {
            "s1": { "mlx5_0": { "rx_bw": 195.0 }, "mlx5_1": { "rx_bw": 196.0 } }
        }
    }))
    .unwrap()
}

pub fn p2p_report() -> RawReport {
    serde_json::from_value(json!({
        "stream_type": "p2p",
        "p2p_data": {
            "node-b": { "mlx5_0": { "avg_speed": 190.0, "count": 1 } },
            "node-a": { "mlx5_0": { "avg_speed": 180.0, "count": 1 } }
        }
    }))
    .unwrap()
}

#[async_trait]
impl TestBackend for ScriptedBackend {
    async fn list_configs(&self, cancel: &CancellationToken) -> BackendResult<Vec<ConfigEntry>> {
        self.record("list_configs", cancel).await?;
        Ok(vec![ConfigEntry { name: "config.yaml".to_string(), is_default: true, is_deletable: false }])
    }

    async fn get_config(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<TestConfig> {
        self.record("get_config", cancel).await?;
        Ok(TestConfig(json!({ "stream_type": "fullmesh", "speed": 400.0 })))
    }

    async fn validate_config(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<ValidationReport> {
        self.record("validate_config", cancel).await?;
        Ok(ValidationReport { valid: true, errors: Vec::new() })
    }

    async fn precheck(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<PrecheckPayload> {
        self.record("precheck", cancel).await?;
        self.precheck.lock().unwrap().clone()
    }

    async fn run(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<RunOutcome> {
        self.record("run", cancel).await?;
        self.run.lock().unwrap().clone()
    }

    async fn probe(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<ProbeSnapshot> {
        self.record("probe", cancel).await?;
        let mut probes = self.probes.lock().unwrap();
        if probes.len() > 1 {
            probes.pop_front().unwrap_or_else(|| Err(BackendError::transport("no probe scripted")))
        } else {
            probes.front().cloned().unwrap_or_else(|| Err(BackendError::transport("no probe scripted")))
        }
    }

    async fn collect(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<CollectResult> {
        self.record("collect", cancel).await?;
        self.collect.lock().unwrap().clone()
    }

    async fn report(&self, _name: &str, cancel: &CancellationToken) -> BackendResult<RawReport> {
        self.record("report", cancel).await?;
        self.report.lock().unwrap().clone()
    }
}
