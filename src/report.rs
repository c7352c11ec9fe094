//! Bandwidth report aggregation
//!
//! Turns raw per-device measurements into verdicts against a theoretical
//! baseline. Two shapes exist: the client/server summary used by fullmesh,
//! incast and localtest runs, and the per-pair summary used by p2p runs.

use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use crate::models::{DeviceMap, RawReport};

/// Largest |delta %| still reported as OK
pub const DELTA_PERCENT_LIMIT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BandwidthStatus {
    Ok,
    Fail,
}

impl BandwidthStatus {
    pub fn from_delta_percent(delta_percent: f64) -> Self {
        if delta_percent.abs() > DELTA_PERCENT_LIMIT {
            BandwidthStatus::Fail
        } else {
            BandwidthStatus::Ok
        }
    }
}

/// One device's measured bandwidth against its baseline.
///
/// Fields are private so `status` can only ever come from `delta_percent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthRecord {
    hostname: String,
    device: String,
    actual_bandwidth: f64,
    theoretical_bandwidth: f64,
    delta: f64,
    delta_percent: f64,
    status: BandwidthStatus,
}

impl BandwidthRecord {
    pub fn new(
        hostname: impl Into<String>,
        device: impl Into<String>,
        actual: f64,
        theoretical: f64,
    ) -> Result<Self, ReportError> {
        let hostname = hostname.into();
        let device = device.into();
        if !actual.is_finite() || actual < 0.0 {
            return Err(ReportError::InvalidInput(format!(
                "{}/{}: actual bandwidth {} is not a valid measurement",
                hostname, device, actual
            )));
        }
        if !theoretical.is_finite() || theoretical <= 0.0 {
            return Err(ReportError::InvalidInput(format!(
                "{}/{}: theoretical bandwidth must be positive, got {}",
                hostname, device, theoretical
            )));
        }

        let delta = actual - theoretical;
        let delta_percent = delta / theoretical * 100.0;

        Ok(Self {
            hostname,
            device,
            actual_bandwidth: actual,
            theoretical_bandwidth: theoretical,
            delta,
            delta_percent,
            status: BandwidthStatus::from_delta_percent(delta_percent),
        })
    }

    pub fn hostname(&self) -> &str { &self.hostname }
    pub fn device(&self) -> &str { &self.device }
    pub fn actual_bandwidth(&self) -> f64 { self.actual_bandwidth }
    pub fn theoretical_bandwidth(&self) -> f64 { self.theoretical_bandwidth }
    pub fn delta(&self) -> f64 { self.delta }
    pub fn delta_percent(&self) -> f64 { self.delta_percent }
    pub fn status(&self) -> BandwidthStatus { self.status }
}

/// Client/server report: TX per client device, RX per server device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub client_records: Vec<BandwidthRecord>,
    pub server_records: Vec<BandwidthRecord>,
    pub total_server_bandwidth: f64,
    pub client_count: u32,
    pub theoretical_bandwidth_per_client: f64,
    pub failed_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct P2PPair {
    pub hostname: String,
    pub device: String,
    pub average_speed: f64,
    pub connection_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct P2PReportSummary {
    pub pairs: Vec<P2PPair>,
    pub total_pairs: u32,
    pub average_speed_across_pairs: f64,
}

/// Aggregated report, shaped by the run's stream topology
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Report {
    Traditional(ReportSummary),
    PeerToPeer(P2PReportSummary),
}

/// Pick the aggregator matching the report's stream type
pub fn aggregate(raw: &RawReport) -> Result<Report, ReportError> {
    if raw.stream_type.is_peer_to_peer() {
        aggregate_p2p(raw).map(Report::PeerToPeer)
    } else {
        aggregate_traditional(raw).map(Report::Traditional)
    }
}

/// Client baseline is `total_server_bw / client_count`; a server device's
/// baseline is its share of `total_server_bw`, i.e. the configured port speed.
pub fn aggregate_traditional(raw: &RawReport) -> Result<ReportSummary, ReportError> {
    if raw.client_count == 0 {
        return Err(ReportError::InvalidInput(
            "client count is zero, cannot derive per-client bandwidth".to_string(),
        ));
    }
    if !raw.total_server_bw.is_finite() || raw.total_server_bw <= 0.0 {
        return Err(ReportError::InvalidInput(format!(
            "total server bandwidth must be positive, got {}",
            raw.total_server_bw
        )));
    }

    let per_client = raw.total_server_bw / raw.client_count as f64;

    let client_records = build_records(&raw.client_data, |m| m.actual_bw, per_client)?;

    let server_devices = device_count(&raw.server_data);
    let server_records = if server_devices == 0 {
        Vec::new()
    } else {
        let per_server_device = raw.total_server_bw / server_devices as f64;
        build_records(&raw.server_data, |m| m.rx_bw, per_server_device)?
    };

    let failed_count = client_records
        .iter()
        .chain(server_records.iter())
        .filter(|r| r.status() == BandwidthStatus::Fail)
        .count() as u32;

    Ok(ReportSummary {
        client_records,
        server_records,
        total_server_bandwidth: raw.total_server_bw,
        client_count: raw.client_count,
        theoretical_bandwidth_per_client: per_client,
        failed_count,
    })
}

pub fn aggregate_p2p(raw: &RawReport) -> Result<P2PReportSummary, ReportError> {
    let mut pairs = Vec::new();
    for (hostname, devices) in &raw.p2p_data {
        for (device, m) in devices {
            if m.count == 0 {
                return Err(ReportError::InvalidInput(format!(
                    "{}/{}: pair reported with zero connections",
                    hostname, device
                )));
            }
            if !m.avg_speed.is_finite() {
                return Err(ReportError::InvalidInput(format!(
                    "{}/{}: average speed is not a number",
                    hostname, device
                )));
            }
            pairs.push(P2PPair {
                hostname: hostname.clone(),
                device: device.clone(),
                average_speed: m.avg_speed,
                connection_count: m.count,
            });
        }
    }

    // DeviceMap iterates in key order already; the sort keeps the contract explicit
    pairs.sort_by(|a, b| a.hostname.cmp(&b.hostname).then_with(|| a.device.cmp(&b.device)));

    let total_pairs = pairs.len() as u32;
    let average_speed_across_pairs = if pairs.is_empty() {
        0.0
    } else {
        pairs.iter().map(|p| p.average_speed).sum::<f64>() / pairs.len() as f64
    };

    Ok(P2PReportSummary {
        pairs,
        total_pairs,
        average_speed_across_pairs,
    })
}

fn device_count<T>(data: &DeviceMap<T>) -> usize {
    data.values().map(|devices| devices.len()).sum()
}

fn build_records<T>(
    data: &DeviceMap<T>,
    actual: impl Fn(&T) -> f64,
    theoretical: f64,
) -> Result<Vec<BandwidthRecord>, ReportError> {
    let mut records = Vec::with_capacity(device_count(data));
    for (hostname, devices) in data {
        for (device, m) in devices {
            records.push(BandwidthRecord::new(hostname, device, actual(m), theoretical)?);
        }
    }
    Ok(records)
}
