//! Hardware consistency checks
//!
//! Builds frequency maps over HCA attributes and flags the values that stand
//! out from the rest of the fleet. Everything here is pure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::HcaRecord;

/// Number of records carrying each distinct attribute value
pub type FrequencyMap = BTreeMap<String, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyClass {
    /// Value held by the largest group
    Dominant,
    /// Value held by the smallest group, when groups differ in size
    Outlier,
    Neutral,
}

/// Count occurrences of every non-empty value
pub fn frequency_map<'a, I>(values: I) -> FrequencyMap
where
    I: IntoIterator<Item = &'a str>,
{
    let mut map = FrequencyMap::new();
    for value in values.into_iter().filter(|v| !v.is_empty()) {
        *map.entry(value.to_string()).or_insert(0) += 1;
    }
    map
}

/// Classify `value` against a frequency map.
///
/// A single-valued map never produces an outlier. Values that are absent from
/// the map (empty attributes, for example) are neutral.
pub fn classify(value: &str, freq: &FrequencyMap) -> FrequencyClass {
    let Some(&count) = freq.get(value) else {
        return FrequencyClass::Neutral;
    };
    let max = freq.values().copied().max().unwrap_or(0);
    let min = freq.values().copied().min().unwrap_or(0);

    if count == min && min < max {
        FrequencyClass::Outlier
    } else if count == max {
        FrequencyClass::Dominant
    } else {
        FrequencyClass::Neutral
    }
}

/// Classify every distinct value of one attribute in one pass
pub fn classify_by_frequency<'a, I>(values: I) -> BTreeMap<String, FrequencyClass>
where
    I: IntoIterator<Item = &'a str>,
{
    let freq = frequency_map(values);
    freq.keys()
        .map(|v| (v.clone(), classify(v, &freq)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordVerdict {
    pub hostname: String,
    pub device: String,
    pub speed: FrequencyClass,
    pub firmware: FrequencyClass,
    pub board_id: FrequencyClass,
}

/// Fleet-wide precheck verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecheckSummary {
    pub total_devices: u32,
    pub healthy_count: u32,
    pub unhealthy_count: u32,
    pub error_count: u32,
    pub all_speeds_equal: bool,
    pub speed_frequency: FrequencyMap,
    pub firmware_frequency: FrequencyMap,
    pub board_id_frequency: FrequencyMap,
    pub check_passed: bool,
    pub records: Vec<HcaRecord>,
    pub verdicts: Vec<RecordVerdict>,
}

impl PrecheckSummary {
    /// Short human-readable description of why the check did not pass
    pub fn findings(&self) -> Vec<String> {
        let mut findings = Vec::new();
        if self.error_count > 0 {
            findings.push(format!("{} device(s) could not be queried", self.error_count));
        }
        if self.unhealthy_count > 0 {
            findings.push(format!("{} device(s) unhealthy", self.unhealthy_count));
        }
        if !self.all_speeds_equal {
            if self.speed_frequency.is_empty() {
                findings.push("no link speed reported".to_string());
            } else {
                let speeds: Vec<String> = self.speed_frequency
                    .iter()
                    .map(|(speed, n)| format!("{} x{}", speed, n))
                    .collect();
                findings.push(format!("mixed link speeds: {}", speeds.join(", ")));
            }
        }
        findings
    }
}

/// Aggregate precheck records into a summary.
///
/// Records are sorted by hostname then device. A record with an error counts
/// only toward `error_count`.
pub fn summarize(mut records: Vec<HcaRecord>) -> PrecheckSummary {
    records.sort_by(|a, b| {
        a.hostname.cmp(&b.hostname).then_with(|| a.device_id.cmp(&b.device_id))
    });

    let mut healthy_count = 0;
    let mut unhealthy_count = 0;
    let mut error_count = 0;
    for record in &records {
        if record.error.is_some() {
            error_count += 1;
        } else if record.is_healthy {
            healthy_count += 1;
        } else {
            unhealthy_count += 1;
        }
    }

    let speed_frequency = frequency_map(records.iter().map(|r| r.speed.as_str()));
    let firmware_frequency = frequency_map(records.iter().map(|r| r.firmware_version.as_str()));
    let board_id_frequency = frequency_map(records.iter().map(|r| r.board_id.as_str()));

    let verdicts = records
        .iter()
        .map(|r| RecordVerdict {
            hostname: r.hostname.clone(),
            device: r.device_id.clone(),
            speed: classify(&r.speed, &speed_frequency),
            firmware: classify(&r.firmware_version, &firmware_frequency),
            board_id: classify(&r.board_id, &board_id_frequency),
        })
        .collect();

    let all_speeds_equal = speed_frequency.len() == 1;
    let check_passed = error_count == 0 && unhealthy_count == 0 && all_speeds_equal;

    PrecheckSummary {
        total_devices: records.len() as u32,
        healthy_count,
        unhealthy_count,
        error_count,
        all_speeds_equal,
        speed_frequency,
        firmware_frequency,
        board_id_frequency,
        check_passed,
        records,
        verdicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, dev: &str, speed: &str, fw: &str, healthy: bool) -> HcaRecord {
        HcaRecord {
            hostname: host.to_string(),
            device_id: dev.to_string(),
            physical_state: "LinkUp".to_string(),
            logical_state: "ACTIVE".to_string(),
            speed: speed.to_string(),
            firmware_version: fw.to_string(),
            board_id: "MT_0000000838".to_string(),
            is_healthy: healthy,
            error: None,
        }
    }

    #[test]
    fn test_outlier_and_dominant_speed() {
        let mut values = vec!["200G"; 8];
        values.push("100G");
        let classes = classify_by_frequency(values.iter().copied());
        assert_eq!(classes["200G"], FrequencyClass::Dominant);
        assert_eq!(classes["100G"], FrequencyClass::Outlier);
    }

    #[test]
    fn test_single_value_has_no_outlier() {
        let classes = classify_by_frequency(["28.39", "28.39", "28.39"]);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes["28.39"], FrequencyClass::Dominant);
    }

    #[test]
    fn test_middle_count_is_neutral() {
        let freq: FrequencyMap = [("a", 5), ("b", 3), ("c", 1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(classify("a", &freq), FrequencyClass::Dominant);
        assert_eq!(classify("b", &freq), FrequencyClass::Neutral);
        assert_eq!(classify("c", &freq), FrequencyClass::Outlier);
        assert_eq!(classify("missing", &freq), FrequencyClass::Neutral);
    }

    #[test]
    fn test_equal_groups_are_all_dominant() {
        let classes = classify_by_frequency(["x", "y", "x", "y"]);
        assert!(classes.values().all(|c| *c == FrequencyClass::Dominant));
    }

    #[test]
    fn test_empty_values_not_counted() {
        let freq = frequency_map(["", "200G", ""]);
        assert_eq!(freq.len(), 1);
        assert_eq!(freq["200G"], 1);
    }

    #[test]
    fn test_summary_mixed_speeds_fails_check() {
        let mut records: Vec<HcaRecord> = (0..8)
            .map(|i| record(&format!("node-{}", i), "mlx5_0", "200G", "28.39", true))
            .collect();
        records.push(record("node-9", "mlx5_0", "100G", "28.39", true));

        let summary = summarize(records);
        assert_eq!(summary.total_devices, 9);
        assert!(!summary.all_speeds_equal);
        assert!(!summary.check_passed);
        let outlier = summary.verdicts.iter().find(|v| v.hostname == "node-9").unwrap();
        assert_eq!(outlier.speed, FrequencyClass::Outlier);
        assert_eq!(outlier.firmware, FrequencyClass::Dominant);
    }

    #[test]
    fn test_summary_counts_error_records_separately() {
        let mut broken = record("node-2", "mlx5_1", "", "", false);
        broken.error = Some("ssh: connect refused".to_string());
        let records = vec![
            record("node-1", "mlx5_0", "200G", "28.39", true),
            record("node-1", "mlx5_1", "200G", "28.39", false),
            broken,
        ];

        let summary = summarize(records);
        assert_eq!(summary.healthy_count, 1);
        assert_eq!(summary.unhealthy_count, 1);
        assert_eq!(summary.error_count, 1);
        assert!(summary.all_speeds_equal);
        assert!(!summary.check_passed);
        assert_eq!(summary.findings().len(), 2);
    }

    #[test]
    fn test_summary_sorts_records() {
        let records = vec![
            record("node-b", "mlx5_0", "200G", "28.39", true),
            record("node-a", "mlx5_1", "200G", "28.39", true),
            record("node-a", "mlx5_0", "200G", "28.39", true),
        ];
        let summary = summarize(records);
        let order: Vec<(&str, &str)> = summary.records
            .iter()
            .map(|r| (r.hostname.as_str(), r.device_id.as_str()))
            .collect();
        assert_eq!(order, vec![("node-a", "mlx5_0"), ("node-a", "mlx5_1"), ("node-b", "mlx5_0")]);
        assert!(summary.check_passed);
    }

    #[test]
    fn test_summary_is_deterministic() {
        let records = vec![
            record("node-1", "mlx5_0", "200G", "28.39", true),
            record("node-2", "mlx5_0", "100G", "28.40", true),
        ];
        assert_eq!(summarize(records.clone()), summarize(records));
    }

    #[test]
    fn test_empty_fleet_does_not_pass() {
        let summary = summarize(Vec::new());
        assert!(!summary.all_speeds_equal);
        assert!(!summary.check_passed);
        assert_eq!(summary.findings(), vec!["no link speed reported".to_string()]);
    }
}
