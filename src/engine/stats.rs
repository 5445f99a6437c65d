//! Per-run statistics and crash records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::RunStatus;
use crate::detector::Verdict;
use crate::supervisor::ResourceSample;

/// One detected crash; records are append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    pub input: String,
    pub input_index: usize,
    pub crash_kind: Verdict,
    /// Crash bundle directory, when it could be written
    pub snapshot_ref: Option<PathBuf>,
}

/// Reporting handoff, written as `stats.json` when a run ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_inputs: usize,
    pub crashes: u32,
    pub crashes_by_kind: BTreeMap<Verdict, u32>,
    pub per_sample_cpu: Vec<f64>,
    pub per_sample_memory: Vec<f64>,
    pub crash_records: Vec<CrashRecord>,
    pub replay_failures: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub final_status: RunStatus,
    /// Why the run failed, if it did
    pub failure: Option<String>,
}

impl SessionStats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_inputs: 0,
            crashes: 0,
            crashes_by_kind: BTreeMap::new(),
            per_sample_cpu: Vec::new(),
            per_sample_memory: Vec::new(),
            crash_records: Vec::new(),
            replay_failures: 0,
            start_time,
            end_time: None,
            final_status: RunStatus::Idle,
            failure: None,
        }
    }

    pub fn record_sample(&mut self, sample: &ResourceSample) {
        self.per_sample_cpu.push(sample.cpu_percent);
        self.per_sample_memory.push(sample.memory_percent);
    }

    pub fn record_crash(&mut self, record: CrashRecord) {
        self.crashes += 1;
        *self.crashes_by_kind.entry(record.crash_kind).or_insert(0) += 1;
        self.crash_records.push(record);
    }

    pub fn finish(&mut self, status: RunStatus, failure: Option<String>) {
        self.final_status = status;
        self.failure = failure;
        self.end_time = Some(Utc::now());
    }

    /// Wall time of the run so far, or in total once finished
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }

    pub fn peak_cpu(&self) -> f64 {
        self.per_sample_cpu.iter().copied().fold(0.0, f64::max)
    }

    pub fn peak_memory(&self) -> f64 {
        self.per_sample_memory.iter().copied().fold(0.0, f64::max)
    }
}

/// Host details stored with every crash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    /// Pid of the target at the time of the crash
    pub pid: Option<u32>,
}

impl SystemInfo {
    pub fn collect(pid: Option<u32>) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
            pid,
        }
    }
}

/// Contents of `snapshot.json` in a crash bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashSnapshot {
    pub timestamp: DateTime<Utc>,
    pub input: String,
    pub input_index: usize,
    pub crash_kind: Verdict,
    pub sample: ResourceSample,
    pub initial_setup: Vec<String>,
    pub main_sequence: Vec<String>,
    pub system: SystemInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: Verdict, index: usize) -> CrashRecord {
        CrashRecord {
            timestamp: Utc::now(),
            input: format!("input-{}", index),
            input_index: index,
            crash_kind: kind,
            snapshot_ref: None,
        }
    }

    #[test]
    fn test_crash_accounting() {
        let mut stats = SessionStats::new(Utc::now());
        stats.record_crash(record(Verdict::CpuSpike, 1));
        stats.record_crash(record(Verdict::ProcessTerminated, 4));
        stats.record_crash(record(Verdict::CpuSpike, 7));

        assert_eq!(stats.crashes, 3);
        assert_eq!(stats.crash_records.len(), 3);
        assert_eq!(stats.crashes_by_kind[&Verdict::CpuSpike], 2);
        assert_eq!(stats.crashes_by_kind[&Verdict::ProcessTerminated], 1);
        assert!(!stats.crashes_by_kind.contains_key(&Verdict::MemoryLeak));
    }

    #[test]
    fn test_samples_and_peaks() {
        let mut stats = SessionStats::new(Utc::now());
        assert_eq!(stats.peak_cpu(), 0.0);
        stats.record_sample(&ResourceSample::running(12.5, 3.0));
        stats.record_sample(&ResourceSample::running(80.0, 1.0));
        assert_eq!(stats.per_sample_cpu, vec![12.5, 80.0]);
        assert_eq!(stats.peak_cpu(), 80.0);
        assert_eq!(stats.peak_memory(), 3.0);
    }

    #[test]
    fn test_stats_json_shape() {
        let mut stats = SessionStats::new(Utc::now());
        stats.total_inputs = 2;
        stats.record_crash(record(Verdict::MemoryLeak, 2));
        stats.finish(RunStatus::Completed, None);
        assert!(stats.duration() >= chrono::Duration::zero());

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["final_status"], "completed");
        assert_eq!(value["crashes_by_kind"]["memory_leak"], 1);
        assert_eq!(value["crash_records"][0]["crash_kind"], "memory_leak");
        assert!(value["end_time"].is_string());
    }
}
