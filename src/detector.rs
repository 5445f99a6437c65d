//! Crash classification from a resource sample.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::supervisor::ResourceSample;

/// Outcome of one health check; anything but `None` counts as a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    None,
    ProcessTerminated,
    ZombieProcess,
    AccessError,
    CpuSpike,
    MemoryLeak,
}

impl Verdict {
    pub fn is_crash(&self) -> bool {
        *self != Verdict::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::None => "none",
            Verdict::ProcessTerminated => "process_terminated",
            Verdict::ZombieProcess => "zombie_process",
            Verdict::AccessError => "access_error",
            Verdict::CpuSpike => "cpu_spike",
            Verdict::MemoryLeak => "memory_leak",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds the detector compares samples against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl From<&RunConfig> for Thresholds {
    fn from(config: &RunConfig) -> Self {
        Self {
            cpu_percent: config.cpu_threshold_percent,
            memory_percent: config.memory_threshold_percent,
        }
    }
}

/// Classify a sample. The first matching rule wins:
/// not alive, zombie, query failure, CPU above threshold, memory above threshold.
pub fn evaluate(sample: &ResourceSample, thresholds: &Thresholds) -> Verdict {
    if !sample.alive {
        Verdict::ProcessTerminated
    } else if sample.zombie {
        Verdict::ZombieProcess
    } else if sample.query_failed {
        Verdict::AccessError
    } else if sample.cpu_percent > thresholds.cpu_percent {
        Verdict::CpuSpike
    } else if sample.memory_percent > thresholds.memory_percent {
        Verdict::MemoryLeak
    } else {
        Verdict::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Thresholds = Thresholds {
        cpu_percent: 90.0,
        memory_percent: 80.0,
    };

    fn sample(alive: bool, zombie: bool, query_failed: bool, cpu: f64, mem: f64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_percent: mem,
            alive,
            zombie,
            query_failed,
        }
    }

    #[test]
    fn test_healthy_sample() {
        assert_eq!(evaluate(&sample(true, false, false, 90.0, 80.0), &LIMITS), Verdict::None);
        assert!(!Verdict::None.is_crash());
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        assert_eq!(evaluate(&sample(true, false, false, 90.1, 0.0), &LIMITS), Verdict::CpuSpike);
        assert_eq!(evaluate(&sample(true, false, false, 0.0, 80.5), &LIMITS), Verdict::MemoryLeak);
    }

    #[test]
    fn test_precedence_over_all_flag_combinations() {
        for bits in 0u8..32 {
            let alive = bits & 1 != 0;
            let zombie = bits & 2 != 0;
            let denied = bits & 4 != 0;
            let cpu = if bits & 8 != 0 { 100.0 } else { 1.0 };
            let mem = if bits & 16 != 0 { 100.0 } else { 1.0 };
            let expected = if !alive {
                Verdict::ProcessTerminated
            } else if zombie {
                Verdict::ZombieProcess
            } else if denied {
                Verdict::AccessError
            } else if cpu > 90.0 {
                Verdict::CpuSpike
            } else if mem > 80.0 {
                Verdict::MemoryLeak
            } else {
                Verdict::None
            };
            let s = sample(alive, zombie, denied, cpu, mem);
            assert_eq!(evaluate(&s, &LIMITS), expected, "sample {:?}", s);
            // pure: same input, same answer
            assert_eq!(evaluate(&s, &LIMITS), evaluate(&s, &LIMITS));
        }
    }

    #[test]
    fn test_thresholds_from_config() {
        let config = RunConfig::default().cpu_threshold(50.0).memory_threshold(60.0);
        let thresholds = Thresholds::from(&config);
        assert_eq!(thresholds.cpu_percent, 50.0);
        assert_eq!(evaluate(&ResourceSample::running(55.0, 10.0), &thresholds), Verdict::CpuSpike);
    }
}
