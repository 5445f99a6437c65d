//! Run status machine and the snapshot readers see.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Launching,
    InitialSetup,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether the machine allows moving from `self` to `next`.
    ///
    /// A finished run can be started again, which goes back through `Launching`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle | Completed | Failed, Launching)
                | (Launching, InitialSetup | Stopping | Failed)
                | (InitialSetup, Running | Stopping | Failed)
                | (Running, Paused | Stopping | Failed)
                | (Paused, Running | Stopping | Failed)
                | (Stopping, Completed | Failed)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Launching => "launching",
            RunStatus::InitialSetup => "initial_setup",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Copy of the run state handed to readers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    /// 1-based index of the input being tested, 0 before the first
    pub current_input_index: usize,
    pub total_inputs: usize,
    pub crash_count: u32,
    pub cpu_sample: f64,
    pub mem_sample: f64,
    pub last_verdict: Option<Verdict>,
    pub pid: Option<u32>,
}

/// Live state, written only by the worker
#[derive(Debug, Default)]
pub(crate) struct RunState {
    status: RunStatus,
    current_input_index: usize,
    total_inputs: usize,
    crash_count: u32,
    cpu_sample: f64,
    mem_sample: f64,
    last_verdict: Option<Verdict>,
    pid: Option<u32>,
}

impl RunState {
    pub(crate) fn new(total_inputs: usize) -> Self {
        Self {
            total_inputs,
            ..Default::default()
        }
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.status
    }

    pub(crate) fn transition(&mut self, to: RunStatus) -> Result<RunStatus, IllegalTransition> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { from, to });
        }
        self.status = to;
        Ok(from)
    }

    pub(crate) fn begin_input(&mut self, index: usize) {
        debug_assert!(index >= self.current_input_index);
        self.current_input_index = self.current_input_index.max(index);
    }

    pub(crate) fn record_sample(&mut self, cpu: f64, mem: f64, verdict: Verdict) {
        self.cpu_sample = cpu;
        self.mem_sample = mem;
        self.last_verdict = Some(verdict);
        if verdict.is_crash() {
            self.crash_count += 1;
        }
    }

    pub(crate) fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub(crate) fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    pub(crate) fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            status: self.status,
            current_input_index: self.current_input_index,
            total_inputs: self.total_inputs,
            crash_count: self.crash_count,
            cpu_sample: self.cpu_sample,
            mem_sample: self.mem_sample,
            last_verdict: self.last_verdict,
            pid: self.pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    const ALL: [RunStatus; 8] = [
        Idle,
        Launching,
        InitialSetup,
        Running,
        Paused,
        Stopping,
        Completed,
        Failed,
    ];

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Idle, Launching, InitialSetup, Running, Paused, Running, Stopping, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Launching));
        assert!(!Paused.can_transition_to(InitialSetup));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Failed));
        for status in ALL {
            assert!(!status.can_transition_to(status), "self loop on {}", status);
        }
    }

    #[test]
    fn test_every_active_status_can_fail() {
        for status in [Launching, InitialSetup, Running, Paused, Stopping] {
            assert!(status.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_state_counts_only_crash_verdicts() {
        let mut state = RunState::new(3);
        state.transition(Launching).unwrap();
        state.record_sample(1.0, 2.0, Verdict::None);
        state.record_sample(99.0, 2.0, Verdict::CpuSpike);
        state.record_sample(0.0, 0.0, Verdict::ProcessTerminated);
        let snap = state.snapshot();
        assert_eq!(snap.crash_count, 2);
        assert_eq!(snap.last_verdict, Some(Verdict::ProcessTerminated));
        assert_eq!(snap.status, Launching);

        let err = state.transition(Completed).unwrap_err();
        assert_eq!(err, IllegalTransition { from: Launching, to: Completed });
        assert_eq!(state.status(), Launching);
    }
}
