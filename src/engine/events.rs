use super::state::RunStatus;
use super::stats::{CrashRecord, SessionStats};
use crate::detector::Verdict;

/// Progress notifications sent by the worker
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusChanged { from: RunStatus, to: RunStatus },
    TargetLaunched { pid: u32 },
    InputTested { index: usize, input: String, verdict: Verdict },
    ReplayFailed { index: usize, input: String, error: String },
    CrashDetected(CrashRecord),
    Finished(SessionStats),
}
