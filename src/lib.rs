//! desk-fuzz - replay scripted input sequences against desktop and terminal
//! applications and watch the target for crashes.
//!
//! This crate provides:
//! - A validating parser for action sequences and sequence files
//! - Device drivers: an in-memory [`VirtualScreen`] and a PTY-backed [`TerminalDriver`]
//! - Process supervision with per-platform launch strategies and resource sampling
//! - A crash detector that turns resource samples into verdicts
//! - [`FuzzEngine`], which runs a corpus through the target on a worker thread
//! - Session directories with a run log, crash bundles and `stats.json`
//!
//! # Example
//!
//! ```rust,no_run
//! use desk_fuzz::{FuzzEngine, FuzzJob, ProcessSupervisor, SequenceFile, TargetSpec, TerminalDriver};
//! use desk_fuzz::engine::CorpusSource;
//!
//! let sequences = SequenceFile::load("sequence.json").unwrap();
//! let job = FuzzJob::new(
//!     TargetSpec::new("./my-tui").terminal(100, 30),
//!     sequences.main_sequence,
//!     CorpusSource::File("inputs.txt".into()),
//! )
//! .initial_setup(sequences.initial_setup);
//!
//! let mut engine = FuzzEngine::new();
//! engine
//!     .start(job, ProcessSupervisor::new(), TerminalDriver::new(100, 30))
//!     .unwrap();
//! let stats = engine.wait().unwrap();
//! println!("{} inputs, {} crashes", stats.total_inputs, stats.crashes);
//! ```

pub mod config;
pub mod detector;
pub mod driver;
pub mod engine;
pub mod executor;
pub mod sequence;
pub mod session;
pub mod supervisor;

// Re-export sequence types
pub use sequence::{Action, ActionSequence, MouseButton, Rgb, SequenceError, SequenceFile, parse_action, parse_sequence};

// Re-export drivers
pub use driver::{DeviceDriver, DriverError, TerminalDriver, VirtualScreen};

// Re-export supervision and detection
pub use detector::{Thresholds, Verdict, evaluate};
pub use supervisor::{LaunchError, PlatformProfile, ProcessSupervisor, ResourceSample, Supervise, TargetSpec};

// Re-export execution and the engine
pub use engine::{EngineError, EngineEvent, EngineHandle, FuzzEngine, FuzzJob, RunSnapshot, RunStatus, SessionStats, ValidationError};
pub use executor::{CancelToken, Clock, ExecutionError, Replay, SequenceExecutor, SystemClock};

// Re-export configuration and sessions
pub use config::{ConfigError, RunConfig};
pub use session::{Session, cleanup_old_sessions, list_sessions};
