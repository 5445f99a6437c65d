//! Fuzzing controller.
//!
//! [`FuzzEngine::start`] validates a [`FuzzJob`] on the calling thread, then
//! hands it to a dedicated worker thread that owns the target process, the
//! driver and the live run state. The controller talks to the worker through a
//! command channel and reads status from a published [`RunSnapshot`].
//!
//! ```no_run
//! use desk_fuzz::{FuzzEngine, FuzzJob, ProcessSupervisor, TargetSpec, VirtualScreen};
//! use desk_fuzz::engine::CorpusSource;
//! use desk_fuzz::sequence::parse_sequence;
//!
//! let job = FuzzJob::new(
//!     TargetSpec::new("/usr/bin/xterm"),
//!     parse_sequence(&["LEFT_CLICK,100,100", "TYPE_TEXT", "ENTER"]).unwrap(),
//!     CorpusSource::File("inputs.txt".into()),
//! );
//! let mut engine = FuzzEngine::new();
//! let events = engine.start(job, ProcessSupervisor::new(), VirtualScreen::new(800, 600)).unwrap();
//! for event in events {
//!     println!("{:?}", event);
//! }
//! let stats = engine.wait().unwrap();
//! println!("{} crashes", stats.crashes);
//! ```

pub mod corpus;
mod events;
pub mod journal;
mod state;
mod stats;
mod worker;

pub use corpus::{Corpus, CorpusError, CorpusSource};
pub use events::EngineEvent;
pub use journal::{FileLog, Level, LogSink, MemoryLog};
pub use state::{IllegalTransition, RunSnapshot, RunStatus};
pub use stats::{CrashRecord, CrashSnapshot, SessionStats, SystemInfo};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{self, ConfigError, RunConfig};
use crate::driver::DeviceDriver;
use crate::executor::{CancelToken, Clock, SystemClock};
use crate::sequence::ActionSequence;
use crate::session::Session;
use crate::supervisor::{LaunchError, Supervise, TargetSpec};
use worker::{Links, Worker};

/// Rejected before anything is launched
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("main sequence is empty")]
    EmptyMainSequence,

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("invalid target: {0}")]
    Target(#[from] LaunchError),

    #[error("invalid run configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot prepare session directory {}: {source}", path.display())]
    Session {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a fuzzing run is already active")]
    AlreadyRunning,

    #[error("no fuzzing run is active")]
    NotRunning,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume,
    Stop,
}

/// Everything one run needs
pub struct FuzzJob {
    pub target: TargetSpec,
    pub initial_setup: ActionSequence,
    pub main_sequence: ActionSequence,
    pub corpus: CorpusSource,
    pub config: RunConfig,
    pub session: Session,
    log: Option<Box<dyn LogSink>>,
}

impl FuzzJob {
    pub fn new(target: TargetSpec, main_sequence: ActionSequence, corpus: CorpusSource) -> Self {
        Self {
            target,
            initial_setup: ActionSequence::default(),
            main_sequence,
            corpus,
            config: config::get().run.clone(),
            session: Session::new(),
            log: None,
        }
    }

    pub fn initial_setup(mut self, sequence: ActionSequence) -> Self {
        self.initial_setup = sequence;
        self
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    /// Send session log lines here instead of `session.log`
    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log = Some(Box::new(sink));
        self
    }

    fn prepare(self, supervisor: &dyn Supervise) -> Result<PreparedJob, ValidationError> {
        self.config.validate()?;
        if self.main_sequence.is_empty() {
            return Err(ValidationError::EmptyMainSequence);
        }
        supervisor.verify_target(&self.target)?;
        let inputs = self.corpus.materialize()?.into_inputs();

        let session_error = |path: PathBuf| move |source: std::io::Error| ValidationError::Session { path, source };
        self.session.init().map_err(session_error(self.session.dir.clone()))?;
        let log = match self.log {
            Some(log) => log,
            None => {
                let path = self.session.log_path();
                Box::new(FileLog::create(&path).map_err(session_error(path))?)
            }
        };

        Ok(PreparedJob {
            target: self.target,
            initial_setup: self.initial_setup,
            main_sequence: self.main_sequence,
            inputs,
            config: self.config,
            session: self.session,
            log,
        })
    }
}

/// A job that passed validation
pub(crate) struct PreparedJob {
    pub target: TargetSpec,
    pub initial_setup: ActionSequence,
    pub main_sequence: ActionSequence,
    pub inputs: Vec<String>,
    pub config: RunConfig,
    pub session: Session,
    pub log: Box<dyn LogSink>,
}

/// Controller for fuzzing runs; one active run at a time
pub struct FuzzEngine {
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<RunSnapshot>>,
    commands: Option<Sender<Command>>,
    cancel: CancelToken,
    worker: Option<JoinHandle<SessionStats>>,
}

impl Default for FuzzEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Engine whose launch and pacing delays go through `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shared: Arc::new(Mutex::new(RunSnapshot::default())),
            commands: None,
            cancel: CancelToken::new(),
            worker: None,
        }
    }

    /// Validate `job` and start it on a worker thread.
    ///
    /// Validation failures leave the engine idle and touch no process.
    pub fn start<S, D>(&mut self, job: FuzzJob, supervisor: S, driver: D) -> Result<Receiver<EngineEvent>, EngineError>
    where
        S: Supervise + 'static,
        D: DeviceDriver + 'static,
    {
        if self.is_active() {
            return Err(EngineError::AlreadyRunning);
        }
        if let Some(previous) = self.worker.take() {
            // finished but never collected
            let _ = previous.join();
        }

        let job = job.prepare(&supervisor)?;
        info!(
            session = %job.session.id,
            dir = %job.session.dir.display(),
            inputs = job.inputs.len(),
            "Starting fuzzing run"
        );

        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        *self.shared.lock() = RunSnapshot {
            total_inputs: job.inputs.len(),
            ..Default::default()
        };

        let links = Links {
            commands: command_rx,
            events: event_tx,
            shared: Arc::clone(&self.shared),
            cancel: cancel.clone(),
            clock: Arc::clone(&self.clock),
        };
        let worker = Worker::new(job, supervisor, driver, links);
        let handle = thread::Builder::new()
            .name("fuzz-worker".into())
            .spawn(move || worker.run())
            .map_err(EngineError::Spawn)?;

        self.commands = Some(command_tx);
        self.cancel = cancel;
        self.worker = Some(handle);
        Ok(event_rx)
    }

    /// Hold before the next corpus input
    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(Command::Resume)
    }

    /// End the run at the next action boundary
    pub fn stop(&self) -> Result<(), EngineError> {
        if !self.is_active() {
            return Err(EngineError::NotRunning);
        }
        self.cancel.cancel();
        self.send(Command::Stop)
    }

    pub fn status(&self) -> RunSnapshot {
        self.shared.lock().clone()
    }

    /// Remote control for the current run, usable from other threads
    pub fn handle(&self) -> Option<EngineHandle> {
        Some(EngineHandle {
            commands: self.commands.clone()?,
            cancel: self.cancel.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Block until the worker ends and collect its statistics
    pub fn wait(&mut self) -> Result<SessionStats, EngineError> {
        let handle = self.worker.take().ok_or(EngineError::NotRunning)?;
        self.commands = None;
        handle.join().map_err(|_| EngineError::WorkerPanicked)
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        if !self.is_active() {
            return Err(EngineError::NotRunning);
        }
        let sender = self.commands.as_ref().ok_or(EngineError::NotRunning)?;
        debug!(?command, "Sending command");
        sender.send(command).map_err(|_| EngineError::NotRunning)
    }
}

impl Drop for FuzzEngine {
    fn drop(&mut self) {
        if self.is_active() {
            self.cancel.cancel();
            if let Some(sender) = &self.commands {
                let _ = sender.send(Command::Stop);
            }
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Cloneable remote control for the active run
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<Command>,
    cancel: CancelToken,
    shared: Arc<Mutex<RunSnapshot>>,
}

impl EngineHandle {
    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(Command::Resume)
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.send(Command::Stop)
    }

    pub fn status(&self) -> RunSnapshot {
        self.shared.lock().clone()
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::NotRunning)
    }
}
