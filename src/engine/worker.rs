//! The run loop, executed on the engine's worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::events::EngineEvent;
use super::journal::LogSink;
use super::state::{IllegalTransition, RunSnapshot, RunState, RunStatus};
use super::stats::{CrashRecord, CrashSnapshot, SessionStats, SystemInfo};
use super::{Command, PreparedJob};
use crate::config::RunConfig;
use crate::detector::{self, Thresholds, Verdict};
use crate::driver::DeviceDriver;
use crate::executor::{CancelToken, Clock, Replay, SequenceExecutor};
use crate::sequence::ActionSequence;
use crate::session::{STATS_FILE, Session};
use crate::supervisor::{LaunchError, ResourceSample, Supervise, TargetSpec};

#[derive(Debug, Error)]
enum RunError {
    #[error("failed to launch target: {0}")]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Channels and shared handles connecting the worker to its controller
pub(crate) struct Links {
    pub commands: Receiver<Command>,
    pub events: Sender<EngineEvent>,
    pub shared: Arc<Mutex<RunSnapshot>>,
    pub cancel: CancelToken,
    pub clock: Arc<dyn Clock>,
}

pub(crate) struct Worker<S, D> {
    target: TargetSpec,
    initial_setup: ActionSequence,
    main_sequence: ActionSequence,
    inputs: Vec<String>,
    config: RunConfig,
    thresholds: Thresholds,
    session: Session,
    log: Box<dyn LogSink>,
    supervisor: S,
    driver: D,
    executor: SequenceExecutor<Arc<dyn Clock>>,
    links: Links,
    state: RunState,
    stats: SessionStats,
    stop_requested: bool,
}

impl<S: Supervise, D: DeviceDriver> Worker<S, D> {
    pub(crate) fn new(job: PreparedJob, supervisor: S, driver: D, links: Links) -> Self {
        let executor = SequenceExecutor::with_clock(job.config.action_delay_duration(), links.clock.clone());
        Self {
            thresholds: Thresholds::from(&job.config),
            state: RunState::new(job.inputs.len()),
            stats: SessionStats::new(Utc::now()),
            target: job.target,
            initial_setup: job.initial_setup,
            main_sequence: job.main_sequence,
            inputs: job.inputs,
            config: job.config,
            session: job.session,
            log: job.log,
            supervisor,
            driver,
            executor,
            links,
            stop_requested: false,
        }
    }

    /// Run to completion; always returns statistics, even after a failure or panic
    pub(crate) fn run(mut self) -> SessionStats {
        info!(
            session = %self.session.id,
            target = %self.target.path.display(),
            inputs = self.inputs.len(),
            driver = self.driver.name(),
            "Fuzzing session started"
        );
        self.log.info(&format!(
            "Session {} started: target {}, {} inputs",
            self.session.id,
            self.target.path.display(),
            self.inputs.len()
        ));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("worker panicked: {}", panic_message(payload.as_ref()))),
        };
        self.finish(failure)
    }

    fn run_loop(&mut self) -> Result<(), RunError> {
        self.set_status(RunStatus::Launching)?;
        self.launch()?;
        if !self.links.clock.pause(self.config.launch_delay_duration(), &self.links.cancel) {
            return Ok(());
        }

        self.set_status(RunStatus::InitialSetup)?;
        if self.run_initial_setup() == Flow::Stop {
            return Ok(());
        }
        self.set_status(RunStatus::Running)?;

        let inputs = std::mem::take(&mut self.inputs);
        let total = inputs.len();
        for (offset, input) in inputs.iter().enumerate() {
            let index = offset + 1;
            if self.await_go()? == Flow::Stop {
                break;
            }
            if self.test_input(index, input)? == Flow::Stop {
                break;
            }
            if index < total && !self.links.clock.pause(self.config.action_delay_duration(), &self.links.cancel) {
                break;
            }
        }
        Ok(())
    }

    fn test_input(&mut self, index: usize, input: &str) -> Result<Flow, RunError> {
        self.state.begin_input(index);
        self.publish();
        self.stats.total_inputs += 1;
        debug!(index, input, "Testing input");
        self.log.info(&format!("Fuzz Input: {} - Status: TESTING", input));

        match self
            .executor
            .replay(&mut self.driver, &self.main_sequence, Some(input), &self.links.cancel)
        {
            Ok(Replay::Completed) => {}
            Ok(Replay::Canceled { at }) => {
                debug!(index, at, "Replay interrupted by stop");
                return Ok(Flow::Stop);
            }
            Err(e) => {
                warn!(index, "Replay failed: {}", e);
                self.stats.replay_failures += 1;
                self.log.warn(&format!("Fuzz Input: {} - Replay failed: {}", input, e));
                self.emit(EngineEvent::ReplayFailed {
                    index,
                    input: input.to_string(),
                    error: e.to_string(),
                });
            }
        }

        let sample = self.supervisor.sample();
        let verdict = detector::evaluate(&sample, &self.thresholds);
        self.stats.record_sample(&sample);
        self.state.record_sample(sample.cpu_percent, sample.memory_percent, verdict);
        self.publish();
        self.emit(EngineEvent::InputTested {
            index,
            input: input.to_string(),
            verdict,
        });

        if !verdict.is_crash() {
            return Ok(Flow::Continue);
        }
        self.record_crash(index, input, &sample, verdict);

        if self.state.crash_count() >= self.config.max_crashes {
            warn!(crashes = self.state.crash_count(), "Crash limit reached");
            self.log
                .warn(&format!("Crash limit of {} reached, stopping", self.config.max_crashes));
            return Ok(Flow::Stop);
        }
        self.relaunch()
    }

    fn record_crash(&mut self, index: usize, input: &str, sample: &ResourceSample, verdict: Verdict) {
        let timestamp = Utc::now();
        error!(index, kind = %verdict, cpu = sample.cpu_percent, mem = sample.memory_percent, "Crash detected");
        self.log
            .error(&format!("Fuzz Input: {} - Status: CRASH DETECTED ({})", input, verdict));

        let screenshot = if self.config.screenshot_on_crash {
            self.driver.screenshot().unwrap_or_else(|e| {
                warn!("Failed to capture screenshot: {}", e);
                None
            })
        } else {
            None
        };

        let snapshot = CrashSnapshot {
            timestamp,
            input: input.to_string(),
            input_index: index,
            crash_kind: verdict,
            sample: *sample,
            initial_setup: self.initial_setup.to_descriptors(),
            main_sequence: self.main_sequence.to_descriptors(),
            system: SystemInfo::collect(self.supervisor.pid()),
        };
        let snapshot_ref = match self.session.write_crash(
            self.state.crash_count(),
            verdict.as_str(),
            &snapshot,
            screenshot.as_deref(),
        ) {
            Ok(dir) => {
                debug!(dir = %dir.display(), "Crash bundle written");
                Some(dir)
            }
            Err(e) => {
                warn!("Failed to write crash bundle: {}", e);
                None
            }
        };

        let record = CrashRecord {
            timestamp,
            input: input.to_string(),
            input_index: index,
            crash_kind: verdict,
            snapshot_ref,
        };
        self.stats.record_crash(record.clone());
        self.emit(EngineEvent::CrashDetected(record));
    }

    fn launch(&mut self) -> Result<(), RunError> {
        let pid = match self.supervisor.launch(&self.target) {
            Ok(pid) => pid,
            Err(e) => {
                self.log.error(&format!("Failed to launch {}: {}", self.target.path.display(), e));
                return Err(e.into());
            }
        };
        self.driver.attach(self.supervisor.take_console());
        self.state.set_pid(Some(pid));
        self.publish();
        self.log.info(&format!("Launched {} (pid {})", self.target.path.display(), pid));
        self.emit(EngineEvent::TargetLaunched { pid });
        Ok(())
    }

    /// Restart after a crash; stays in `Running`
    fn relaunch(&mut self) -> Result<Flow, RunError> {
        info!("Restarting target");
        self.terminate_target();
        self.launch()?;
        if !self.links.clock.pause(self.config.launch_delay_duration(), &self.links.cancel) {
            return Ok(Flow::Stop);
        }
        Ok(self.run_initial_setup())
    }

    fn run_initial_setup(&mut self) -> Flow {
        if self.initial_setup.is_empty() {
            return Flow::Continue;
        }
        match self
            .executor
            .replay(&mut self.driver, &self.initial_setup, None, &self.links.cancel)
        {
            Ok(Replay::Completed) => Flow::Continue,
            Ok(Replay::Canceled { .. }) => Flow::Stop,
            Err(e) => {
                warn!("Initial setup failed: {}", e);
                self.log.warn(&format!("Initial setup failed: {}", e));
                Flow::Continue
            }
        }
    }

    fn terminate_target(&mut self) {
        if let Err(e) = self.supervisor.terminate(self.config.terminate_timeout_duration()) {
            warn!("Failed to terminate target: {}", e);
            self.log.warn(&format!("Failed to terminate target: {}", e));
        }
        self.state.set_pid(None);
    }

    fn finish(mut self, mut failure: Option<String>) -> SessionStats {
        if failure.is_none() {
            if let Err(e) = self.set_status(RunStatus::Stopping) {
                failure = Some(e.to_string());
            }
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.terminate_target())) {
            let reason = format!("target teardown panicked: {}", panic_message(payload.as_ref()));
            failure.get_or_insert(reason);
            self.state.set_pid(None);
        }

        let final_status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if let Some(reason) = &failure {
            error!("Fuzzing run failed: {}", reason);
            self.log.error(&format!("Run failed: {}", reason));
        }
        self.stats.finish(final_status, failure);
        if let Err(e) = self.session.write_json(STATS_FILE, &self.stats) {
            warn!("Failed to write statistics: {}", e);
        }
        if let Err(e) = self.set_status(final_status) {
            error!("{}", e);
        }

        info!(
            status = %final_status,
            inputs = self.stats.total_inputs,
            crashes = self.stats.crashes,
            "Fuzzing session ended"
        );
        self.log.info(&format!(
            "Session ended: {}, {} inputs tested, {} crashes",
            final_status, self.stats.total_inputs, self.stats.crashes
        ));
        if let Err(e) = self.log.close() {
            warn!("Failed to close session log: {}", e);
        }
        self.emit(EngineEvent::Finished(self.stats.clone()));
        self.stats
    }

    /// Apply queued commands and block while paused
    fn await_go(&mut self) -> Result<Flow, IllegalTransition> {
        loop {
            match self.links.commands.try_recv() {
                Ok(command) => self.apply(command)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stop_requested = true;
                    break;
                }
            }
        }

        let poll = self.config.poll_interval_duration();
        while self.state.status() == RunStatus::Paused && !self.should_stop() {
            match self.links.commands.recv_timeout(poll) {
                Ok(command) => self.apply(command)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.stop_requested = true,
            }
        }

        Ok(if self.should_stop() { Flow::Stop } else { Flow::Continue })
    }

    fn apply(&mut self, command: Command) -> Result<(), IllegalTransition> {
        match (command, self.state.status()) {
            (Command::Pause, RunStatus::Running) => {
                self.set_status(RunStatus::Paused)?;
                self.log.info("Fuzzing paused");
            }
            (Command::Resume, RunStatus::Paused) => {
                self.set_status(RunStatus::Running)?;
                self.log.info("Fuzzing resumed");
            }
            (Command::Stop, _) => {
                self.stop_requested = true;
                self.log.info("Stop requested");
            }
            (command, status) => debug!(?command, %status, "Ignoring command"),
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop_requested || self.links.cancel.is_canceled()
    }

    fn set_status(&mut self, to: RunStatus) -> Result<(), IllegalTransition> {
        let from = self.state.transition(to)?;
        debug!(%from, %to, "Status changed");
        self.publish();
        self.emit(EngineEvent::StatusChanged { from, to });
        Ok(())
    }

    fn publish(&self) {
        *self.links.shared.lock() = self.state.snapshot();
    }

    fn emit(&self, event: EngineEvent) {
        // nobody listening is fine
        let _ = self.links.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

