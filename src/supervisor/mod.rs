//! Target process supervision.
//!
//! The supervisor owns at most one live [`ProcessHandle`]. Launch, termination
//! and sampling are all bounded in time.

mod platform;
mod sample;

pub use platform::{LaunchCommand, PlatformProfile};
pub use sample::{CpuTracker, ProcStat, ResourceSample, parse_mem_total, parse_ps_line, sample_pid};

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{Child as PtyChild, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_LAUNCH_CHECK;
use crate::driver::Console;

const EXIT_POLL: Duration = Duration::from_millis(25);
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("target {} does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("{} is not a valid application bundle: {reason}", path.display())]
    InvalidBundle { path: PathBuf, reason: String },

    #[error("{} is not executable: {reason}", path.display())]
    NotExecutable { path: PathBuf, reason: String },

    #[error("target is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("target exited during startup ({status})")]
    ExitedEarly { status: String },
}

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to launch and how
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub profile: PlatformProfile,
    /// Launch inside a pseudo-terminal of this size (cols, rows)
    pub terminal: Option<(u16, u16)>,
}

impl TargetSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            profile: PlatformProfile::current(),
            terminal: None,
        }
    }

    pub fn profile(mut self, profile: PlatformProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn terminal(mut self, cols: u16, rows: u16) -> Self {
        self.terminal = Some((cols, rows));
        self
    }
}

enum ChildProcess {
    Plain(Child),
    Pty {
        child: Box<dyn PtyChild + Send + Sync>,
        // closing the master hangs up the terminal
        _master: Box<dyn MasterPty + Send>,
    },
}

/// Exactly one OS process, owned by the supervisor
pub struct ProcessHandle {
    pid: u32,
    started: Instant,
    child: ChildProcess,
    console: Option<Console>,
    cpu: CpuTracker,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("uptime", &self.started.elapsed())
            .field("terminal", &self.console.is_some())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// `Some(description)` once the process has exited
    pub fn try_exit(&mut self) -> std::io::Result<Option<String>> {
        match &mut self.child {
            ChildProcess::Plain(child) => Ok(child.try_wait()?.map(|s| s.to_string())),
            ChildProcess::Pty { child, .. } => {
                Ok(child.try_wait()?.map(|s| format!("exit code {}", s.exit_code())))
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    pub fn take_console(&mut self) -> Option<Console> {
        self.console.take()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match &mut self.child {
            ChildProcess::Plain(child) => child.kill(),
            ChildProcess::Pty { child, .. } => child.kill(),
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) -> Result<(), TerminationError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // pid 0 would signal our own process group
        let Some(pid) = usable_pid(Some(self.pid)) else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TerminationError::Signal {
                pid: self.pid,
                message: e.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) -> Result<(), TerminationError> {
        Ok(())
    }

    /// Poll until exit or `timeout`; true when the process is gone
    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_exit() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => {
                    debug!(pid = self.pid, "try_wait failed: {}", e);
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Current resource usage; never fails
    pub fn sample(&mut self) -> ResourceSample {
        match self.try_exit() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "Target has exited");
                ResourceSample::exited()
            }
            Ok(None) => sample_pid(self.pid, &mut self.cpu),
            Err(e) => {
                debug!(pid = self.pid, "try_wait failed: {}", e);
                ResourceSample::denied()
            }
        }
    }

    /// Ask the process to exit, then force it after `timeout`.
    ///
    /// A process that survives the kill is logged, not reported as an error.
    pub fn terminate(&mut self, timeout: Duration) -> Result<(), TerminationError> {
        if !self.is_alive() {
            return Ok(());
        }
        self.request_exit()?;
        if self.wait_exit(timeout) {
            info!(pid = self.pid, "Target terminated");
            return Ok(());
        }

        warn!(pid = self.pid, ?timeout, "Target ignored termination request, killing");
        if let Err(e) = self.kill() {
            debug!(pid = self.pid, "kill failed: {}", e);
        }
        if !self.wait_exit(KILL_GRACE) {
            warn!(pid = self.pid, "Target still alive after kill");
        }
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.kill();
            let _ = self.wait_exit(KILL_GRACE);
        }
    }
}

/// Engine-facing process lifecycle
pub trait Supervise: Send {
    fn verify_target(&self, target: &TargetSpec) -> Result<(), LaunchError> {
        target.profile.verify(&target.path)
    }

    /// Start the target; fails while a previous instance is still alive
    fn launch(&mut self, target: &TargetSpec) -> Result<u32, LaunchError>;

    /// Stop the current target, if any
    fn terminate(&mut self, timeout: Duration) -> Result<(), TerminationError>;

    /// Sample the current target; a missing target reads as not alive
    fn sample(&mut self) -> ResourceSample;

    fn is_running(&mut self) -> bool;

    fn pid(&self) -> Option<u32>;

    /// Terminal of the current target when it was launched in one
    fn take_console(&mut self) -> Option<Console> {
        None
    }
}

/// Real OS processes
pub struct ProcessSupervisor {
    launch_check: Duration,
    handle: Option<ProcessHandle>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            launch_check: DEFAULT_LAUNCH_CHECK,
            handle: None,
        }
    }

    /// How long a new process must survive to count as started
    pub fn launch_check(mut self, window: Duration) -> Self {
        self.launch_check = window;
        self
    }

    /// Spawn `target` and confirm it is still alive after `launch_check`
    pub fn spawn(target: &TargetSpec, launch_check: Duration) -> Result<ProcessHandle, LaunchError> {
        let command = target.profile.command(&target.path)?;
        let program = command.program.to_string_lossy().to_string();
        debug!(%program, args = ?command.args, profile = %target.profile, "Spawning target");

        let mut handle = match target.terminal {
            Some((cols, rows)) => spawn_in_pty(&command, &target.args, cols, rows)?,
            None => spawn_plain(&command, &target.args)?,
        };

        thread::sleep(launch_check);
        match handle.try_exit() {
            Ok(Some(status)) => Err(LaunchError::ExitedEarly { status }),
            Ok(None) => {
                info!(pid = handle.pid, target = %target.path.display(), "Target launched");
                Ok(handle)
            }
            Err(e) => Err(LaunchError::Spawn {
                program,
                message: e.to_string(),
            }),
        }
    }
}

fn spawn_plain(command: &LaunchCommand, extra: &[String]) -> Result<ProcessHandle, LaunchError> {
    let child = Command::new(&command.program)
        .args(&command.args)
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| LaunchError::Spawn {
            program: command.program.to_string_lossy().to_string(),
            message: e.to_string(),
        })?;
    let started = Instant::now();
    Ok(ProcessHandle {
        pid: child.id(),
        started,
        child: ChildProcess::Plain(child),
        console: None,
        cpu: CpuTracker::new(started),
    })
}

fn spawn_in_pty(
    command: &LaunchCommand,
    extra: &[String],
    cols: u16,
    rows: u16,
) -> Result<ProcessHandle, LaunchError> {
    let program = command.program.to_string_lossy().to_string();
    let pty_error = |what: &str, e: &dyn std::fmt::Display| LaunchError::Spawn {
        program: program.clone(),
        message: format!("{}: {}", what, e),
    };

    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| pty_error("failed to open PTY", &e))?;

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.args(&command.args);
    cmd.args(extra);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLUMNS", cols.to_string());
    cmd.env("LINES", rows.to_string());
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| pty_error("failed to spawn", &e))?;
    drop(pair.slave);
    let Some(pid) = usable_pid(child.process_id()) else {
        let _ = child.kill();
        return Err(LaunchError::Spawn {
            program: program.clone(),
            message: "PTY child reported no process id".into(),
        });
    };

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_error("failed to clone PTY reader", &e))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| pty_error("failed to take PTY writer", &e))?;

    let started = Instant::now();
    Ok(ProcessHandle {
        pid,
        started,
        child: ChildProcess::Pty {
            child,
            _master: pair.master,
        },
        console: Some(Console::new(writer, reader, cols, rows)),
        cpu: CpuTracker::new(started),
    })
}

impl Supervise for ProcessSupervisor {
    fn launch(&mut self, target: &TargetSpec) -> Result<u32, LaunchError> {
        if let Some(handle) = self.handle.as_mut() {
            if handle.is_alive() {
                return Err(LaunchError::AlreadyRunning { pid: handle.pid });
            }
        }
        self.handle = None;
        let handle = Self::spawn(target, self.launch_check)?;
        let pid = handle.pid;
        self.handle = Some(handle);
        Ok(pid)
    }

    fn terminate(&mut self, timeout: Duration) -> Result<(), TerminationError> {
        match self.handle.take() {
            Some(mut handle) => handle.terminate(timeout),
            None => Ok(()),
        }
    }

    fn sample(&mut self) -> ResourceSample {
        self.handle
            .as_mut()
            .map_or_else(ResourceSample::exited, ProcessHandle::sample)
    }

    fn is_running(&mut self) -> bool {
        self.handle.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    fn take_console(&mut self) -> Option<Console> {
        self.handle.as_mut().and_then(ProcessHandle::take_console)
    }
}

/// Verify `path` under `profile` without launching it
pub fn verify_target(path: &Path, profile: PlatformProfile) -> Result<(), LaunchError> {
    profile.verify(path)
}

/// Process ids the supervisor may track and signal
fn usable_pid(pid: Option<u32>) -> Option<u32> {
    pid.filter(|&pid| pid > 0 && pid <= i32::MAX as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_or_zero_pid_is_unusable() {
        assert_eq!(usable_pid(None), None);
        assert_eq!(usable_pid(Some(0)), None);
        assert_eq!(usable_pid(Some(u32::MAX)), None);
        assert_eq!(usable_pid(Some(4242)), Some(4242));
    }
}
