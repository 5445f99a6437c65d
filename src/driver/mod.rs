//! Input-device drivers.
//!
//! A [`DeviceDriver`] performs exactly one primitive per call. The executor
//! owns sequencing, pacing and failure policy; drivers only report whether a
//! primitive worked.
//!
//! - [`VirtualScreen`]: in-memory framebuffer that records every event
//! - [`TerminalDriver`]: talks to a target running inside a pseudo-terminal

mod matching;
mod terminal;
mod virtual_screen;
pub mod vt100;

pub use matching::{find_template, load_template};
pub use terminal::{Console, TerminalDriver, key_sequence};
pub use virtual_screen::{EventLog, InputEvent, VirtualScreen};

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::sequence::{MouseButton, Rgb};

/// Errors raised by a single driver primitive
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no terminal attached to the driver")]
    NotAttached,

    #[error("coordinates ({x}, {y}) are outside the screen")]
    OutOfBounds { x: i32, y: i32 },

    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("cannot load template {}: {message}", path.display())]
    Template { path: PathBuf, message: String },

    #[error("script '{reference}' failed: {message}")]
    Script { reference: String, message: String },

    #[error("{0}")]
    Device(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Narrow capability the executor drives actions through
pub trait DeviceDriver: Send {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DriverResult<()>;

    fn double_click(&mut self, x: i32, y: i32) -> DriverResult<()>;

    fn drag(&mut self, from: (i32, i32), to: (i32, i32)) -> DriverResult<()>;

    fn move_to(&mut self, x: i32, y: i32) -> DriverResult<()>;

    fn key_press(&mut self, key: &str) -> DriverResult<()>;

    /// Press `keys` together; modifiers come first
    fn key_combo(&mut self, keys: &[String]) -> DriverResult<()>;

    fn type_text(&mut self, text: &str) -> DriverResult<()>;

    fn wait(&mut self, duration: Duration) -> DriverResult<()>;

    /// Observed colour at a screen coordinate
    fn pixel(&mut self, x: i32, y: i32) -> DriverResult<Rgb>;

    /// Centre of the best match for the template at `path`, if any
    fn locate_image(&mut self, path: &Path, confidence: f64) -> DriverResult<Option<(i32, i32)>>;

    fn run_script(&mut self, reference: &str) -> DriverResult<()>;

    /// PNG-encoded screen contents, when the driver can capture them
    fn screenshot(&mut self) -> DriverResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Hand over the console of a freshly launched target
    fn attach(&mut self, _console: Option<Console>) {}
}

impl<D: DeviceDriver + ?Sized> DeviceDriver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DriverResult<()> {
        (**self).click(x, y, button)
    }
    fn double_click(&mut self, x: i32, y: i32) -> DriverResult<()> {
        (**self).double_click(x, y)
    }
    fn drag(&mut self, from: (i32, i32), to: (i32, i32)) -> DriverResult<()> {
        (**self).drag(from, to)
    }
    fn move_to(&mut self, x: i32, y: i32) -> DriverResult<()> {
        (**self).move_to(x, y)
    }
    fn key_press(&mut self, key: &str) -> DriverResult<()> {
        (**self).key_press(key)
    }
    fn key_combo(&mut self, keys: &[String]) -> DriverResult<()> {
        (**self).key_combo(keys)
    }
    fn type_text(&mut self, text: &str) -> DriverResult<()> {
        (**self).type_text(text)
    }
    fn wait(&mut self, duration: Duration) -> DriverResult<()> {
        (**self).wait(duration)
    }
    fn pixel(&mut self, x: i32, y: i32) -> DriverResult<Rgb> {
        (**self).pixel(x, y)
    }
    fn locate_image(&mut self, path: &Path, confidence: f64) -> DriverResult<Option<(i32, i32)>> {
        (**self).locate_image(path, confidence)
    }
    fn run_script(&mut self, reference: &str) -> DriverResult<()> {
        (**self).run_script(reference)
    }
    fn screenshot(&mut self) -> DriverResult<Option<Vec<u8>>> {
        (**self).screenshot()
    }
    fn attach(&mut self, console: Option<Console>) {
        (**self).attach(console)
    }
}

/// Run `reference` through the platform shell and wait up to `timeout`
pub fn run_shell_script(reference: &str, timeout: Duration) -> DriverResult<()> {
    let script_error = |message: String| DriverError::Script {
        reference: reference.to_string(),
        message,
    };

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(reference);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(reference);
        c
    };
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| script_error(format!("spawn failed: {}", e)))?;

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            debug!(reference, ?status, "Script finished");
            return if status.success() {
                Ok(())
            } else {
                Err(script_error(format!("exited with {}", status)))
            };
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(script_error(format!("timed out after {:?}", timeout)));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_shell_script_status() {
        assert!(run_shell_script("true", Duration::from_secs(5)).is_ok());
        match run_shell_script("exit 3", Duration::from_secs(5)) {
            Err(DriverError::Script { message, .. }) => assert!(message.contains('3')),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_shell_script_timeout() {
        let err = run_shell_script("sleep 5", Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
