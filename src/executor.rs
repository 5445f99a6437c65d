//! Sequence replay against a [`DeviceDriver`].
//!
//! Cancellation is cooperative: it is checked before every action and wakes
//! the pacing sleep between actions, but an action already handed to the
//! driver always runs to completion.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::driver::{DeviceDriver, DriverError};
use crate::sequence::{Action, ActionSequence, Rgb};

/// Shared stop flag that can also interrupt sleeps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep up to `duration`; returns false if canceled first
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut canceled = flag.lock();
        while !*canceled {
            if cvar.wait_until(&mut canceled, deadline).timed_out() {
                return !*canceled;
            }
        }
        false
    }
}

/// Source of pacing delays
pub trait Clock: Send + Sync {
    /// Wait `duration` unless `cancel` trips; false when canceled
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Real time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_canceled();
        }
        cancel.sleep(duration)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        (**self).pause(duration, cancel)
    }
}

/// Why an action failed
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error("pixel at ({x}, {y}) is {observed}, expected {expected} (tolerance {tolerance})")]
    PixelMismatch {
        x: i32,
        y: i32,
        expected: Rgb,
        observed: Rgb,
        tolerance: u8,
    },

    #[error("wait of {seconds}s is not a valid duration")]
    InvalidWait { seconds: f64 },

    #[error("image {path} not found on screen (confidence {confidence})")]
    ImageNotFound { path: String, confidence: f64 },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("action #{index} ({action}) failed: {cause}")]
    ActionFailed {
        index: usize,
        action: Action,
        #[source]
        cause: FailureCause,
    },
}

impl ExecutionError {
    pub fn cause(&self) -> &FailureCause {
        match self {
            ExecutionError::ActionFailed { cause, .. } => cause,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ExecutionError::ActionFailed { index, .. } => *index,
        }
    }
}

/// How a replay ended when no action failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    Completed,
    /// Stopped before dispatching action `at`
    Canceled { at: usize },
}

impl fmt::Display for Replay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replay::Completed => f.write_str("completed"),
            Replay::Canceled { at } => write!(f, "canceled before action #{}", at),
        }
    }
}

/// Replays sequences with pacing between actions
pub struct SequenceExecutor<C: Clock = SystemClock> {
    action_delay: Duration,
    clock: C,
}

impl SequenceExecutor<SystemClock> {
    pub fn new(action_delay: Duration) -> Self {
        Self::with_clock(action_delay, SystemClock)
    }
}

impl<C: Clock> SequenceExecutor<C> {
    pub fn with_clock(action_delay: Duration, clock: C) -> Self {
        Self { action_delay, clock }
    }

    pub fn action_delay(&self) -> Duration {
        self.action_delay
    }

    /// Run every action of `sequence` in order.
    ///
    /// The first failing action aborts the rest of this replay.
    pub fn replay(
        &self,
        driver: &mut dyn DeviceDriver,
        sequence: &ActionSequence,
        input: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Replay, ExecutionError> {
        let last = sequence.len().saturating_sub(1);
        for (index, action) in sequence.iter().enumerate() {
            if cancel.is_canceled() {
                debug!(index, "Replay canceled");
                return Ok(Replay::Canceled { at: index });
            }

            dispatch(driver, action, input).map_err(|cause| ExecutionError::ActionFailed {
                index,
                action: action.clone(),
                cause,
            })?;

            if index < last && !self.action_delay.is_zero() && !self.clock.pause(self.action_delay, cancel) {
                return Ok(Replay::Canceled { at: index + 1 });
            }
        }
        Ok(Replay::Completed)
    }
}

fn dispatch(driver: &mut dyn DeviceDriver, action: &Action, input: Option<&str>) -> Result<(), FailureCause> {
    match action {
        Action::Click { x, y, button } => driver.click(*x, *y, *button)?,
        Action::DoubleClick { x, y } => driver.double_click(*x, *y)?,
        Action::Drag { x1, y1, x2, y2 } => driver.drag((*x1, *y1), (*x2, *y2))?,
        Action::Move { x, y } => driver.move_to(*x, *y)?,
        Action::KeyPress { key } => driver.key_press(key)?,
        Action::KeyCombo { keys } => driver.key_combo(keys)?,
        Action::TypeText { use_current_input: true } => match input {
            Some(text) => driver.type_text(text)?,
            None => warn!("TYPE_TEXT without a fuzz input, skipping"),
        },
        Action::TypeText { use_current_input: false } => driver.type_text("")?,
        Action::Wait { seconds } => {
            let duration =
                Duration::try_from_secs_f64(*seconds).map_err(|_| FailureCause::InvalidWait { seconds: *seconds })?;
            driver.wait(duration)?
        }
        Action::VerifyPixel {
            x,
            y,
            rgb,
            tolerance,
        } => {
            let observed = driver.pixel(*x, *y)?;
            if !rgb.within(&observed, *tolerance) {
                return Err(FailureCause::PixelMismatch {
                    x: *x,
                    y: *y,
                    expected: *rgb,
                    observed,
                    tolerance: *tolerance,
                });
            }
        }
        Action::FindImage { path, confidence } => match driver.locate_image(path, *confidence)? {
            Some((x, y)) => driver.click(x, y, crate::sequence::MouseButton::Left)?,
            None => {
                return Err(FailureCause::ImageNotFound {
                    path: path.display().to_string(),
                    confidence: *confidence,
                });
            }
        },
        Action::CustomScript { reference } => driver.run_script(reference)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{InputEvent, VirtualScreen};
    use crate::sequence::{MouseButton, parse_sequence};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    /// Records pacing requests instead of sleeping; cancels after `cancel_after` pauses
    #[derive(Default)]
    struct InstantClock {
        pauses: Mutex<Vec<Duration>>,
        cancel_after: Option<usize>,
    }

    impl Clock for InstantClock {
        fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
            let mut pauses = self.pauses.lock();
            pauses.push(duration);
            if self.cancel_after == Some(pauses.len()) {
                cancel.cancel();
            }
            !cancel.is_canceled()
        }
    }

    fn seq(descriptors: &[&str]) -> ActionSequence {
        parse_sequence(descriptors).unwrap()
    }

    #[test]
    fn test_dispatches_every_action_in_order() {
        let mut screen = VirtualScreen::with_color(200, 200, [0, 0, 0]);
        let log = screen.events();
        let exec = SequenceExecutor::with_clock(Duration::from_millis(100), InstantClock::default());
        let sequence = seq(&[
            "LEFT_CLICK,10,10",
            "KEY,tab",
            "TYPE_TEXT",
            "VERIFY_PIXEL,5,5,#000000",
            "KEY_COMBO,ctrl+a",
            "WAIT,0.5",
        ]);

        let result = exec.replay(&mut screen, &sequence, Some("fuzz"), &CancelToken::new());
        assert_eq!(result.unwrap(), Replay::Completed);
        assert_eq!(
            log.snapshot(),
            vec![
                InputEvent::Click {
                    x: 10,
                    y: 10,
                    button: MouseButton::Left
                },
                InputEvent::Key("tab".into()),
                InputEvent::Text("fuzz".into()),
                InputEvent::PixelRead { x: 5, y: 5 },
                InputEvent::Combo(vec!["ctrl".into(), "a".into()]),
                InputEvent::Wait(Duration::from_millis(500)),
            ]
        );
        // pacing between actions, none after the last
        assert_eq!(exec.clock.pauses.lock().len(), sequence.len() - 1);
    }

    #[test]
    fn test_pixel_mismatch_aborts_rest() {
        let mut screen = VirtualScreen::with_color(50, 50, [200, 0, 0]);
        let log = screen.events();
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        let sequence = seq(&["TYPE_TEXT", "VERIFY_PIXEL,1,1,#00ff00", "ENTER"]);

        let err = exec
            .replay(&mut screen, &sequence, Some("x"), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.index(), 1);
        assert!(matches!(
            err.cause(),
            FailureCause::PixelMismatch {
                observed: Rgb([200, 0, 0]),
                ..
            }
        ));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_pixel_within_tolerance_passes() {
        let mut screen = VirtualScreen::with_color(10, 10, [100, 100, 100]);
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        let ok = seq(&["VERIFY_PIXEL,0,0,#6e6e6e"]);
        assert!(exec.replay(&mut screen, &ok, None, &CancelToken::new()).is_ok());
        let off = seq(&["VERIFY_PIXEL,0,0,#6f6f6f"]);
        assert!(exec.replay(&mut screen, &off, None, &CancelToken::new()).is_err());
    }

    #[test]
    fn test_cancel_before_start_dispatches_nothing() {
        let mut screen = VirtualScreen::new(10, 10);
        let log = screen.events();
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = exec.replay(&mut screen, &seq(&["ENTER", "TAB"]), None, &cancel);
        assert_eq!(result.unwrap(), Replay::Canceled { at: 0 });
        assert!(log.is_empty());
    }

    #[test]
    fn test_cancel_during_pacing_stops_dispatch() {
        let mut screen = VirtualScreen::new(10, 10);
        let log = screen.events();
        let clock = InstantClock {
            cancel_after: Some(2),
            ..Default::default()
        };
        let exec = SequenceExecutor::with_clock(Duration::from_millis(10), clock);
        let result = exec.replay(
            &mut screen,
            &seq(&["ENTER", "TAB", "ESC", "ENTER"]),
            None,
            &CancelToken::new(),
        );
        assert_eq!(result.unwrap(), Replay::Canceled { at: 2 });
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_type_text_without_input_is_skipped() {
        let mut screen = VirtualScreen::new(10, 10);
        let log = screen.events();
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        exec.replay(&mut screen, &seq(&["TYPE_TEXT", "TYPE_TEXT,false"]), None, &CancelToken::new())
            .unwrap();
        assert_eq!(log.snapshot(), vec![InputEvent::Text(String::new())]);
    }

    #[test]
    fn test_find_image_miss_and_driver_error() {
        let dir = tempfile::tempdir().unwrap();
        let template = VirtualScreen::with_color(4, 4, [255, 255, 255]);
        let path: PathBuf = dir.path().join("white.png");
        std::fs::write(&path, template.to_png().unwrap()).unwrap();

        let mut screen = VirtualScreen::with_color(20, 20, [0, 0, 0]);
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        let find = ActionSequence::new(vec![Action::FindImage {
            path: path.clone(),
            confidence: 0.9,
        }]);
        let err = exec.replay(&mut screen, &find, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err.cause(), FailureCause::ImageNotFound { .. }));

        // hit clicks the centre of the match
        screen.draw_rect(8, 8, 4, 4, [255, 255, 255]);
        let log = screen.events();
        exec.replay(&mut screen, &find, None, &CancelToken::new()).unwrap();
        assert_eq!(
            log.snapshot().last(),
            Some(&InputEvent::Click {
                x: 10,
                y: 10,
                button: MouseButton::Left
            })
        );

        let off_screen = seq(&["LEFT_CLICK,500,500"]);
        let err = exec.replay(&mut screen, &off_screen, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err.cause(), FailureCause::Driver(DriverError::OutOfBounds { .. })));
    }

    #[test]
    fn test_unrepresentable_wait_fails_the_action() {
        let mut screen = VirtualScreen::new(10, 10);
        let log = screen.events();
        let exec = SequenceExecutor::with_clock(Duration::ZERO, InstantClock::default());
        let sequence = ActionSequence::new(vec![
            Action::Wait { seconds: 1e300 },
            Action::KeyPress { key: "enter".into() },
        ]);

        let err = exec.replay(&mut screen, &sequence, None, &CancelToken::new()).unwrap_err();
        assert_eq!(err.index(), 0);
        assert!(matches!(err.cause(), FailureCause::InvalidWait { .. }));
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn test_cancel_token_wakes_sleep() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert!(CancelToken::new().sleep(Duration::from_millis(1)));
    }
}
