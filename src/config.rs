//! Configuration management with environment variable support.
//!
//! Run parameters come from three places, later ones winning:
//! - Defaults compiled into the crate
//! - `DESK_FUZZ_*` environment variables
//! - CLI flags, or the `timing` block of a sequence file
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DESK_FUZZ_SESSION_DIR` | Base directory for sessions | `/tmp/desk-fuzz` |
//! | `DESK_FUZZ_LAUNCH_DELAY` | Seconds to wait after launching the target | `5` |
//! | `DESK_FUZZ_ACTION_DELAY` | Seconds between replayed actions | `0.1` |
//! | `DESK_FUZZ_CPU_THRESHOLD` | CPU percent counted as a spike | `90` |
//! | `DESK_FUZZ_MEMORY_THRESHOLD` | Memory percent counted as a leak | `90` |
//! | `DESK_FUZZ_MAX_CRASHES` | Crashes before the run stops | `10` |
//! | `DESK_FUZZ_TERMINATE_TIMEOUT` | Seconds to wait for graceful exit | `5` |

use std::env;
use std::ops::RangeInclusive;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Default Values
// ============================================================================

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/desk-fuzz";

/// Default wait after launching the target (seconds)
pub const DEFAULT_LAUNCH_DELAY: f64 = 5.0;

/// Default delay between actions (seconds)
pub const DEFAULT_ACTION_DELAY: f64 = 0.1;

/// Default CPU spike threshold (percent)
pub const DEFAULT_CPU_THRESHOLD: f64 = 90.0;

/// Default memory threshold (percent of physical memory)
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 90.0;

/// Default crash budget for one run
pub const DEFAULT_MAX_CRASHES: u32 = 10;

/// Default graceful termination timeout (seconds)
pub const DEFAULT_TERMINATE_TIMEOUT: f64 = 5.0;

/// How long a freshly spawned process must survive to count as launched
pub const DEFAULT_LAUNCH_CHECK: Duration = Duration::from_millis(150);

/// Upper bound for command polling while paused
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Terminal size used when a target is launched in a pseudo-terminal
pub const DEFAULT_TERMINAL_COLS: u16 = 100;
pub const DEFAULT_TERMINAL_ROWS: u16 = 30;

/// Upper bound for a `SCRIPT` action
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted `WAIT` action (seconds)
pub const MAX_WAIT_SECS: f64 = 3600.0;

/// Per-channel tolerance used by `VERIFY_PIXEL` when none is given
pub const DEFAULT_PIXEL_TOLERANCE: u8 = 10;

/// Match confidence used by `FIND_IMAGE` when none is given
pub const DEFAULT_IMAGE_CONFIDENCE: f64 = 0.9;

/// Accepted launch delays (seconds)
pub const LAUNCH_DELAY_RANGE: RangeInclusive<f64> = 5.0..=30.0;

/// Accepted action delays (seconds)
pub const ACTION_DELAY_RANGE: RangeInclusive<f64> = 0.0..=1.0;

/// Accepted pause poll intervals (milliseconds)
pub const POLL_INTERVAL_RANGE: RangeInclusive<f64> = 1.0..=100.0;

/// Accepted graceful termination timeouts (seconds)
pub const TERMINATE_TIMEOUT_RANGE: RangeInclusive<f64> = 0.01..=300.0;

/// Accepted launch liveness windows (milliseconds)
pub const LAUNCH_CHECK_RANGE: RangeInclusive<f64> = 0.0..=10_000.0;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_SESSION_DIR: &str = "DESK_FUZZ_SESSION_DIR";
pub const ENV_LAUNCH_DELAY: &str = "DESK_FUZZ_LAUNCH_DELAY";
pub const ENV_ACTION_DELAY: &str = "DESK_FUZZ_ACTION_DELAY";
pub const ENV_CPU_THRESHOLD: &str = "DESK_FUZZ_CPU_THRESHOLD";
pub const ENV_MEMORY_THRESHOLD: &str = "DESK_FUZZ_MEMORY_THRESHOLD";
pub const ENV_MAX_CRASHES: &str = "DESK_FUZZ_MAX_CRASHES";
pub const ENV_TERMINATE_TIMEOUT: &str = "DESK_FUZZ_TERMINATE_TIMEOUT";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Run parameters used when nothing more specific is supplied
    pub run: RunConfig,
    /// Session storage
    pub session: SessionSettings,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            run: RunConfig::from_env(),
            session: SessionSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            run: RunConfig::default(),
            session: SessionSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR).unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

/// Parameters of one fuzzing run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seconds to wait after (re)launching the target before sending input
    pub launch_delay_secs: f64,
    /// Seconds between consecutive actions and between corpus inputs
    pub action_delay_secs: f64,
    /// CPU usage above this percentage is reported as a spike
    pub cpu_threshold_percent: f64,
    /// Memory usage above this percentage is reported as a leak
    pub memory_threshold_percent: f64,
    /// Number of crashes after which the run stops
    pub max_crashes: u32,
    /// Capture the screen into the crash bundle
    pub screenshot_on_crash: bool,
    /// Seconds to wait for a graceful exit before killing the target
    pub terminate_timeout_secs: f64,
    /// How long a new process must stay alive to count as launched (ms)
    pub launch_check_ms: u64,
    /// Command poll interval while paused (ms)
    pub poll_interval_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            launch_delay_secs: DEFAULT_LAUNCH_DELAY,
            action_delay_secs: DEFAULT_ACTION_DELAY,
            cpu_threshold_percent: DEFAULT_CPU_THRESHOLD,
            memory_threshold_percent: DEFAULT_MEMORY_THRESHOLD,
            max_crashes: DEFAULT_MAX_CRASHES,
            screenshot_on_crash: true,
            terminate_timeout_secs: DEFAULT_TERMINATE_TIMEOUT,
            launch_check_ms: DEFAULT_LAUNCH_CHECK.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

/// Rejected run parameter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{name} must be a positive finite number, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("max_crashes must be at least 1")]
    ZeroCrashBudget,
}

impl RunConfig {
    /// Create run parameters from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            launch_delay_secs: env_parse(ENV_LAUNCH_DELAY).unwrap_or(defaults.launch_delay_secs),
            action_delay_secs: env_parse(ENV_ACTION_DELAY).unwrap_or(defaults.action_delay_secs),
            cpu_threshold_percent: env_parse(ENV_CPU_THRESHOLD)
                .unwrap_or(defaults.cpu_threshold_percent),
            memory_threshold_percent: env_parse(ENV_MEMORY_THRESHOLD)
                .unwrap_or(defaults.memory_threshold_percent),
            max_crashes: env_parse(ENV_MAX_CRASHES).unwrap_or(defaults.max_crashes),
            screenshot_on_crash: defaults.screenshot_on_crash,
            terminate_timeout_secs: env_parse(ENV_TERMINATE_TIMEOUT)
                .unwrap_or(defaults.terminate_timeout_secs),
            ..defaults
        }
    }

    pub fn launch_delay(mut self, secs: f64) -> Self {
        self.launch_delay_secs = secs;
        self
    }

    pub fn action_delay(mut self, secs: f64) -> Self {
        self.action_delay_secs = secs;
        self
    }

    pub fn cpu_threshold(mut self, percent: f64) -> Self {
        self.cpu_threshold_percent = percent;
        self
    }

    pub fn memory_threshold(mut self, percent: f64) -> Self {
        self.memory_threshold_percent = percent;
        self
    }

    pub fn max_crashes(mut self, max: u32) -> Self {
        self.max_crashes = max;
        self
    }

    pub fn screenshot_on_crash(mut self, enabled: bool) -> Self {
        self.screenshot_on_crash = enabled;
        self
    }

    pub fn terminate_timeout(mut self, secs: f64) -> Self {
        self.terminate_timeout_secs = secs;
        self
    }

    pub fn launch_check(mut self, ms: u64) -> Self {
        self.launch_check_ms = ms;
        self
    }

    pub fn poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Check every field against its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("launch_delay", self.launch_delay_secs, &LAUNCH_DELAY_RANGE)?;
        check_range("action_delay", self.action_delay_secs, &ACTION_DELAY_RANGE)?;
        check_positive("cpu_threshold", self.cpu_threshold_percent)?;
        check_positive("memory_threshold", self.memory_threshold_percent)?;
        check_range("terminate_timeout", self.terminate_timeout_secs, &TERMINATE_TIMEOUT_RANGE)?;
        if self.max_crashes == 0 {
            return Err(ConfigError::ZeroCrashBudget);
        }
        check_range(
            "poll_interval_ms",
            self.poll_interval_ms as f64,
            &POLL_INTERVAL_RANGE,
        )?;
        check_range(
            "launch_check_ms",
            self.launch_check_ms as f64,
            &LAUNCH_CHECK_RANGE,
        )?;
        Ok(())
    }

    pub fn launch_delay_duration(&self) -> Duration {
        secs_or(self.launch_delay_secs, DEFAULT_LAUNCH_DELAY)
    }

    pub fn action_delay_duration(&self) -> Duration {
        secs_or(self.action_delay_secs, DEFAULT_ACTION_DELAY)
    }

    pub fn terminate_timeout_duration(&self) -> Duration {
        secs_or(self.terminate_timeout_secs, DEFAULT_TERMINATE_TIMEOUT)
    }

    pub fn launch_check_duration(&self) -> Duration {
        Duration::from_millis(self.launch_check_ms)
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn check_range(
    name: &'static str,
    value: f64,
    range: &RangeInclusive<f64>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Unvalidated values that are negative clamp to zero; unrepresentable ones use `fallback`
fn secs_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::from_secs_f64(fallback))
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    get().session.base_dir.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_launch_delay_bounds() {
        assert!(RunConfig::default().launch_delay(5.0).validate().is_ok());
        assert!(RunConfig::default().launch_delay(30.0).validate().is_ok());
        assert_eq!(
            RunConfig::default().launch_delay(4.0).validate(),
            Err(ConfigError::OutOfRange {
                name: "launch_delay",
                value: 4.0,
                min: 5.0,
                max: 30.0
            })
        );
        assert!(RunConfig::default().launch_delay(31.0).validate().is_err());
    }

    #[test]
    fn test_action_delay_bounds() {
        assert!(RunConfig::default().action_delay(0.0).validate().is_ok());
        assert!(RunConfig::default().action_delay(1.0).validate().is_ok());
        assert!(RunConfig::default().action_delay(1.5).validate().is_err());
        assert!(RunConfig::default().action_delay(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_thresholds_and_budget() {
        assert!(RunConfig::default().cpu_threshold(0.0).validate().is_err());
        assert!(RunConfig::default().memory_threshold(-1.0).validate().is_err());
        assert_eq!(
            RunConfig::default().max_crashes(0).validate(),
            Err(ConfigError::ZeroCrashBudget)
        );
        assert!(RunConfig::default().poll_interval(0).validate().is_err());
        assert!(RunConfig::default().poll_interval(250).validate().is_err());
        assert!(RunConfig::default().poll_interval(100).validate().is_ok());
    }

    #[test]
    fn test_terminate_timeout_bounds() {
        assert!(RunConfig::default().terminate_timeout(300.0).validate().is_ok());
        assert_eq!(
            RunConfig::default().terminate_timeout(1e300).validate(),
            Err(ConfigError::OutOfRange {
                name: "terminate_timeout",
                value: 1e300,
                min: 0.01,
                max: 300.0,
            })
        );
        assert!(RunConfig::default().terminate_timeout(0.0).validate().is_err());
        assert!(RunConfig::default().terminate_timeout(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_durations_never_panic_on_unvalidated_values() {
        let wild = RunConfig::default()
            .terminate_timeout(1e300)
            .launch_delay(f64::INFINITY)
            .action_delay(-3.0);
        assert_eq!(wild.terminate_timeout_duration(), Duration::from_secs(5));
        assert_eq!(wild.launch_delay_duration(), Duration::from_secs_f64(DEFAULT_LAUNCH_DELAY));
        assert_eq!(wild.action_delay_duration(), Duration::ZERO);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.session.base_dir, DEFAULT_SESSION_DIR);
        assert_eq!(config.run.max_crashes, DEFAULT_MAX_CRASHES);
    }
}
