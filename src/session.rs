//! Session directories for fuzzing runs.
//!
//! A session directory holds everything one run produces:
//! - `.session.json` with the session id and creation time
//! - `session.log`, the per-run event log
//! - `crashes/crash_NNNN_<kind>/` bundles with `snapshot.json` and `screen.png`
//! - `stats.json`, written when the run ends

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config;

pub const LOG_FILE: &str = "session.log";
pub const STATS_FILE: &str = "stats.json";
pub const CRASHES_DIR: &str = "crashes";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const SCREENSHOT_FILE: &str = "screen.png";
const METADATA_FILE: &str = ".session.json";

/// One run's output directory
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after the session is dropped
    pub keep: bool,
}

impl Session {
    /// New session with a generated id under the configured base directory
    pub fn new() -> Self {
        let id = generate_session_id();
        let dir = PathBuf::from(config::session_base_dir()).join(&id);
        Self { id, dir, keep: true }
    }

    /// Session named after `name` plus a timestamp, under the configured base directory
    pub fn with_name(name: &str) -> Self {
        Self::with_name_in(config::session_base_dir(), name)
    }

    pub fn with_name_in(base: impl AsRef<Path>, name: &str) -> Self {
        let id = format!("{}_{}", sanitize_name(name), generate_timestamp_suffix());
        let dir = base.as_ref().join(&id);
        Self { id, dir, keep: true }
    }

    /// Session rooted at an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_id);
        Self { id, dir, keep: true }
    }

    /// Set whether to keep files after the session is dropped
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the directory tree and write session metadata
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.dir.join(CRASHES_DIR))?;

        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
            "host": hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
            "pid": std::process::id(),
        });
        fs::write(self.dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.dir.join(CRASHES_DIR)
    }

    /// Directory of the `seq`-th crash bundle
    pub fn crash_dir(&self, seq: u32, kind: &str) -> PathBuf {
        self.crashes_dir()
            .join(format!("crash_{:04}_{}", seq, sanitize_name(kind)))
    }

    /// Write a crash bundle and return its directory
    pub fn write_crash<T: Serialize>(
        &self,
        seq: u32,
        kind: &str,
        snapshot: &T,
        screenshot: Option<&[u8]>,
    ) -> std::io::Result<PathBuf> {
        let dir = self.crash_dir(seq, kind);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(SNAPSHOT_FILE), serde_json::to_string_pretty(snapshot)?)?;
        if let Some(png) = screenshot {
            fs::write(dir.join(SCREENSHOT_FILE), png)?;
        }
        Ok(dir)
    }

    /// Serialize `value` as pretty JSON into `name` inside the session directory
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(path)
    }

    /// Crash bundle directories, oldest first
    pub fn list_crashes(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut crashes = Vec::new();
        let dir = self.crashes_dir();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    crashes.push(path);
                }
            }
        }
        crashes.sort();
        Ok(crashes)
    }

    /// Remove the session directory unless it is kept
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Generate a unique session ID
fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("session_{}_{}", timestamp, std::process::id())
}

fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Remove sessions under `base` older than `max_age`
pub fn cleanup_old_sessions(base: impl AsRef<Path>, max_age: std::time::Duration) -> std::io::Result<usize> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) && fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

/// All session directories under `base`
pub fn list_sessions(base: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
    let base = base.as_ref();
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_with_name() {
        let base = tempdir().unwrap();
        let session = Session::with_name_in(base.path(), "my app/v2");
        assert!(session.id.starts_with("my_app_v2_"));
        assert!(session.dir.starts_with(base.path()));
        assert!(session.keep);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("hello world"), "hello_world");
        assert_eq!(sanitize_name("ctrl+c"), "ctrl_c");
        assert_eq!(sanitize_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn test_init_and_crash_bundle() {
        let base = tempdir().unwrap();
        let session = Session::in_dir(base.path().join("run"));
        session.init().unwrap();
        assert!(session.dir.join(".session.json").exists());
        assert!(session.crashes_dir().is_dir());

        let dir = session
            .write_crash(3, "cpu_spike", &serde_json::json!({"input": "x"}), Some(b"png"))
            .unwrap();
        assert!(dir.ends_with("crash_0003_cpu_spike"));
        assert!(dir.join(SNAPSHOT_FILE).exists());
        assert_eq!(fs::read(dir.join(SCREENSHOT_FILE)).unwrap(), b"png");

        let bare = session
            .write_crash(4, "process_terminated", &serde_json::json!({}), None)
            .unwrap();
        assert!(!bare.join(SCREENSHOT_FILE).exists());
        assert_eq!(session.list_crashes().unwrap(), vec![dir, bare]);
    }

    #[test]
    fn test_unkept_session_removed_on_drop() {
        let base = tempdir().unwrap();
        let dir = base.path().join("scratch");
        {
            let session = Session::in_dir(&dir).keep(false);
            session.init().unwrap();
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_list_sessions() {
        let base = tempdir().unwrap();
        assert!(list_sessions(base.path().join("missing")).unwrap().is_empty());
        fs::create_dir_all(base.path().join("b")).unwrap();
        fs::create_dir_all(base.path().join("a")).unwrap();
        fs::write(base.path().join("file.txt"), "x").unwrap();
        let sessions = list_sessions(base.path()).unwrap();
        assert_eq!(sessions, vec![base.path().join("a"), base.path().join("b")]);
        assert_eq!(cleanup_old_sessions(base.path(), std::time::Duration::from_secs(3600)).unwrap(), 0);
    }
}
