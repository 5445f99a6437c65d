// Sequence file load/save

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DEFAULT_ACTION_DELAY, DEFAULT_LAUNCH_DELAY};
use crate::sequence::action::ActionSequence;
use crate::sequence::parse::parse_sequence;
use crate::sequence::SequenceError;

/// Delays stored alongside the sequences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub launch_delay: f64,
    pub action_delay: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            launch_delay: DEFAULT_LAUNCH_DELAY,
            action_delay: DEFAULT_ACTION_DELAY,
        }
    }
}

/// On-disk form: descriptors as plain strings
#[derive(Debug, Serialize, Deserialize)]
struct RawSequenceFile {
    #[serde(default)]
    initial_setup: Vec<String>,
    main_sequence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timing: Option<Timing>,
}

/// Parsed sequence file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SequenceFile {
    pub initial_setup: ActionSequence,
    pub main_sequence: ActionSequence,
    /// `None` when the file carried no timing block
    pub timing: Option<Timing>,
}

impl SequenceFile {
    pub fn new(initial_setup: ActionSequence, main_sequence: ActionSequence) -> Self {
        Self {
            initial_setup,
            main_sequence,
            timing: None,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, SequenceError> {
        Self::parse_raw(json, Path::new("<inline>"))
    }

    /// Load and validate a sequence file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SequenceError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| SequenceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let file = Self::parse_raw(&content, path)?;
        debug!(
            path = %path.display(),
            initial = file.initial_setup.len(),
            main = file.main_sequence.len(),
            "Loaded sequence file"
        );
        Ok(file)
    }

    /// Write the canonical form of both sequences
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SequenceError> {
        let path = path.as_ref();
        let json = self.to_json().map_err(|message| SequenceError::Json {
            path: path.to_path_buf(),
            message,
        })?;
        fs::write(path, json).map_err(|e| SequenceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, String> {
        let raw = RawSequenceFile {
            initial_setup: self.initial_setup.to_descriptors(),
            main_sequence: self.main_sequence.to_descriptors(),
            timing: self.timing,
        };
        serde_json::to_string_pretty(&raw).map_err(|e| e.to_string())
    }

    fn parse_raw(content: &str, path: &Path) -> Result<Self, SequenceError> {
        let raw: RawSequenceFile =
            serde_json::from_str(content).map_err(|e| SequenceError::Json {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let initial_setup =
            parse_sequence(&raw.initial_setup).map_err(|e| SequenceError::InSection {
                section: "initial_setup",
                source: Box::new(e),
            })?;
        let main_sequence =
            parse_sequence(&raw.main_sequence).map_err(|e| SequenceError::InSection {
                section: "main_sequence",
                source: Box::new(e),
            })?;

        Ok(Self {
            initial_setup,
            main_sequence,
            timing: raw.timing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Action, MouseButton};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_load_legacy_descriptors() {
        let json = r#"{
            "initial_setup": ["LEFT_CLICK,10,20"],
            "main_sequence": ["CTRL_A", "CTRL_V", "ENTER"],
            "timing": {"launch_delay": 6.0, "action_delay": 0.2}
        }"#;
        let file = SequenceFile::from_json(json).unwrap();
        assert_eq!(
            file.initial_setup.actions(),
            &[Action::Click {
                x: 10,
                y: 20,
                button: MouseButton::Left
            }]
        );
        assert_eq!(file.main_sequence.len(), 3);
        assert_eq!(
            file.timing,
            Some(Timing {
                launch_delay: 6.0,
                action_delay: 0.2
            })
        );
    }

    #[test]
    fn test_missing_sections() {
        let file = SequenceFile::from_json(r#"{"main_sequence": ["TAB"]}"#).unwrap();
        assert!(file.initial_setup.is_empty());
        assert_eq!(file.timing, None);

        assert!(matches!(
            SequenceFile::from_json(r#"{"initial_setup": []}"#),
            Err(SequenceError::Json { .. })
        ));
    }

    #[test]
    fn test_error_names_section() {
        let err = SequenceFile::from_json(r#"{"main_sequence": ["TAB", "BOGUS"]}"#).unwrap_err();
        match err {
            SequenceError::InSection { section, source } => {
                assert_eq!(section, "main_sequence");
                assert_eq!(
                    *source,
                    SequenceError::UnknownActionKind {
                        index: 1,
                        tag: "BOGUS".into()
                    }
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_save_then_load_preserves_actions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.json");
        let original = SequenceFile::from_json(
            r##"{
                "initial_setup": ["CLICK,5,5,right", "WAIT,0.5"],
                "main_sequence": ["KEY_COMBO,ctrl+a", "TYPE_TEXT", "VERIFY_PIXEL,1,2,#abcdef,4"]
            }"##,
        )
        .unwrap()
        .with_timing(Timing::default());

        original.save(&path).unwrap();
        let loaded = SequenceFile::load(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = SequenceFile::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, SequenceError::Io { .. }));
    }
}
