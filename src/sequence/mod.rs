//! Input sequences: typed actions, the descriptor parser and sequence files.
//!
//! A sequence is validated once when it is loaded. The executor only ever
//! sees [`Action`] values, never raw descriptors.

mod action;
mod file;
mod parse;

pub use action::{Action, ActionSequence, MouseButton, Rgb};
pub use file::{SequenceFile, Timing};
pub use parse::{parse_action, parse_sequence};

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while reading or validating sequences
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequenceError {
    #[error("action #{index} '{entry}' is malformed: {reason}")]
    MalformedAction {
        index: usize,
        entry: String,
        reason: String,
    },

    #[error("action #{index} has unknown kind '{tag}'")]
    UnknownActionKind { index: usize, tag: String },

    #[error("failed to access sequence file {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("invalid sequence file {}: {message}", path.display())]
    Json { path: PathBuf, message: String },

    #[error("{section}: {source}")]
    InSection {
        section: &'static str,
        #[source]
        source: Box<SequenceError>,
    },
}
