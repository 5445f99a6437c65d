//! Fuzz corpus loading.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read corpus {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the corpus bytes were decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

/// Ordered, fully materialized list of fuzz inputs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Corpus {
    inputs: Vec<String>,
    encoding: Option<Encoding>,
}

impl Corpus {
    pub fn from_inputs(inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            encoding: None,
        }
    }

    /// Read a corpus file: one input per line, empty lines included.
    ///
    /// Invalid UTF-8 falls back to Latin-1 so every byte maps to a char.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let corpus = Self::decode(&bytes);
        if corpus.encoding == Some(Encoding::Latin1) {
            warn!(path = %path.display(), "Corpus is not valid UTF-8, decoded as Latin-1");
        }
        debug!(path = %path.display(), inputs = corpus.len(), "Loaded corpus");
        Ok(corpus)
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let (text, encoding) = match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), Encoding::Utf8),
            Err(_) => (bytes.iter().map(|&b| b as char).collect(), Encoding::Latin1),
        };
        Self {
            inputs: text.lines().map(str::to_string).collect(),
            encoding: Some(encoding),
        }
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn into_inputs(self) -> Vec<String> {
        self.inputs
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Where a job's inputs come from
#[derive(Debug, Clone, PartialEq)]
pub enum CorpusSource {
    File(PathBuf),
    Inline(Vec<String>),
}

impl CorpusSource {
    pub fn materialize(&self) -> Result<Corpus, CorpusError> {
        match self {
            CorpusSource::File(path) => Corpus::load(path),
            CorpusSource::Inline(inputs) => Ok(Corpus::from_inputs(inputs.iter().cloned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_line_is_an_input() {
        let corpus = Corpus::decode(b"alpha\n\n  spaced  \r\nlast");
        assert_eq!(corpus.inputs(), ["alpha", "", "  spaced  ", "last"]);
        assert_eq!(corpus.encoding(), Some(Encoding::Utf8));

        // a trailing newline does not add an empty input
        assert_eq!(Corpus::decode(b"a\nb\n").len(), 2);
        assert!(Corpus::decode(b"").is_empty());
    }

    #[test]
    fn test_latin1_fallback() {
        let corpus = Corpus::decode(b"caf\xe9\n\xff\xfe");
        assert_eq!(corpus.encoding(), Some(Encoding::Latin1));
        assert_eq!(corpus.inputs(), ["café", "ÿþ"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputs.txt");
        std::fs::write(&path, "A\n%s%s%n\n\u{1F600}\n").unwrap();

        let corpus = CorpusSource::File(path).materialize().unwrap();
        assert_eq!(corpus.into_inputs(), vec!["A", "%s%s%n", "\u{1F600}"]);

        let missing = CorpusSource::File(dir.path().join("nope.txt")).materialize();
        assert!(matches!(missing, Err(CorpusError::Io { .. })));
    }
}
