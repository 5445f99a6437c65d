//! Validating parser from textual descriptors to [`Action`]s.
//!
//! Descriptors are comma separated with the tag first. Tags are matched
//! case-insensitively; the legacy tags recorded by older sequence builders
//! (`LEFT_CLICK`, `CTRL_V`, `ESC`, ...) map onto the same typed actions.

use std::path::PathBuf;

use crate::config::{DEFAULT_IMAGE_CONFIDENCE, DEFAULT_PIXEL_TOLERANCE, MAX_WAIT_SECS};
use crate::sequence::action::{Action, ActionSequence, MouseButton, Rgb};
use crate::sequence::SequenceError;

/// Parse one descriptor. `index` is only used for error reporting.
pub fn parse_action(index: usize, descriptor: &str) -> Result<Action, SequenceError> {
    let entry = descriptor.trim();
    if entry.is_empty() {
        return Err(malformed(index, descriptor, "empty descriptor"));
    }

    let (tag, rest) = match entry.split_once(',') {
        Some((tag, rest)) => (tag.trim(), Some(rest)),
        None => (entry, None),
    };
    let fields: Vec<&str> = rest
        .map(|r| r.split(',').map(str::trim).collect())
        .unwrap_or_default();
    let p = FieldParser {
        index,
        entry: descriptor,
        fields: &fields,
    };

    let action = match tag.to_ascii_uppercase().as_str() {
        "LEFT_CLICK" => p.click(MouseButton::Left)?,
        "RIGHT_CLICK" => p.click(MouseButton::Right)?,
        "MIDDLE_CLICK" => p.click(MouseButton::Middle)?,
        "CLICK" => {
            p.arity(2..=3)?;
            let button = match fields.get(2) {
                Some(name) => MouseButton::from_name(name)
                    .ok_or_else(|| p.error(format!("unknown mouse button '{}'", name)))?,
                None => MouseButton::Left,
            };
            Action::Click {
                x: p.int(0)?,
                y: p.int(1)?,
                button,
            }
        }
        "DOUBLE_CLICK" => {
            p.arity(2..=2)?;
            Action::DoubleClick {
                x: p.int(0)?,
                y: p.int(1)?,
            }
        }
        "DRAG" => {
            p.arity(4..=4)?;
            Action::Drag {
                x1: p.int(0)?,
                y1: p.int(1)?,
                x2: p.int(2)?,
                y2: p.int(3)?,
            }
        }
        "MOVE" => {
            p.arity(2..=2)?;
            Action::Move {
                x: p.int(0)?,
                y: p.int(1)?,
            }
        }
        "KEY" => {
            p.arity(1..=1)?;
            Action::KeyPress { key: p.word(0)? }
        }
        "ENTER" | "TAB" | "ESC" => {
            p.arity(0..=0)?;
            Action::KeyPress {
                key: tag.to_ascii_lowercase(),
            }
        }
        "KEY_COMBO" | "HOTKEY" => {
            p.arity(1..=1)?;
            let keys: Vec<String> = fields[0]
                .split('+')
                .map(|k| k.trim().to_ascii_lowercase())
                .collect();
            if keys.iter().any(String::is_empty) {
                return Err(p.error("empty key in combination"));
            }
            Action::KeyCombo { keys }
        }
        "CTRL_A" | "CTRL_C" => {
            p.arity(0..=0)?;
            let letter = tag[tag.len() - 1..].to_ascii_lowercase();
            Action::KeyCombo {
                keys: vec!["ctrl".to_string(), letter],
            }
        }
        "TYPE_TEXT" | "TYPE_INPUT" => {
            p.arity(0..=1)?;
            let use_current_input = match fields.first() {
                Some(flag) => parse_bool(flag)
                    .ok_or_else(|| p.error(format!("expected true/false, got '{}'", flag)))?,
                None => true,
            };
            Action::TypeText { use_current_input }
        }
        // legacy sequences paste the fuzz input with CTRL_V
        "CTRL_V" => {
            p.arity(0..=0)?;
            Action::TypeText {
                use_current_input: true,
            }
        }
        "WAIT" => {
            p.arity(1..=1)?;
            let seconds = p.float(0)?;
            if seconds < 0.0 {
                return Err(p.error("wait duration must not be negative"));
            }
            if seconds > MAX_WAIT_SECS {
                return Err(p.error(format!("wait duration exceeds {}s", MAX_WAIT_SECS)));
            }
            Action::Wait { seconds }
        }
        "VERIFY_PIXEL" => {
            p.arity(3..=4)?;
            let rgb = Rgb::from_hex(fields[2])
                .ok_or_else(|| p.error(format!("invalid colour '{}'", fields[2])))?;
            let tolerance = match fields.get(3) {
                Some(raw) => raw
                    .parse::<u8>()
                    .map_err(|_| p.error(format!("invalid tolerance '{}'", raw)))?,
                None => DEFAULT_PIXEL_TOLERANCE,
            };
            Action::VerifyPixel {
                x: p.int(0)?,
                y: p.int(1)?,
                rgb,
                tolerance,
            }
        }
        "FIND_IMAGE" => {
            let raw = rest.map(str::trim).unwrap_or_default();
            if raw.is_empty() {
                return Err(p.error("expected an image path"));
            }
            // paths may contain commas; a trailing number is the confidence
            let (path, confidence) = match raw.rsplit_once(',') {
                Some((path, tail)) if tail.trim().parse::<f64>().is_ok() => {
                    (path.trim(), tail.trim().parse::<f64>().unwrap_or(DEFAULT_IMAGE_CONFIDENCE))
                }
                _ => (raw, DEFAULT_IMAGE_CONFIDENCE),
            };
            if path.is_empty() {
                return Err(p.error("expected an image path"));
            }
            if !(confidence > 0.0 && confidence <= 1.0) {
                return Err(p.error(format!("confidence must be in (0, 1], got {}", confidence)));
            }
            Action::FindImage {
                path: PathBuf::from(path),
                confidence,
            }
        }
        "SCRIPT" | "CUSTOM_SCRIPT" => {
            let reference = rest.map(str::trim).unwrap_or_default();
            if reference.is_empty() {
                return Err(p.error("expected a script reference"));
            }
            Action::CustomScript {
                reference: reference.to_string(),
            }
        }
        _ => {
            return Err(SequenceError::UnknownActionKind {
                index,
                tag: tag.to_string(),
            });
        }
    };

    Ok(action)
}

/// Parse a whole list, failing on the first bad entry
pub fn parse_sequence<S: AsRef<str>>(descriptors: &[S]) -> Result<ActionSequence, SequenceError> {
    descriptors
        .iter()
        .enumerate()
        .map(|(index, d)| parse_action(index, d.as_ref()))
        .collect::<Result<Vec<_>, _>>()
        .map(ActionSequence::new)
}

struct FieldParser<'a> {
    index: usize,
    entry: &'a str,
    fields: &'a [&'a str],
}

impl FieldParser<'_> {
    fn error(&self, reason: impl Into<String>) -> SequenceError {
        malformed(self.index, self.entry, reason)
    }

    fn arity(&self, expected: std::ops::RangeInclusive<usize>) -> Result<(), SequenceError> {
        if expected.contains(&self.fields.len()) {
            Ok(())
        } else if expected.start() == expected.end() {
            Err(self.error(format!(
                "expected {} field(s), got {}",
                expected.start(),
                self.fields.len()
            )))
        } else {
            Err(self.error(format!(
                "expected {} to {} fields, got {}",
                expected.start(),
                expected.end(),
                self.fields.len()
            )))
        }
    }

    fn click(&self, button: MouseButton) -> Result<Action, SequenceError> {
        self.arity(2..=2)?;
        Ok(Action::Click {
            x: self.int(0)?,
            y: self.int(1)?,
            button,
        })
    }

    fn int(&self, i: usize) -> Result<i32, SequenceError> {
        let raw = self.fields[i];
        raw.parse()
            .map_err(|_| self.error(format!("field {} is not an integer: '{}'", i + 1, raw)))
    }

    fn float(&self, i: usize) -> Result<f64, SequenceError> {
        let raw = self.fields[i];
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(self.error(format!("field {} is not a number: '{}'", i + 1, raw))),
        }
    }

    fn word(&self, i: usize) -> Result<String, SequenceError> {
        let raw = self.fields[i];
        if raw.is_empty() {
            Err(self.error(format!("field {} is empty", i + 1)))
        } else {
            Ok(raw.to_ascii_lowercase())
        }
    }
}

fn malformed(index: usize, entry: &str, reason: impl Into<String>) -> SequenceError {
    SequenceError::MalformedAction {
        index,
        entry: entry.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_legacy_tags() {
        assert_eq!(
            parse_action(0, "LEFT_CLICK,100,200").unwrap(),
            Action::Click {
                x: 100,
                y: 200,
                button: MouseButton::Left
            }
        );
        assert_eq!(
            parse_action(0, "RIGHT_CLICK,1,2").unwrap(),
            Action::Click {
                x: 1,
                y: 2,
                button: MouseButton::Right
            }
        );
        assert_eq!(
            parse_action(0, "DRAG,1,2,3,4").unwrap(),
            Action::Drag {
                x1: 1,
                y1: 2,
                x2: 3,
                y2: 4
            }
        );
        assert_eq!(
            parse_action(0, "ENTER").unwrap(),
            Action::KeyPress {
                key: "enter".into()
            }
        );
        assert_eq!(
            parse_action(0, "CTRL_A").unwrap(),
            Action::KeyCombo {
                keys: vec!["ctrl".into(), "a".into()]
            }
        );
        assert_eq!(
            parse_action(0, "CTRL_V").unwrap(),
            Action::TypeText {
                use_current_input: true
            }
        );
    }

    #[test]
    fn test_verify_pixel_default_tolerance() {
        assert_eq!(
            parse_action(0, "VERIFY_PIXEL,5,6,#102030").unwrap(),
            Action::VerifyPixel {
                x: 5,
                y: 6,
                rgb: Rgb::new(0x10, 0x20, 0x30),
                tolerance: 10
            }
        );
    }

    #[test]
    fn test_find_image_path_with_comma() {
        assert_eq!(
            parse_action(0, "FIND_IMAGE,/tmp/a,b.png,0.75").unwrap(),
            Action::FindImage {
                path: PathBuf::from("/tmp/a,b.png"),
                confidence: 0.75
            }
        );
        assert_eq!(
            parse_action(0, "find_image,button.png").unwrap(),
            Action::FindImage {
                path: PathBuf::from("button.png"),
                confidence: DEFAULT_IMAGE_CONFIDENCE
            }
        );
    }

    #[test]
    fn test_unknown_tag_names_index() {
        let err = parse_sequence(&["ENTER", "TELEPORT,1,2"]).unwrap_err();
        assert_eq!(
            err,
            SequenceError::UnknownActionKind {
                index: 1,
                tag: "TELEPORT".into()
            }
        );
    }

    #[test]
    fn test_malformed_entries() {
        let cases = [
            "LEFT_CLICK,10",
            "LEFT_CLICK,ten,20",
            "DRAG,1,2,3",
            "WAIT,-1",
            "WAIT,inf",
            "WAIT,1e300",
            "WAIT,3600.5",
            "VERIFY_PIXEL,1,2,zzzzzz",
            "VERIFY_PIXEL,1,2,#000000,300",
            "FIND_IMAGE,a.png,1.5",
            "KEY_COMBO,ctrl++",
            "TYPE_TEXT,maybe",
            "ENTER,1",
            "",
        ];
        for (i, entry) in cases.iter().enumerate() {
            match parse_action(i, entry) {
                Err(SequenceError::MalformedAction { index, .. }) => assert_eq!(index, i),
                other => panic!("expected MalformedAction for '{}', got {:?}", entry, other),
            }
        }
    }

    #[test]
    fn test_canonical_round_trip() {
        let sequence = ActionSequence::new(vec![
            Action::Click {
                x: 3,
                y: 4,
                button: MouseButton::Middle,
            },
            Action::DoubleClick { x: 0, y: 0 },
            Action::Drag {
                x1: -5,
                y1: 6,
                x2: 7,
                y2: 8,
            },
            Action::Move { x: 9, y: 10 },
            Action::KeyPress { key: "f5".into() },
            Action::KeyCombo {
                keys: vec!["alt".into(), "f4".into()],
            },
            Action::TypeText {
                use_current_input: false,
            },
            Action::Wait { seconds: 0.1 },
            Action::VerifyPixel {
                x: 1,
                y: 1,
                rgb: Rgb::new(255, 0, 7),
                tolerance: 3,
            },
            Action::FindImage {
                path: PathBuf::from("assets/ok button.png"),
                confidence: 0.8,
            },
            Action::CustomScript {
                reference: "scripts/reset.sh".into(),
            },
        ]);
        let parsed = parse_sequence(&sequence.to_descriptors()).unwrap();
        assert_eq!(parsed, sequence);
    }
}
