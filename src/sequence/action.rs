// Typed actions and their canonical descriptor form

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Mouse button used by click actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" => Some(MouseButton::Left),
            "right" => Some(MouseButton::Right),
            "middle" => Some(MouseButton::Middle),
            _ => None,
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RGB colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b])
    }

    /// True when every channel differs by at most `tolerance`
    pub fn within(&self, other: &Rgb, tolerance: u8) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= tolerance)
    }

    /// Parse `#rrggbb` or `rrggbb`
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self([r, g, b]))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// One step of an input sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click { x: i32, y: i32, button: MouseButton },
    DoubleClick { x: i32, y: i32 },
    Drag { x1: i32, y1: i32, x2: i32, y2: i32 },
    Move { x: i32, y: i32 },
    KeyPress { key: String },
    KeyCombo { keys: Vec<String> },
    /// Types the fuzz input under test when `use_current_input` is set
    TypeText { use_current_input: bool },
    Wait { seconds: f64 },
    VerifyPixel { x: i32, y: i32, rgb: Rgb, tolerance: u8 },
    FindImage { path: PathBuf, confidence: f64 },
    CustomScript { reference: String },
}

impl Action {
    /// Canonical tag used in descriptors
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Click { .. } => "CLICK",
            Action::DoubleClick { .. } => "DOUBLE_CLICK",
            Action::Drag { .. } => "DRAG",
            Action::Move { .. } => "MOVE",
            Action::KeyPress { .. } => "KEY",
            Action::KeyCombo { .. } => "KEY_COMBO",
            Action::TypeText { .. } => "TYPE_TEXT",
            Action::Wait { .. } => "WAIT",
            Action::VerifyPixel { .. } => "VERIFY_PIXEL",
            Action::FindImage { .. } => "FIND_IMAGE",
            Action::CustomScript { .. } => "SCRIPT",
        }
    }

    /// Render the canonical descriptor accepted by [`super::parse_action`]
    pub fn to_descriptor(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Action::Click { x, y, button } => write!(f, "{tag},{x},{y},{button}"),
            Action::DoubleClick { x, y } | Action::Move { x, y } => write!(f, "{tag},{x},{y}"),
            Action::Drag { x1, y1, x2, y2 } => write!(f, "{tag},{x1},{y1},{x2},{y2}"),
            Action::KeyPress { key } => write!(f, "{tag},{key}"),
            Action::KeyCombo { keys } => write!(f, "{tag},{}", keys.join("+")),
            Action::TypeText { use_current_input } => write!(f, "{tag},{use_current_input}"),
            Action::Wait { seconds } => write!(f, "{tag},{seconds}"),
            Action::VerifyPixel {
                x,
                y,
                rgb,
                tolerance,
            } => write!(f, "{tag},{x},{y},{rgb},{tolerance}"),
            Action::FindImage { path, confidence } => {
                write!(f, "{tag},{},{confidence}", path.display())
            }
            Action::CustomScript { reference } => write!(f, "{tag},{reference}"),
        }
    }
}

/// Ordered, immutable list of actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionSequence {
    actions: Vec<Action>,
}

impl ActionSequence {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.actions.iter()
    }

    /// Canonical descriptors, one per action, in order
    pub fn to_descriptors(&self) -> Vec<String> {
        self.actions.iter().map(Action::to_descriptor).collect()
    }
}

impl From<Vec<Action>> for ActionSequence {
    fn from(actions: Vec<Action>) -> Self {
        Self::new(actions)
    }
}

impl<'a> IntoIterator for &'a ActionSequence {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_tolerance_is_per_channel() {
        let expected = Rgb::new(100, 100, 100);
        assert!(expected.within(&Rgb::new(110, 90, 100), 10));
        assert!(!expected.within(&Rgb::new(111, 100, 100), 10));
        assert!(expected.within(&expected, 0));
    }

    #[test]
    fn test_rgb_hex() {
        assert_eq!(Rgb::from_hex("#ff8000"), Some(Rgb::new(255, 128, 0)));
        assert_eq!(Rgb::from_hex("00ff00"), Some(Rgb::new(0, 255, 0)));
        assert_eq!(Rgb::from_hex("#fff"), None);
        assert_eq!(Rgb::new(1, 2, 3).to_string(), "#010203");
    }

    #[test]
    fn test_descriptor_rendering() {
        let click = Action::Click {
            x: 10,
            y: -4,
            button: MouseButton::Right,
        };
        assert_eq!(click.to_descriptor(), "CLICK,10,-4,right");
        let combo = Action::KeyCombo {
            keys: vec!["ctrl".into(), "shift".into(), "s".into()],
        };
        assert_eq!(combo.to_descriptor(), "KEY_COMBO,ctrl+shift+s");
        assert_eq!(Action::Wait { seconds: 0.25 }.to_descriptor(), "WAIT,0.25");
    }
}
