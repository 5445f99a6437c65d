//! In-memory screen driver.
//!
//! Records every input event into a shared [`EventLog`] and answers pixel
//! reads and template searches from a framebuffer that tests (or a dry run)
//! paint with the drawing helpers.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use parking_lot::Mutex;

use crate::config::DEFAULT_SCRIPT_TIMEOUT;
use crate::driver::{DeviceDriver, DriverError, DriverResult, find_template, load_template, run_shell_script};
use crate::sequence::{MouseButton, Rgb};

/// One primitive received by the virtual screen
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Click { x: i32, y: i32, button: MouseButton },
    DoubleClick { x: i32, y: i32 },
    Drag { from: (i32, i32), to: (i32, i32) },
    Move { x: i32, y: i32 },
    Key(String),
    Combo(Vec<String>),
    Text(String),
    Wait(Duration),
    PixelRead { x: i32, y: i32 },
    ImageSearch { path: String },
    Script(String),
}

/// Shared, cloneable view of recorded events
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<InputEvent>>>);

impl EventLog {
    pub fn push(&self, event: InputEvent) {
        self.0.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<InputEvent> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Text typed so far, in order
    pub fn typed(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                InputEvent::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Framebuffer-backed driver
#[derive(Debug, Clone)]
pub struct VirtualScreen {
    width: u32,
    height: u32,
    /// RGB pixels, row-major
    buffer: Vec<u8>,
    events: EventLog,
    /// Run `SCRIPT` references through the shell instead of only recording them
    execute_scripts: bool,
}

impl VirtualScreen {
    /// Black screen of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u8; (width * height * 3) as usize],
            events: EventLog::default(),
            execute_scripts: false,
        }
    }

    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut screen = Self::new(width, height);
        screen.fill(color);
        screen
    }

    /// Load the framebuffer contents from an encoded image
    pub fn from_image_bytes(data: &[u8]) -> DriverResult<Self> {
        let rgb = image::load_from_memory(data)
            .map_err(|e| DriverError::Device(format!("failed to decode image: {}", e)))?
            .to_rgb8();
        let mut screen = Self::new(rgb.width(), rgb.height());
        screen.buffer = rgb.into_raw();
        Ok(screen)
    }

    pub fn execute_scripts(mut self, enabled: bool) -> Self {
        self.execute_scripts = enabled;
        self
    }

    /// Handle to the recorded events that survives moving the driver
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw unscaled 8x8 glyphs; text does not wrap
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        for (i, ch) in text.chars().enumerate() {
            let origin = x + i as u32 * 8;
            if origin >= self.width {
                break;
            }
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row, bits) in glyph.iter().enumerate() {
                for bit in 0..8 {
                    let color = if (bits >> bit) & 1 == 1 { fg } else { bg };
                    self.set_pixel(origin + bit, y + row as u32, color);
                }
            }
        }
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        Some([self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn to_image(&self) -> RgbImage {
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            image::Rgb(self.get_pixel(x, y).unwrap_or([0, 0, 0]))
        })
    }

    pub fn to_png(&self) -> DriverResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.to_image()
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DriverError::Device(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }

    fn check_bounds(&self, x: i32, y: i32) -> DriverResult<()> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            Err(DriverError::OutOfBounds { x, y })
        } else {
            Ok(())
        }
    }
}

impl DeviceDriver for VirtualScreen {
    fn name(&self) -> &str {
        "virtual"
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DriverResult<()> {
        self.check_bounds(x, y)?;
        self.events.push(InputEvent::Click { x, y, button });
        Ok(())
    }

    fn double_click(&mut self, x: i32, y: i32) -> DriverResult<()> {
        self.check_bounds(x, y)?;
        self.events.push(InputEvent::DoubleClick { x, y });
        Ok(())
    }

    fn drag(&mut self, from: (i32, i32), to: (i32, i32)) -> DriverResult<()> {
        self.check_bounds(from.0, from.1)?;
        self.check_bounds(to.0, to.1)?;
        self.events.push(InputEvent::Drag { from, to });
        Ok(())
    }

    fn move_to(&mut self, x: i32, y: i32) -> DriverResult<()> {
        self.check_bounds(x, y)?;
        self.events.push(InputEvent::Move { x, y });
        Ok(())
    }

    fn key_press(&mut self, key: &str) -> DriverResult<()> {
        self.events.push(InputEvent::Key(key.to_string()));
        Ok(())
    }

    fn key_combo(&mut self, keys: &[String]) -> DriverResult<()> {
        self.events.push(InputEvent::Combo(keys.to_vec()));
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> DriverResult<()> {
        self.events.push(InputEvent::Text(text.to_string()));
        Ok(())
    }

    // nothing renders asynchronously here, so waits return at once
    fn wait(&mut self, duration: Duration) -> DriverResult<()> {
        self.events.push(InputEvent::Wait(duration));
        Ok(())
    }

    fn pixel(&mut self, x: i32, y: i32) -> DriverResult<Rgb> {
        self.check_bounds(x, y)?;
        self.events.push(InputEvent::PixelRead { x, y });
        self.get_pixel(x as u32, y as u32)
            .map(Rgb)
            .ok_or(DriverError::OutOfBounds { x, y })
    }

    fn locate_image(&mut self, path: &Path, confidence: f64) -> DriverResult<Option<(i32, i32)>> {
        self.events.push(InputEvent::ImageSearch {
            path: path.display().to_string(),
        });
        let template = load_template(path)?;
        Ok(find_template(&self.to_image(), &template, confidence))
    }

    fn run_script(&mut self, reference: &str) -> DriverResult<()> {
        self.events.push(InputEvent::Script(reference.to_string()));
        if self.execute_scripts {
            run_shell_script(reference, DEFAULT_SCRIPT_TIMEOUT)?;
        }
        Ok(())
    }

    fn screenshot(&mut self) -> DriverResult<Option<Vec<u8>>> {
        self.to_png().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_fill_and_rect() {
        let mut screen = VirtualScreen::new(20, 20);
        screen.draw_rect(5, 5, 10, 10, [255, 0, 0]);
        assert_eq!(screen.get_pixel(4, 4), Some([0, 0, 0]));
        assert_eq!(screen.get_pixel(5, 5), Some([255, 0, 0]));
        assert_eq!(screen.get_pixel(14, 14), Some([255, 0, 0]));
        assert_eq!(screen.get_pixel(15, 15), Some([0, 0, 0]));
        assert_eq!(screen.get_pixel(20, 0), None);
    }

    #[test]
    fn test_draw_text_sets_foreground() {
        let mut screen = VirtualScreen::new(32, 8);
        screen.draw_text(0, 0, "H", [255, 255, 255], [0, 0, 0]);
        let lit = (0..8)
            .flat_map(|y| (0..8).map(move |x| (x, y)))
            .filter(|&(x, y)| screen.get_pixel(x, y) == Some([255, 255, 255]))
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn test_records_events_through_shared_log() {
        let mut screen = VirtualScreen::with_color(100, 100, [10, 20, 30]);
        let log = screen.events();
        screen.click(1, 2, MouseButton::Left).unwrap();
        screen.type_text("hello").unwrap();
        assert_eq!(screen.pixel(50, 50).unwrap(), Rgb::new(10, 20, 30));
        assert_eq!(
            log.snapshot(),
            vec![
                InputEvent::Click {
                    x: 1,
                    y: 2,
                    button: MouseButton::Left
                },
                InputEvent::Text("hello".into()),
                InputEvent::PixelRead { x: 50, y: 50 },
            ]
        );
        assert_eq!(log.typed(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_out_of_bounds_click() {
        let mut screen = VirtualScreen::new(10, 10);
        assert!(matches!(
            screen.click(10, 0, MouseButton::Right),
            Err(DriverError::OutOfBounds { x: 10, y: 0 })
        ));
        assert!(screen.events().is_empty());
    }

    #[test]
    fn test_locate_image_from_png_template() {
        let dir = tempdir().unwrap();
        let mut button = VirtualScreen::with_color(8, 6, [0, 200, 0]);
        button.draw_rect(2, 2, 4, 2, [255, 255, 255]);
        let template_path = dir.path().join("button.png");
        std::fs::write(&template_path, button.to_png().unwrap()).unwrap();

        let mut screen = VirtualScreen::with_color(64, 48, [30, 30, 30]);
        screen.draw_rect(40, 20, 8, 6, [0, 200, 0]);
        screen.draw_rect(42, 22, 4, 2, [255, 255, 255]);

        assert_eq!(
            screen.locate_image(&template_path, 0.95).unwrap(),
            Some((44, 23))
        );
    }

    #[test]
    fn test_screenshot_is_png() {
        let mut screen = VirtualScreen::with_color(16, 16, [1, 2, 3]);
        let png = screen.screenshot().unwrap().unwrap();
        assert_eq!(&png[0..4], &[0x89, 0x50, 0x4E, 0x47]);
        let decoded = VirtualScreen::from_image_bytes(&png).unwrap();
        assert_eq!(decoded.get_pixel(7, 7), Some([1, 2, 3]));
    }
}
