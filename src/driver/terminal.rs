//! Driver for targets running inside a pseudo-terminal.
//!
//! Keys and text are written to the PTY as the byte sequences an xterm would
//! send. Mouse actions become SGR (1006) mouse reports addressed to the cell
//! under the pixel coordinate. Everything the target prints is fed into a
//! VT100 [`Emulator`], which answers pixel reads, template searches and
//! screenshots.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::DEFAULT_SCRIPT_TIMEOUT;
use crate::driver::vt100::{CELL_HEIGHT, CELL_WIDTH, Emulator};
use crate::driver::{DeviceDriver, DriverError, DriverResult, find_template, load_template, run_shell_script};
use crate::sequence::{MouseButton, Rgb};

const QUIET_WINDOW: Duration = Duration::from_millis(120);
const MAX_SETTLE: Duration = Duration::from_secs(2);

/// Write half and output stream of a target's terminal
pub struct Console {
    writer: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    cols: u16,
    rows: u16,
}

impl Console {
    /// Wrap a PTY writer/reader pair; output is pumped by a background thread
    pub fn new(
        writer: Box<dyn Write + Send>,
        reader: Box<dyn Read + Send>,
        cols: u16,
        rows: u16,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("console-reader".into())
            .spawn(move || {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            });
        if let Err(e) = spawned {
            debug!("Failed to spawn console reader: {}", e);
        }
        Self {
            writer,
            output: rx,
            cols,
            rows,
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }
}

/// Drives a terminal target through its [`Console`]
pub struct TerminalDriver {
    console: Option<Console>,
    emulator: Emulator,
    quiet_window: Duration,
    max_settle: Duration,
}

impl TerminalDriver {
    /// Driver with no console yet; a screen of `cols` x `rows` is assumed
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            console: None,
            emulator: Emulator::new(u32::from(cols), u32::from(rows)),
            quiet_window: QUIET_WINDOW,
            max_settle: MAX_SETTLE,
        }
    }

    pub fn with_console(console: Console) -> Self {
        let (cols, rows) = console.size();
        let mut driver = Self::new(cols, rows);
        driver.console = Some(console);
        driver
    }

    /// Adjust how long output must stay quiet before the screen is read
    pub fn quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window = window;
        self
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    /// Visible text, after letting pending output settle
    pub fn screen_text(&mut self) -> String {
        self.settle();
        self.emulator.screen().text()
    }

    fn console(&mut self) -> DriverResult<&mut Console> {
        self.console.as_mut().ok_or(DriverError::NotAttached)
    }

    fn send(&mut self, bytes: &[u8]) -> DriverResult<()> {
        trace!(len = bytes.len(), "Writing to console");
        self.console()?.send(bytes)?;
        self.pump();
        Ok(())
    }

    /// Consume whatever output is already buffered
    fn pump(&mut self) {
        let Some(console) = self.console.as_ref() else {
            return;
        };
        while let Ok(chunk) = console.output.try_recv() {
            self.emulator.feed(&chunk);
        }
    }

    /// Feed output until it stays quiet for the quiet window or the settle limit passes
    fn settle(&mut self) {
        self.drain_for(self.quiet_window, self.max_settle);
    }

    fn drain_for(&mut self, quiet: Duration, limit: Duration) {
        let Some(console) = self.console.as_ref() else {
            return;
        };
        let start = Instant::now();
        let mut last_activity = Instant::now();
        while start.elapsed() < limit {
            match console.output.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => {
                    self.emulator.feed(&chunk);
                    last_activity = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() >= quiet {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(chunk) = console.output.try_recv() {
            self.emulator.feed(&chunk);
        }
    }

    /// 1-based cell under a pixel coordinate
    fn cell_at(&self, x: i32, y: i32) -> DriverResult<(u32, u32)> {
        let screen = self.emulator.screen();
        if x < 0 || y < 0 {
            return Err(DriverError::OutOfBounds { x, y });
        }
        let col = x as u32 / CELL_WIDTH;
        let row = y as u32 / CELL_HEIGHT;
        if col >= screen.cols() || row >= screen.rows() {
            return Err(DriverError::OutOfBounds { x, y });
        }
        Ok((col + 1, row + 1))
    }

    fn mouse(&mut self, code: u8, x: i32, y: i32, press: bool) -> DriverResult<()> {
        let (col, row) = self.cell_at(x, y)?;
        let report = sgr_mouse(code, col, row, press);
        self.send(report.as_bytes())
    }
}

fn button_code(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 0,
        MouseButton::Middle => 1,
        MouseButton::Right => 2,
    }
}

fn sgr_mouse(code: u8, col: u32, row: u32, press: bool) -> String {
    format!("\x1b[<{};{};{}{}", code, col, row, if press { 'M' } else { 'm' })
}

/// Bytes an xterm sends for a named key, or for a combination with modifiers
pub fn key_sequence(keys: &[String]) -> Option<Vec<u8>> {
    let (key, modifiers) = keys.split_last()?;
    let mut ctrl = false;
    let mut alt = false;
    let mut shift = false;
    for m in modifiers {
        match m.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => ctrl = true,
            "alt" | "option" | "meta" => alt = true,
            "shift" => shift = true,
            _ => return None,
        }
    }

    let key = key.to_ascii_lowercase();
    // xterm modifier parameter: 1 + shift + 2*alt + 4*ctrl
    let modifier = 1 + u8::from(shift) + 2 * u8::from(alt) + 4 * u8::from(ctrl);
    let csi = |fin: char| -> Vec<u8> {
        if modifier > 1 {
            format!("\x1b[1;{}{}", modifier, fin).into_bytes()
        } else {
            format!("\x1b[{}", fin).into_bytes()
        }
    };
    let tilde = |n: u8| -> Vec<u8> {
        if modifier > 1 {
            format!("\x1b[{};{}~", n, modifier).into_bytes()
        } else {
            format!("\x1b[{}~", n).into_bytes()
        }
    };

    let mut bytes = match key.as_str() {
        "up" => csi('A'),
        "down" => csi('B'),
        "right" => csi('C'),
        "left" => csi('D'),
        "home" => csi('H'),
        "end" => csi('F'),
        "insert" => tilde(2),
        "delete" | "del" => tilde(3),
        "pageup" | "page_up" => tilde(5),
        "pagedown" | "page_down" => tilde(6),
        "f1" => b"\x1bOP".to_vec(),
        "f2" => b"\x1bOQ".to_vec(),
        "f3" => b"\x1bOR".to_vec(),
        "f4" => b"\x1bOS".to_vec(),
        "f5" => tilde(15),
        "f6" => tilde(17),
        "f7" => tilde(18),
        "f8" => tilde(19),
        "f9" => tilde(20),
        "f10" => tilde(21),
        "f11" => tilde(23),
        "f12" => tilde(24),
        "tab" if shift => b"\x1b[Z".to_vec(),
        "enter" | "return" => vec![b'\r'],
        "tab" => vec![b'\t'],
        "esc" | "escape" => vec![0x1b],
        "backspace" => vec![0x7f],
        "space" => vec![if ctrl { 0 } else { b' ' }],
        single if single.chars().count() == 1 => {
            let ch = single.chars().next()?;
            if ctrl && ch.is_ascii_alphabetic() {
                vec![(ch as u8) & 0x1f]
            } else if shift {
                ch.to_uppercase().to_string().into_bytes()
            } else {
                single.as_bytes().to_vec()
            }
        }
        _ => return None,
    };

    // named keys with CSI encodings already carry the modifiers
    let encoded_modifiers = bytes.starts_with(b"\x1b[") || bytes.starts_with(b"\x1bO");
    if alt && !encoded_modifiers {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

impl DeviceDriver for TerminalDriver {
    fn name(&self) -> &str {
        "terminal"
    }

    fn click(&mut self, x: i32, y: i32, button: MouseButton) -> DriverResult<()> {
        let code = button_code(button);
        self.mouse(code, x, y, true)?;
        self.mouse(code, x, y, false)
    }

    fn double_click(&mut self, x: i32, y: i32) -> DriverResult<()> {
        self.click(x, y, MouseButton::Left)?;
        self.click(x, y, MouseButton::Left)
    }

    fn drag(&mut self, from: (i32, i32), to: (i32, i32)) -> DriverResult<()> {
        self.mouse(0, from.0, from.1, true)?;
        // motion with the left button held
        self.mouse(32, to.0, to.1, true)?;
        self.mouse(0, to.0, to.1, false)
    }

    fn move_to(&mut self, x: i32, y: i32) -> DriverResult<()> {
        self.mouse(35, x, y, true)
    }

    fn key_press(&mut self, key: &str) -> DriverResult<()> {
        let bytes =
            key_sequence(&[key.to_string()]).ok_or_else(|| DriverError::UnknownKey(key.to_string()))?;
        self.send(&bytes)
    }

    fn key_combo(&mut self, keys: &[String]) -> DriverResult<()> {
        let bytes = key_sequence(keys).ok_or_else(|| DriverError::UnknownKey(keys.join("+")))?;
        self.send(&bytes)
    }

    fn type_text(&mut self, text: &str) -> DriverResult<()> {
        self.send(text.as_bytes())
    }

    fn wait(&mut self, duration: Duration) -> DriverResult<()> {
        if self.console.is_some() {
            // keep the screen current while waiting
            let start = Instant::now();
            self.drain_for(duration, duration);
            thread::sleep(duration.saturating_sub(start.elapsed()));
        } else {
            thread::sleep(duration);
        }
        Ok(())
    }

    fn pixel(&mut self, x: i32, y: i32) -> DriverResult<Rgb> {
        self.settle();
        self.emulator
            .screen()
            .pixel_at(x, y)
            .map(Rgb)
            .ok_or(DriverError::OutOfBounds { x, y })
    }

    fn locate_image(&mut self, path: &Path, confidence: f64) -> DriverResult<Option<(i32, i32)>> {
        let template = load_template(path)?;
        self.settle();
        Ok(find_template(&self.emulator.screen().render(), &template, confidence))
    }

    fn run_script(&mut self, reference: &str) -> DriverResult<()> {
        run_shell_script(reference, DEFAULT_SCRIPT_TIMEOUT)?;
        self.pump();
        Ok(())
    }

    fn screenshot(&mut self) -> DriverResult<Option<Vec<u8>>> {
        self.settle();
        let mut bytes = Vec::new();
        self.emulator
            .screen()
            .render()
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DriverError::Device(format!("failed to encode PNG: {}", e)))?;
        Ok(Some(bytes))
    }

    fn attach(&mut self, console: Option<Console>) {
        if let Some(console) = &console {
            let (cols, rows) = console.size();
            self.emulator = Emulator::new(u32::from(cols), u32::from(rows));
        }
        self.console = console;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn console_with(output: &'static [u8]) -> (Console, SharedSink) {
        let sink = SharedSink::default();
        let console = Console::new(Box::new(sink.clone()), Box::new(output), 10, 4);
        (console, sink)
    }

    #[test]
    fn test_named_keys() {
        assert_eq!(key_sequence(&keys(&["enter"])), Some(vec![b'\r']));
        assert_eq!(key_sequence(&keys(&["ESC"])), Some(vec![0x1b]));
        assert_eq!(key_sequence(&keys(&["up"])), Some(b"\x1b[A".to_vec()));
        assert_eq!(key_sequence(&keys(&["f5"])), Some(b"\x1b[15~".to_vec()));
        assert_eq!(key_sequence(&keys(&["warp"])), None);
    }

    #[test]
    fn test_modifier_combinations() {
        assert_eq!(key_sequence(&keys(&["ctrl", "c"])), Some(vec![0x03]));
        assert_eq!(key_sequence(&keys(&["ctrl", "a"])), Some(vec![0x01]));
        assert_eq!(key_sequence(&keys(&["alt", "x"])), Some(b"\x1bx".to_vec()));
        assert_eq!(key_sequence(&keys(&["shift", "tab"])), Some(b"\x1b[Z".to_vec()));
        assert_eq!(key_sequence(&keys(&["ctrl", "right"])), Some(b"\x1b[1;5C".to_vec()));
        assert_eq!(key_sequence(&keys(&["hyper", "a"])), None);
    }

    #[test]
    fn test_unattached_driver_fails() {
        let mut driver = TerminalDriver::new(10, 4);
        assert!(matches!(driver.type_text("x"), Err(DriverError::NotAttached)));
    }

    #[test]
    fn test_clicks_become_sgr_reports() {
        let (console, sink) = console_with(b"");
        let mut driver = TerminalDriver::with_console(console);
        driver.click(CELL_WIDTH as i32 * 2 + 3, 5, MouseButton::Right).unwrap();
        assert_eq!(
            String::from_utf8(sink.0.lock().clone()).unwrap(),
            "\x1b[<2;3;1M\x1b[<2;3;1m"
        );
        assert!(matches!(
            driver.click(CELL_WIDTH as i32 * 10, 0, MouseButton::Left),
            Err(DriverError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_text_written_verbatim() {
        let (console, sink) = console_with(b"");
        let mut driver = TerminalDriver::with_console(console);
        driver.type_text("a,b\n").unwrap();
        assert_eq!(sink.0.lock().as_slice(), b"a,b\n");
    }

    #[test]
    fn test_screen_reflects_output() {
        let (console, _sink) = console_with(b"\x1b[44mready\x1b[0m");
        let mut driver = TerminalDriver::with_console(console).quiet_window(Duration::from_millis(30));
        assert_eq!(driver.screen_text().lines().next(), Some("ready"));
        // background of the first cell, top-left pixel is outside the glyph
        assert_eq!(driver.pixel(0, 0).unwrap(), Rgb::new(36, 114, 200));
        let png = driver.screenshot().unwrap().unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
