//! # Crashy Target
//!
//! A small terminal application that misbehaves on purpose, for trying out
//! desk-fuzz in terminal mode. It shows a text field; Enter submits it.
//!
//! - input containing `crash` aborts the process
//! - input containing `spin` pins a CPU core forever
//! - input containing `leak` allocates memory until killed
//! - input longer than `--max-len` exits with status 3
//!
//! Anything else is echoed back. Clicking `[Clear]` empties the history.

use clap::Parser;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers, MouseButton, MouseEventKind},
    execute, queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{self, Clear, ClearType},
};
use std::{
    error::Error,
    io::{Write, stdout},
    time::Duration,
};

const CLEAR_BUTTON: (u16, u16, &str) = (2, 3, "[Clear]");
const HISTORY_ROWS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "crashy-target", about = "Terminal app that crashes, spins or leaks on particular input")]
struct Args {
    /// Inputs longer than this make the app exit with status 3
    #[arg(long, default_value = "256")]
    max_len: usize,
}

#[derive(Default)]
struct App {
    field: String,
    history: Vec<String>,
    status: String,
}

enum Outcome {
    Continue,
    Quit,
}

impl App {
    fn submit(&mut self, max_len: usize) -> Outcome {
        let input = std::mem::take(&mut self.field);
        let lowered = input.to_lowercase();

        if input.chars().count() > max_len {
            restore_terminal();
            eprintln!("input of {} chars overflowed the buffer", input.chars().count());
            std::process::exit(3);
        }
        if lowered.contains("crash") {
            restore_terminal();
            std::process::abort();
        }
        if lowered.contains("spin") {
            self.status = "spinning".into();
            spin();
        }
        if lowered.contains("leak") {
            self.status = "leaking".into();
            leak();
        }
        if lowered == "quit" {
            return Outcome::Quit;
        }

        self.status = format!("accepted {} chars", input.chars().count());
        self.history.push(input);
        if self.history.len() > HISTORY_ROWS {
            self.history.remove(0);
        }
        Outcome::Continue
    }

    fn render(&self, w: &mut impl Write) -> Result<(), Box<dyn Error>> {
        queue!(
            w,
            Clear(ClearType::All),
            MoveTo(2, 1),
            SetForegroundColor(Color::Cyan),
            Print("crashy-target  (Enter submits, Ctrl+C quits)"),
            MoveTo(CLEAR_BUTTON.0, CLEAR_BUTTON.1),
            SetForegroundColor(Color::Yellow),
            Print(CLEAR_BUTTON.2),
            MoveTo(2, 5),
            SetForegroundColor(Color::White),
            Print(format!("> {}", self.field)),
        )?;
        for (i, line) in self.history.iter().enumerate() {
            queue!(
                w,
                MoveTo(4, 7 + i as u16),
                SetForegroundColor(Color::Green),
                Print(line.chars().take(60).collect::<String>())
            )?;
        }
        queue!(
            w,
            MoveTo(2, 8 + HISTORY_ROWS as u16),
            SetForegroundColor(Color::DarkGrey),
            Print(&self.status),
            ResetColor
        )?;
        w.flush()?;
        Ok(())
    }

    fn on_click(&mut self, column: u16, row: u16) {
        let (x, y, label) = CLEAR_BUTTON;
        if row == y && (x..x + label.len() as u16).contains(&column) {
            self.history.clear();
            self.status = "cleared".into();
        }
    }
}

fn spin() -> ! {
    let mut x: u64 = 0;
    loop {
        x = std::hint::black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1));
    }
}

fn leak() -> ! {
    let mut hoard: Vec<Vec<u8>> = Vec::new();
    loop {
        // touch every page so the memory is resident
        hoard.push(vec![0xAB; 16 * 1024 * 1024]);
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn restore_terminal() {
    let _ = execute!(stdout(), DisableMouseCapture, Show);
    let _ = terminal::disable_raw_mode();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut stdout = stdout();
    terminal::enable_raw_mode()?;
    execute!(stdout, Hide, EnableMouseCapture)?;

    let result = (|| -> Result<(), Box<dyn Error>> {
        let mut app = App::default();
        loop {
            app.render(&mut stdout)?;
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            match event::read()? {
                Event::Key(key) => match key.code {
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Char(ch) => app.field.push(ch),
                    KeyCode::Backspace => {
                        app.field.pop();
                    }
                    KeyCode::Esc => app.field.clear(),
                    KeyCode::Enter => {
                        if let Outcome::Quit = app.submit(args.max_len) {
                            break;
                        }
                    }
                    _ => {}
                },
                Event::Mouse(mouse) if mouse.kind == MouseEventKind::Down(MouseButton::Left) => {
                    app.on_click(mouse.column, mouse.row);
                }
                _ => {}
            }
        }
        Ok(())
    })();

    restore_terminal();
    if let Err(ref e) = result {
        eprintln!("Application error: {}", e);
    }
    result
}
