//! VT100 screen model used to read back what a terminal target has drawn.
//!
//! Every cell is rendered with font8x8 glyphs doubled vertically and then
//! scaled by [`PIXEL_SCALE`], so one cell covers [`CELL_WIDTH`] x
//! [`CELL_HEIGHT`] pixels. Pixel reads, template matches and screenshots all
//! go through the same cell rasteriser.

use font8x8::{
    BASIC_FONTS, BLOCK_FONTS, BOX_FONTS, GREEK_FONTS, LATIN_FONTS, MISC_FONTS, UnicodeFonts,
};
use image::{ImageBuffer, Rgb, RgbImage};
use vte::{Params, Parser, Perform};

const GLYPH_WIDTH: u32 = 8;
const GLYPH_HEIGHT: u32 = 16;
pub const PIXEL_SCALE: u32 = 2;
/// Width of a terminal cell in pixels
pub const CELL_WIDTH: u32 = GLYPH_WIDTH * PIXEL_SCALE;
/// Height of a terminal cell in pixels
pub const CELL_HEIGHT: u32 = GLYPH_HEIGHT * PIXEL_SCALE;

pub const DEFAULT_FG: [u8; 3] = [229, 229, 229];
pub const DEFAULT_BG: [u8; 3] = [0, 0, 0];

const PALETTE: [[u8; 3]; 16] = [
    [0, 0, 0],
    [205, 49, 49],
    [13, 188, 121],
    [229, 229, 16],
    [36, 114, 200],
    [188, 63, 188],
    [17, 168, 205],
    [229, 229, 229],
    [102, 102, 102],
    [241, 76, 76],
    [35, 209, 139],
    [245, 245, 67],
    [59, 142, 234],
    [214, 112, 214],
    [41, 184, 219],
    [255, 255, 255],
];

fn indexed_color(idx: u8) -> [u8; 3] {
    match idx {
        0..=15 => PALETTE[idx as usize],
        16..=231 => {
            const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
            let n = idx - 16;
            [
                LEVELS[(n / 36) as usize],
                LEVELS[((n % 36) / 6) as usize],
                LEVELS[(n % 6) as usize],
            ]
        }
        232..=255 => {
            let shade = 8 + (idx - 232) * 10;
            [shade; 3]
        }
    }
}

fn glyph(ch: char) -> [u8; 8] {
    BASIC_FONTS
        .get(ch)
        .or_else(|| BOX_FONTS.get(ch))
        .or_else(|| BLOCK_FONTS.get(ch))
        .or_else(|| LATIN_FONTS.get(ch))
        .or_else(|| GREEK_FONTS.get(ch))
        .or_else(|| MISC_FONTS.get(ch))
        .unwrap_or([0; 8])
}

/// Rendering attributes of one cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Style {
    pub bold: bool,
    pub underline: bool,
    pub inverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: [u8; 3],
    pub bg: [u8; 3],
    pub style: Style,
}

impl Cell {
    fn blank(fg: [u8; 3], bg: [u8; 3]) -> Self {
        Self {
            ch: ' ',
            fg,
            bg,
            style: Style::default(),
        }
    }

    /// Colour of the pixel at (`px`, `py`) inside this cell, in unscaled glyph units
    fn glyph_pixel(&self, bits: &[u8; 8], px: u32, py: u32) -> [u8; 3] {
        let (mut fg, mut bg) = (self.fg, self.bg);
        if self.style.inverse {
            std::mem::swap(&mut fg, &mut bg);
        }
        if self.style.bold {
            fg = fg.map(|c| c.saturating_add(48));
        }
        if self.style.underline && py >= GLYPH_HEIGHT - 2 {
            return fg;
        }
        // glyph rows are doubled vertically; LSB is the leftmost pixel
        let row = bits[(py / 2) as usize];
        if (row >> px) & 1 == 1 { fg } else { bg }
    }
}

/// Character grid plus cursor and pen state
#[derive(Debug, Clone)]
pub struct Screen {
    cols: u32,
    rows: u32,
    cells: Vec<Cell>,
    cursor: (u32, u32),
    saved_cursor: Option<(u32, u32)>,
    pen: Cell,
    primary: Option<Box<(Vec<Cell>, (u32, u32))>>,
}

impl Screen {
    pub fn new(cols: u32, rows: u32) -> Self {
        let pen = Cell::blank(DEFAULT_FG, DEFAULT_BG);
        Self {
            cols,
            rows,
            cells: vec![pen; (cols * rows) as usize],
            cursor: (0, 0),
            saved_cursor: None,
            pen,
            primary: None,
        }
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Width of the rendered screen in pixels
    pub fn pixel_width(&self) -> u32 {
        self.cols * CELL_WIDTH
    }

    /// Height of the rendered screen in pixels
    pub fn pixel_height(&self) -> u32 {
        self.rows * CELL_HEIGHT
    }

    pub fn cursor(&self) -> (u32, u32) {
        self.cursor
    }

    pub fn cell(&self, col: u32, row: u32) -> Option<&Cell> {
        if col < self.cols && row < self.rows {
            self.cells.get((row * self.cols + col) as usize)
        } else {
            None
        }
    }

    /// Text of one row with trailing blanks removed
    pub fn row_text(&self, row: u32) -> String {
        if row >= self.rows {
            return String::new();
        }
        let start = (row * self.cols) as usize;
        let line: String = self.cells[start..start + self.cols as usize]
            .iter()
            .map(|c| c.ch)
            .collect();
        line.trim_end().to_string()
    }

    /// All rows joined with newlines
    pub fn text(&self) -> String {
        (0..self.rows)
            .map(|r| self.row_text(r))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Rendered colour at screen pixel (`x`, `y`); `None` when off-screen
    pub fn pixel_at(&self, x: i32, y: i32) -> Option<[u8; 3]> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as u32, y as u32);
        let cell = self.cell(x / CELL_WIDTH, y / CELL_HEIGHT)?;
        let px = (x % CELL_WIDTH) / PIXEL_SCALE;
        let py = (y % CELL_HEIGHT) / PIXEL_SCALE;
        Some(cell.glyph_pixel(&glyph(cell.ch), px, py))
    }

    /// Rasterise the whole screen
    pub fn render(&self) -> RgbImage {
        let mut img = ImageBuffer::new(self.pixel_width(), self.pixel_height());
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = &self.cells[(row * self.cols + col) as usize];
                let bits = glyph(cell.ch);
                for py in 0..GLYPH_HEIGHT {
                    for px in 0..GLYPH_WIDTH {
                        let color = Rgb(cell.glyph_pixel(&bits, px, py));
                        let base_x = col * CELL_WIDTH + px * PIXEL_SCALE;
                        let base_y = row * CELL_HEIGHT + py * PIXEL_SCALE;
                        for sy in 0..PIXEL_SCALE {
                            for sx in 0..PIXEL_SCALE {
                                img.put_pixel(base_x + sx, base_y + sy, color);
                            }
                        }
                    }
                }
            }
        }
        img
    }

    fn index(&self, col: u32, row: u32) -> usize {
        (row * self.cols + col) as usize
    }

    fn put(&mut self, ch: char) {
        if self.cursor.0 >= self.cols {
            self.cursor.0 = 0;
            self.line_feed();
        }
        let (col, row) = self.cursor;
        let idx = self.index(col, row);
        self.cells[idx] = Cell { ch, ..self.pen };
        self.cursor.0 += 1;
    }

    fn line_feed(&mut self) {
        if self.cursor.1 + 1 >= self.rows {
            self.scroll_up();
        } else {
            self.cursor.1 += 1;
        }
    }

    fn scroll_up(&mut self) {
        let width = self.cols as usize;
        self.cells.drain(..width);
        let blank = Cell::blank(self.pen.fg, self.pen.bg);
        self.cells.extend(std::iter::repeat(blank).take(width));
    }

    fn move_to(&mut self, col: u32, row: u32) {
        self.cursor = (
            col.min(self.cols.saturating_sub(1)),
            row.min(self.rows.saturating_sub(1)),
        );
    }

    fn move_by(&mut self, dx: i32, dy: i32) {
        let col = (self.cursor.0 as i32 + dx).max(0) as u32;
        let row = (self.cursor.1 as i32 + dy).max(0) as u32;
        self.move_to(col, row);
    }

    fn erase(&mut self, from: usize, to: usize) {
        let blank = Cell::blank(self.pen.fg, self.pen.bg);
        let to = to.min(self.cells.len());
        for cell in &mut self.cells[from.min(to)..to] {
            *cell = blank;
        }
    }

    fn erase_display(&mut self, mode: u16) {
        let here = self.index(self.cursor.0.min(self.cols.saturating_sub(1)), self.cursor.1);
        match mode {
            0 => self.erase(here, self.cells.len()),
            1 => self.erase(0, here + 1),
            _ => self.erase(0, self.cells.len()),
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let start = self.index(0, self.cursor.1);
        let end = start + self.cols as usize;
        let here = start + self.cursor.0.min(self.cols) as usize;
        match mode {
            0 => self.erase(here, end),
            1 => self.erase(start, (here + 1).min(end)),
            _ => self.erase(start, end),
        }
    }

    fn reset(&mut self) {
        self.pen = Cell::blank(DEFAULT_FG, DEFAULT_BG);
        self.erase(0, self.cells.len());
        self.cursor = (0, 0);
        self.saved_cursor = None;
    }

    fn enter_alternate(&mut self) {
        if self.primary.is_none() {
            self.primary = Some(Box::new((self.cells.clone(), self.cursor)));
            self.erase(0, self.cells.len());
        }
    }

    fn leave_alternate(&mut self) {
        if let Some(saved) = self.primary.take() {
            let (cells, cursor) = *saved;
            self.cells = cells;
            self.cursor = cursor;
        }
    }

    fn apply_sgr(&mut self, values: &[u16]) {
        if values.is_empty() {
            self.pen = Cell::blank(DEFAULT_FG, DEFAULT_BG);
            return;
        }
        let mut i = 0;
        while i < values.len() {
            match values[i] {
                0 => self.pen = Cell::blank(DEFAULT_FG, DEFAULT_BG),
                1 => self.pen.style.bold = true,
                4 => self.pen.style.underline = true,
                7 => self.pen.style.inverse = true,
                22 => self.pen.style.bold = false,
                24 => self.pen.style.underline = false,
                27 => self.pen.style.inverse = false,
                v @ 30..=37 => self.pen.fg = PALETTE[(v - 30) as usize],
                v @ 40..=47 => self.pen.bg = PALETTE[(v - 40) as usize],
                v @ 90..=97 => self.pen.fg = PALETTE[(v - 90 + 8) as usize],
                v @ 100..=107 => self.pen.bg = PALETTE[(v - 100 + 8) as usize],
                39 => self.pen.fg = DEFAULT_FG,
                49 => self.pen.bg = DEFAULT_BG,
                v @ (38 | 48) => {
                    let color = match values.get(i + 1) {
                        Some(5) => {
                            let c = values.get(i + 2).map(|n| indexed_color(*n as u8));
                            i += 2;
                            c
                        }
                        Some(2) => {
                            let c = match values.get(i + 2..i + 5) {
                                Some([r, g, b]) => {
                                    Some([*r, *g, *b].map(|c| c.min(255) as u8))
                                }
                                _ => None,
                            };
                            i += 4;
                            c
                        }
                        _ => None,
                    };
                    if let Some(color) = color {
                        if v == 38 {
                            self.pen.fg = color;
                        } else {
                            self.pen.bg = color;
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
}

struct Performer<'a> {
    screen: &'a mut Screen,
}

fn param(params: &Params, index: usize, default: u16) -> u16 {
    params
        .iter()
        .nth(index)
        .and_then(|p| p.first().copied())
        .filter(|v| *v != 0)
        .unwrap_or(default)
}

impl Perform for Performer<'_> {
    fn print(&mut self, c: char) {
        self.screen.put(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | 0x0b | 0x0c => self.screen.line_feed(),
            b'\r' => self.screen.cursor.0 = 0,
            b'\t' => {
                let next = (self.screen.cursor.0 / 8 + 1) * 8;
                self.screen.cursor.0 = next.min(self.screen.cols.saturating_sub(1));
            }
            0x08 => self.screen.cursor.0 = self.screen.cursor.0.saturating_sub(1),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.contains(&b'?');
        let screen = &mut *self.screen;
        match action {
            'H' | 'f' => {
                let row = param(params, 0, 1) - 1;
                let col = param(params, 1, 1) - 1;
                screen.move_to(u32::from(col), u32::from(row));
            }
            'A' => screen.move_by(0, -i32::from(param(params, 0, 1))),
            'B' => screen.move_by(0, i32::from(param(params, 0, 1))),
            'C' => screen.move_by(i32::from(param(params, 0, 1)), 0),
            'D' => screen.move_by(-i32::from(param(params, 0, 1)), 0),
            'G' => {
                let col = param(params, 0, 1) - 1;
                screen.move_to(u32::from(col), screen.cursor.1);
            }
            'd' => {
                let row = param(params, 0, 1) - 1;
                screen.move_to(screen.cursor.0, u32::from(row));
            }
            'J' => screen.erase_display(param(params, 0, 0)),
            'K' => screen.erase_line(param(params, 0, 0)),
            'm' => {
                let values: Vec<u16> = params.iter().flat_map(|p| p.iter().copied()).collect();
                screen.apply_sgr(&values);
            }
            's' => screen.saved_cursor = Some(screen.cursor),
            'u' => {
                if let Some((col, row)) = screen.saved_cursor {
                    screen.move_to(col, row);
                }
            }
            'h' if private => {
                if matches!(param(params, 0, 0), 47 | 1047 | 1049) {
                    screen.enter_alternate();
                }
            }
            'l' if private => {
                if matches!(param(params, 0, 0), 47 | 1047 | 1049) {
                    screen.leave_alternate();
                }
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        match byte {
            b'7' => self.screen.saved_cursor = Some(self.screen.cursor),
            b'8' => {
                if let Some((col, row)) = self.screen.saved_cursor {
                    self.screen.move_to(col, row);
                }
            }
            b'c' => self.screen.reset(),
            _ => {}
        }
    }
}

/// Feeds terminal output into a [`Screen`]
pub struct Emulator {
    screen: Screen,
    parser: Parser,
}

impl Emulator {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            screen: Screen::new(cols, rows),
            parser: Parser::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let mut performer = Performer {
            screen: &mut self.screen,
        };
        for byte in bytes {
            self.parser.advance(&mut performer, *byte);
        }
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_wrapping() {
        let mut emu = Emulator::new(4, 2);
        emu.feed(b"abcdef");
        assert_eq!(emu.screen().row_text(0), "abcd");
        assert_eq!(emu.screen().row_text(1), "ef");
    }

    #[test]
    fn test_scrolls_at_bottom() {
        let mut emu = Emulator::new(10, 2);
        emu.feed(b"one\r\ntwo\r\nthree");
        assert_eq!(emu.screen().text(), "two\nthree");
    }

    #[test]
    fn test_cursor_addressing_and_erase() {
        let mut emu = Emulator::new(10, 3);
        emu.feed(b"xxxxxxxxxx\x1b[2;3Hhi\x1b[1;5H\x1b[K");
        assert_eq!(emu.screen().row_text(0), "xxxx");
        assert_eq!(emu.screen().row_text(1), "  hi");
        emu.feed(b"\x1b[2J");
        assert_eq!(emu.screen().text(), "\n\n");
    }

    #[test]
    fn test_pixel_reads_background_colour() {
        let mut emu = Emulator::new(4, 2);
        emu.feed(b"\x1b[41m  \x1b[0m");
        // blank cells show only background
        assert_eq!(emu.screen().pixel_at(3, 3), Some(PALETTE[1]));
        assert_eq!(emu.screen().pixel_at(CELL_WIDTH as i32 + 1, 1), Some(PALETTE[1]));
        assert_eq!(emu.screen().pixel_at(CELL_WIDTH as i32 * 2 + 1, 1), Some(DEFAULT_BG));
        assert_eq!(emu.screen().pixel_at(-1, 0), None);
        assert_eq!(emu.screen().pixel_at(0, CELL_HEIGHT as i32 * 2), None);
    }

    #[test]
    fn test_truecolor_and_indexed() {
        let mut emu = Emulator::new(3, 1);
        emu.feed(b"\x1b[48;2;10;20;30m \x1b[48;5;196m \x1b[49m ");
        let screen = emu.screen();
        assert_eq!(screen.cell(0, 0).map(|c| c.bg), Some([10, 20, 30]));
        assert_eq!(screen.cell(1, 0).map(|c| c.bg), Some([255, 0, 0]));
        assert_eq!(screen.cell(2, 0).map(|c| c.bg), Some(DEFAULT_BG));
    }

    #[test]
    fn test_render_matches_pixel_reads() {
        let mut emu = Emulator::new(3, 1);
        emu.feed(b"\x1b[32mA\x1b[7mB");
        let img = emu.screen().render();
        assert_eq!(img.width(), 3 * CELL_WIDTH);
        assert_eq!(img.height(), CELL_HEIGHT);
        for (x, y) in [(0, 0), (5, 9), (20, 14), (40, 31)] {
            assert_eq!(
                Some(img.get_pixel(x, y).0),
                emu.screen().pixel_at(x as i32, y as i32)
            );
        }
    }

    #[test]
    fn test_alternate_screen_restores_primary() {
        let mut emu = Emulator::new(6, 2);
        emu.feed(b"shell");
        emu.feed(b"\x1b[?1049h\x1b[HTUI");
        assert_eq!(emu.screen().row_text(0), "TUI");
        emu.feed(b"\x1b[?1049l");
        assert_eq!(emu.screen().row_text(0), "shell");
    }
}
