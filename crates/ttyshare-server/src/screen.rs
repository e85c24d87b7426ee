//! Screen model: the terminal emulator the session drives
//!
//! The session only needs "consume bytes, expose a sized cell grid and a
//! cursor", so emulation sits behind [`ScreenModel`]. [`Vt100Screen`] backs it
//! with the `vt100` crate.

/// Cell colour as rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// Read-only view of one grid cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellView {
    /// Grapheme in the cell; empty when nothing was drawn there
    pub text: String,
    pub fg: Color,
    pub bg: Color,
    /// Right half of a double-width character
    pub wide_continuation: bool,
}

impl Default for CellView {
    fn default() -> Self {
        Self {
            text: String::new(),
            fg: Color::Default,
            bg: Color::Default,
            wide_continuation: false,
        }
    }
}

/// Terminal emulation capability
pub trait ScreenModel: Send + Sync {
    /// Feed raw output bytes
    fn process(&mut self, bytes: &[u8]);

    fn resize(&mut self, rows: u16, cols: u16);

    /// (rows, cols)
    fn size(&self) -> (u16, u16);

    /// Zero-based (row, col)
    fn cursor(&self) -> (u16, u16);

    fn cell(&self, row: u16, col: u16) -> Option<CellView>;
}

/// [`ScreenModel`] over `vt100::Parser`
pub struct Vt100Screen {
    parser: vt100::Parser,
}

impl Vt100Screen {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            // Scrollback lives in the ring buffer, not here
            parser: vt100::Parser::new(rows, cols, 0),
        }
    }
}

impl From<vt100::Color> for Color {
    fn from(color: vt100::Color) -> Self {
        match color {
            vt100::Color::Default => Color::Default,
            vt100::Color::Idx(idx) => Color::Indexed(idx),
            vt100::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
        }
    }
}

impl ScreenModel for Vt100Screen {
    fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    fn cursor(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    fn cell(&self, row: u16, col: u16) -> Option<CellView> {
        let cell = self.parser.screen().cell(row, col)?;
        Some(CellView {
            text: cell.contents(),
            fg: cell.fgcolor().into(),
            bg: cell.bgcolor().into(),
            wide_continuation: cell.is_wide_continuation(),
        })
    }
}
