//! Screen snapshots for resync
//!
//! A snapshot redraws the visible screen from scratch: reset, clear, home,
//! every cell row by row, then the cursor. Colour changes are only emitted
//! where the rendered colours actually change.

use crate::error::{RelayError, Result};
use crate::screen::{Color, ScreenModel};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt::Write as _;
use std::io::{Read, Write};

const PREAMBLE: &str = "\x1b[0m\x1b[2J\x1b[H";
const RESET: &str = "\x1b[0m";

/// Render the visible screen as control sequences
pub fn generate_snapshot(screen: &dyn ScreenModel) -> Vec<u8> {
    let (rows, cols) = screen.size();
    let mut out = String::with_capacity(rows as usize * (cols as usize + 2) + 64);
    out.push_str(PREAMBLE);

    let mut current = (Color::Default, Color::Default);
    for row in 0..rows {
        for col in 0..cols {
            let Some(cell) = screen.cell(row, col) else {
                out.push(' ');
                continue;
            };
            if cell.wide_continuation {
                continue;
            }

            if (cell.fg, cell.bg) != current {
                push_sgr(&mut out, cell.fg, cell.bg);
                current = (cell.fg, cell.bg);
            }

            if cell.text.is_empty() {
                out.push(' ');
            } else {
                out.push_str(&cell.text);
            }
        }
        if row + 1 < rows {
            out.push_str("\r\n");
        }
    }

    out.push_str(RESET);
    let (cursor_row, cursor_col) = screen.cursor();
    let _ = write!(out, "\x1b[{};{}H", cursor_row + 1, cursor_col + 1);

    out.into_bytes()
}

fn push_sgr(out: &mut String, fg: Color, bg: Color) {
    out.push_str("\x1b[");
    push_color(out, fg, false);
    out.push(';');
    push_color(out, bg, true);
    out.push('m');
}

fn push_color(out: &mut String, color: Color, background: bool) {
    let _ = match (color, background) {
        (Color::Default, false) => write!(out, "39"),
        (Color::Default, true) => write!(out, "49"),
        (Color::Indexed(i), false) if i < 8 => write!(out, "{}", 30 + i as u16),
        (Color::Indexed(i), true) if i < 8 => write!(out, "{}", 40 + i as u16),
        (Color::Indexed(i), false) if i < 16 => write!(out, "{}", 90 + (i - 8) as u16),
        (Color::Indexed(i), true) if i < 16 => write!(out, "{}", 100 + (i - 8) as u16),
        (Color::Indexed(i), false) => write!(out, "38;5;{}", i),
        (Color::Indexed(i), true) => write!(out, "48;5;{}", i),
        (Color::Rgb(r, g, b), false) => write!(out, "38;2;{};{};{}", r, g, b),
        (Color::Rgb(r, g, b), true) => write!(out, "48;2;{};{};{}", r, g, b),
    };
}

/// Gzip a resync payload
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RelayError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| RelayError::Compression(e.to_string()))
}

/// Inverse of [`compress`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| RelayError::Compression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::Vt100Screen;

    #[test]
    fn test_snapshot_of_blank_screen() {
        let screen = Vt100Screen::new(2, 3);
        let snap = String::from_utf8(generate_snapshot(&screen)).unwrap();
        assert_eq!(snap, "\x1b[0m\x1b[2J\x1b[H   \r\n   \x1b[0m\x1b[1;1H");
    }

    #[test]
    fn test_colour_emitted_only_on_change() {
        let mut screen = Vt100Screen::new(1, 6);
        screen.process(b"\x1b[31mab\x1b[0mcd");
        let snap = String::from_utf8(generate_snapshot(&screen)).unwrap();
        assert_eq!(
            snap,
            "\x1b[0m\x1b[2J\x1b[H\x1b[31;49mab\x1b[39;49mcd  \x1b[0m\x1b[1;5H"
        );
        assert_eq!(snap.matches("\x1b[31;49m").count(), 1);
    }

    #[test]
    fn test_cursor_position_is_restored() {
        let mut screen = Vt100Screen::new(5, 10);
        screen.process(b"\x1b[3;7H");
        let snap = String::from_utf8(generate_snapshot(&screen)).unwrap();
        assert!(snap.ends_with("\x1b[0m\x1b[3;7H"));
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let mut screen = Vt100Screen::new(10, 20);
        screen.process(b"\x1b[1;32mbuild ok\x1b[0m\r\n\x1b[44m  $ \x1b[0m");
        let first = generate_snapshot(&screen);
        let second = generate_snapshot(&screen);
        assert_eq!(first, second);
        assert_eq!(compress(&first).unwrap(), compress(&second).unwrap());
    }

    #[test]
    fn test_snapshot_replays_to_same_screen() {
        let mut screen = Vt100Screen::new(6, 30);
        screen.process(b"one\r\n\x1b[35mtwo\x1b[0m\r\n\x1b[48;5;200mthree\x1b[0m\x1b[2;2H");
        let snap = generate_snapshot(&screen);

        let mut replayed = Vt100Screen::new(6, 30);
        replayed.process(&snap);
        for row in 0..6 {
            for col in 0..30 {
                let a = screen.cell(row, col).unwrap();
                let b = replayed.cell(row, col).unwrap();
                assert_eq!(a.fg, b.fg, "fg at {},{}", row, col);
                assert_eq!(a.bg, b.bg, "bg at {},{}", row, col);
                let a_text = if a.text.is_empty() { " ".to_string() } else { a.text };
                let b_text = if b.text.is_empty() { " ".to_string() } else { b.text };
                assert_eq!(a_text, b_text, "text at {},{}", row, col);
            }
        }
        assert_eq!(replayed.cursor(), screen.cursor());
    }

    #[test]
    fn test_wide_characters_are_not_padded() {
        let mut screen = Vt100Screen::new(1, 4);
        screen.process("日x".as_bytes());
        let snap = String::from_utf8(generate_snapshot(&screen)).unwrap();
        assert!(snap.contains("日x "));
    }

    #[test]
    fn test_compress_round_trip() {
        let data = b"\x1b[2J hello hello hello".repeat(50);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }
}
