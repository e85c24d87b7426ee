//! ttyshare protocol - pure wire types shared by the server and viewers
//!
//! This crate has no async runtime dependencies. It defines:
//! - Binary frame parsing (resize, upload, chunk, raw input)
//! - The chunked resync codec
//! - JSON control messages in both directions

pub mod chunk;
pub mod error;
pub mod frame;
pub mod message;

pub use chunk::*;
pub use error::*;
pub use frame::*;
pub use message::*;

use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Component-wise minimum of two sizes
    pub fn min(self, other: TermSize) -> TermSize {
        TermSize {
            rows: self.rows.min(other.rows),
            cols: self.cols.min(other.cols),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

impl Default for TermSize {
    fn default() -> Self {
        DEFAULT_TERM_SIZE
    }
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Size applied when no viewer has reported one
pub const DEFAULT_TERM_SIZE: TermSize = TermSize { rows: 24, cols: 80 };

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_is_componentwise() {
        let a = TermSize::new(40, 80);
        let b = TermSize::new(24, 100);
        assert_eq!(a.min(b), TermSize::new(24, 80));
        assert_eq!(b.min(a), TermSize::new(24, 80));
    }

    #[test]
    fn test_default_is_80x24() {
        let size = TermSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert_eq!(size.to_string(), "80x24");
    }
}
