//! The narrow view of a render buffer the core depends on

use serde::{Deserialize, Serialize};
use thiserror::Error;

use terminal::RenderBuffer;

/// Written after clearing a suspended terminal's buffer: full reset, cursor
/// shown, mouse reporting off, attributes reset
pub const TERMINAL_RESET_SEQUENCE: &str =
    "\x1bc\x1b[?25h\x1b[?1000l\x1b[?1002l\x1b[?1003l\x1b[?1006l\x1b[0m";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("render buffer unavailable: {0}")]
    Unavailable(String),

    #[error("render write failed: {0}")]
    Write(String),
}

/// Scroll position of a render buffer
///
/// `y` is the first visible line counted from the top of the scrollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: usize,
    pub y: usize,
}

/// A render buffer as seen by the write queue and the suspension manager
pub trait RenderHandle {
    fn write(&self, text: &str) -> Result<(), RenderError>;

    /// Drop all screen and scrollback content
    fn clear(&self);

    /// Every buffered line, scrollback first
    fn buffer_lines(&self) -> Result<Vec<String>, RenderError>;

    fn scroll_position(&self) -> ScrollPosition;

    fn scroll_to_line(&self, line: usize);

    /// (cols, rows)
    fn size(&self) -> (u16, u16);
}

impl RenderHandle for RenderBuffer {
    fn write(&self, text: &str) -> Result<(), RenderError> {
        RenderBuffer::write(self, text);
        Ok(())
    }

    fn clear(&self) {
        RenderBuffer::clear(self);
    }

    fn buffer_lines(&self) -> Result<Vec<String>, RenderError> {
        Ok(self.lines())
    }

    fn scroll_position(&self) -> ScrollPosition {
        ScrollPosition {
            x: 0,
            y: self.top_line(),
        }
    }

    fn scroll_to_line(&self, line: usize) {
        RenderBuffer::scroll_to_line(self, line);
    }

    fn size(&self) -> (u16, u16) {
        self.dimensions()
    }
}
