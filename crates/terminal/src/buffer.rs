//! Render buffer backed by alacritty_terminal
//!
//! Holds the emulated grid (screen plus scrollback) that terminal output is
//! written into. Exposes the narrow surface the multiplexer needs: write
//! text, clear, read back buffered lines, and query/restore the scroll
//! position.

use std::sync::Arc;

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::{Dimensions, Scroll};
use alacritty_terminal::index::Line;
use alacritty_terminal::sync::FairMutex;
use alacritty_terminal::term::Config as TermConfig;
use alacritty_terminal::term::Term;
use alacritty_terminal::vte::ansi;

use thiserror::Error;

/// Default scrollback kept by a render buffer
pub const DEFAULT_SCROLLBACK: usize = 10_000;

/// Sequence that wipes both the scrollback (`ESC [3J`) and the screen (`ESC c`)
const CLEAR_SEQUENCE: &[u8] = b"\x1b[3J\x1bc";

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer dimensions must be non-zero (got {cols}x{rows})")]
    InvalidSize { cols: u16, rows: u16 },
}

/// Events raised by the emulator while processing output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    /// Bytes the emulator wants sent back to the process (e.g. DA responses)
    Reply(String),

    /// Window title change
    Title(String),

    /// Bell character
    Bell,
}

/// Forwards alacritty events into a channel drained by `poll_events`
pub struct BufferEventProxy {
    sender: std::sync::mpsc::Sender<BufferEvent>,
}

impl EventListener for BufferEventProxy {
    fn send_event(&self, event: Event) {
        let event = match event {
            Event::PtyWrite(text) => BufferEvent::Reply(text),
            Event::Title(title) => BufferEvent::Title(title),
            Event::Bell => BufferEvent::Bell,
            _ => return,
        };
        let _ = self.sender.send(event);
    }
}

/// Simple size struct implementing Dimensions
struct Size {
    cols: usize,
    rows: usize,
}

impl Dimensions for Size {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// Emulator state guarded together so the parser always advances the term it belongs to
struct Emulator {
    term: Term<BufferEventProxy>,
    parser: ansi::Processor,
}

impl Emulator {
    fn advance(&mut self, data: &[u8]) {
        for byte in data {
            self.parser.advance(&mut self.term, *byte);
        }
    }
}

/// A terminal render buffer
pub struct RenderBuffer {
    emulator: Arc<FairMutex<Emulator>>,
    events: std::sync::mpsc::Receiver<BufferEvent>,
    cols: u16,
    rows: u16,
}

impl RenderBuffer {
    /// Create a buffer with the default scrollback
    pub fn new(cols: u16, rows: u16) -> Result<Self, BufferError> {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK)
    }

    /// Create a buffer keeping up to `scrollback` lines of history
    pub fn with_scrollback(cols: u16, rows: u16, scrollback: usize) -> Result<Self, BufferError> {
        if cols == 0 || rows == 0 {
            return Err(BufferError::InvalidSize { cols, rows });
        }

        let (sender, events) = std::sync::mpsc::channel();
        let config = TermConfig {
            scrolling_history: scrollback,
            ..TermConfig::default()
        };
        let size = Size {
            cols: cols as usize,
            rows: rows as usize,
        };
        let term = Term::new(config, &size, BufferEventProxy { sender });

        Ok(Self {
            emulator: Arc::new(FairMutex::new(Emulator {
                term,
                parser: ansi::Processor::new(),
            })),
            events,
            cols,
            rows,
        })
    }

    /// Feed text through the emulator
    pub fn write(&self, text: &str) {
        self.emulator.lock().advance(text.as_bytes());
    }

    /// Feed raw bytes through the emulator
    pub fn write_bytes(&self, data: &[u8]) {
        self.emulator.lock().advance(data);
    }

    /// Drop all screen and scrollback content
    pub fn clear(&self) {
        self.emulator.lock().advance(CLEAR_SEQUENCE);
    }

    /// Every buffered line, scrollback first, with trailing blanks trimmed
    ///
    /// Trailing empty lines (unused screen rows below the cursor) are not
    /// returned.
    pub fn lines(&self) -> Vec<String> {
        let emulator = self.emulator.lock();
        let grid = emulator.term.grid();

        let mut lines = Vec::new();
        for line_idx in grid.topmost_line().0..=grid.bottommost_line().0 {
            let row = &grid[Line(line_idx)];
            let mut text = String::new();
            for cell in row.into_iter() {
                let c = cell.c;
                if c == '\0' {
                    text.push(' ');
                } else {
                    text.push(c);
                }
            }
            lines.push(text.trim_end().to_string());
        }

        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }

    /// Scrollback lines currently held above the screen
    pub fn history_size(&self) -> usize {
        self.emulator.lock().term.grid().history_size()
    }

    /// Current display offset (0 = following live output)
    pub fn display_offset(&self) -> usize {
        self.emulator.lock().term.grid().display_offset()
    }

    /// Index of the first visible line, counted from the top of the scrollback
    pub fn top_line(&self) -> usize {
        let emulator = self.emulator.lock();
        let grid = emulator.term.grid();
        grid.history_size().saturating_sub(grid.display_offset())
    }

    /// Scroll so that `line` (counted from the top of the scrollback) is the
    /// first visible line, clamped to the available history
    pub fn scroll_to_line(&self, line: usize) {
        let mut emulator = self.emulator.lock();
        let history = emulator.term.grid().history_size();
        let current = emulator.term.grid().display_offset() as i64;
        let target = history.saturating_sub(line) as i64;
        let delta = (target - current).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        if delta != 0 {
            emulator.term.scroll_display(Scroll::Delta(delta));
        }
    }

    /// Buffer dimensions as (cols, rows)
    pub fn dimensions(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Drain events raised since the last call
    pub fn poll_events(&self) -> impl Iterator<Item = BufferEvent> + '_ {
        self.events.try_iter()
    }
}
