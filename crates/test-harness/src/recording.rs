//! Render handle that records what it is asked to do

use std::cell::{Cell, RefCell};

use multiplexer::render::{RenderError, RenderHandle, ScrollPosition, TERMINAL_RESET_SEQUENCE};

#[derive(Default)]
pub struct RecordingRender {
    /// Text written since the last clear, minus reset sequences
    contents: RefCell<String>,
    writes: RefCell<Vec<String>>,
    clears: Cell<usize>,
    scroll: Cell<ScrollPosition>,
    scrolled_to: RefCell<Vec<usize>>,
    size: Cell<(u16, u16)>,
    fail_writes: Cell<bool>,
}

impl RecordingRender {
    pub fn new() -> Self {
        Self {
            size: Cell::new((80, 24)),
            ..Self::default()
        }
    }

    pub fn contents(&self) -> String {
        self.contents.borrow().clone()
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.borrow().len()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.get()
    }

    pub fn set_scroll(&self, y: usize) {
        self.scroll.set(ScrollPosition { x: 0, y });
    }

    pub fn scrolled_to(&self) -> Vec<usize> {
        self.scrolled_to.borrow().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }
}

impl RenderHandle for RecordingRender {
    fn write(&self, text: &str) -> Result<(), RenderError> {
        if self.fail_writes.get() {
            return Err(RenderError::Write("recording render set to fail".into()));
        }
        self.writes.borrow_mut().push(text.to_string());
        self.contents
            .borrow_mut()
            .push_str(&text.replace(TERMINAL_RESET_SEQUENCE, ""));
        Ok(())
    }

    fn clear(&self) {
        self.clears.set(self.clears.get() + 1);
        self.contents.borrow_mut().clear();
    }

    fn buffer_lines(&self) -> Result<Vec<String>, RenderError> {
        Ok(self
            .contents
            .borrow()
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect())
    }

    fn scroll_position(&self) -> ScrollPosition {
        self.scroll.get()
    }

    fn scroll_to_line(&self, line: usize) {
        self.scrolled_to.borrow_mut().push(line);
        self.scroll.set(ScrollPosition { x: 0, y: line });
    }

    fn size(&self) -> (u16, u16) {
        self.size.get()
    }
}
