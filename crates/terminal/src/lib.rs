//! Process and render-buffer plumbing for terminal sessions
//!
//! `pty` spawns the process backing a session; `buffer` is the emulated grid
//! its output is rendered into.

pub mod buffer;
pub mod pty;

pub use buffer::{BufferError, BufferEvent, RenderBuffer};
pub use pty::{Pty, PtyCommand, PtyError};
