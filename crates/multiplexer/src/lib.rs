//! Terminal output multiplexing core
//!
//! Streams the output of many terminal sessions into render buffers while
//! bounding memory and render work:
//!
//! - `transport` talks to the process layer (`host`) over either a push-style
//!   or a sequenced subscribe/ack protocol
//! - `output_stream` hydrates and dispatches decoded text per terminal
//! - `write_queue` smooths bursts between dispatch and the render buffer
//! - `visibility` and `suspension` release render buffers of terminals that
//!   are off screen, keeping a text snapshot to replay later
//!
//! `multiplexer::Multiplexer` wires these together. Everything runs on one
//! calloop event loop (`runtime`).

pub mod config;
pub mod decoder;
pub mod error;
pub mod host;
pub mod multiplexer;
pub mod output_stream;
pub mod render;
pub mod runtime;
pub mod suspension;
pub mod transport;
pub mod visibility;
pub mod wire;
pub mod write_queue;

pub use config::Config;
pub use error::{MultiplexerError, StreamError, TransportError};
pub use multiplexer::Multiplexer;
pub use runtime::LoopContext;
pub use wire::{TerminalId, TransportKind};
