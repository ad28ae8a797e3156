//! Test harness for termplex
//!
//! Drives the multiplexer on a real calloop event loop without real
//! processes.
//!
//! # Modules
//!
//! - `headless`: Event loop driver (`Harness`) and the wired-up `TestMultiplexer`
//! - `scripted`: Fake processes whose output the test controls
//! - `flaky`: Process layer wrapper that injects failures and delays
//! - `recording`: Render handle that records every call
//! - `assertions`: Common test assertions
//! - `fixtures`: Test fixture helpers

pub mod assertions;
pub mod fixtures;
pub mod flaky;
pub mod headless;
pub mod recording;
pub mod scripted;

pub use flaky::FlakyLayer;
pub use headless::{Harness, TestMultiplexer};
pub use recording::RecordingRender;
pub use scripted::{ScriptHandle, ScriptedSpawner};
