//! Core integration layer for oxidized-xenon
//!
//! This crate ties the subsystems together into an [`Emulator`]: ordered
//! setup, the title launch pipeline, pause/resume over guest threads,
//! guest crash routing and whole-machine snapshots.

pub mod emulator;
pub mod events;
pub mod snapshot;
pub mod systems;

pub use emulator::{Emulator, RunState, Subsystems};
pub use events::{EmulatorEvent, EventBus, LogMessageSink, MessageSink};
pub use systems::{AudioSystem, GraphicsSystem, InputSystem, NullAudio, NullGraphics, NullInput};
