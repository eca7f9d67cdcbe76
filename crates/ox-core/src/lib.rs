//! Core emulator logic for the oxidized-xenon Xbox 360 emulator
//!
//! This crate provides the foundational types, error handling,
//! configuration, logging, guest clock and snapshot stream infrastructure
//! shared by every other subsystem.

pub mod byte_stream;
pub mod clock;
pub mod config;
pub mod debugging;
pub mod error;
pub mod logging;

pub use byte_stream::{ByteReader, ByteWriter};
pub use config::Config;
pub use error::{EmulatorError, Result};
