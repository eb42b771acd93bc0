//! Voice I/O core for a wearable: one half-duplex audio bus shared between
//! wake-word capture, command recording and speech playback.

pub mod audio;
pub mod audio_bridge;
pub mod config;
pub mod control_bridge;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod services;

pub use error::{Error, Result};
