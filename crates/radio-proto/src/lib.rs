//! Shared types for the radio daemon and its playback engine: station list,
//! player state vocabulary, wire protocol, configuration and platform paths.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod state;
