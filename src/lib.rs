//! Control core for driving an external media player while transcribing.
//!
//! A [`PlayerSession`] owns one player process per transcript document. Hosts
//! implement [`TranscriptHost`] to receive display refreshes and notices, and
//! supply a [`PositionStore`] that keeps the saved playback markers.

mod cli;
mod command;
mod config;
mod host;
mod persist;
mod player;
mod timefmt;

pub use cli::{run, Args, ConsoleHost};
pub use command::{CommandError, HostCommand};
pub use config::{AppConfig, ConfigError, PatternEntry, PlayerOverride};
pub use host::{Notice, NullHost, PlaybackSnapshot, RefreshThrottle, TranscriptHost};
pub use persist::{
  DocumentHeaderStore, MemoryStore, PersistError, PositionStore, SavedMarkers, CURSOR_FIELD,
  POSITION_FIELD, SOUND_FILE_FIELD,
};
pub use player::*;
pub use timefmt::{format_position, format_time, parse_seconds};
