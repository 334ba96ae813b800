//! Player error types.

use std::path::PathBuf;

use thiserror::Error;

use super::protocol::CommandKind;
use crate::persist::PersistError;

/// Errors that can occur while controlling a player subprocess.
#[derive(Debug, Error)]
pub enum PlayerError {
  #[error("No sound file is associated with this transcript")]
  NoSoundFile,

  #[error("Cannot read sound file {}: {source}", path.display())]
  UnreadableFile {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("No player protocol matches {}", file.display())]
  UnknownProtocol { file: PathBuf },

  #[error("Player executable not found: {program}")]
  ProgramNotFound { program: String },

  #[error("Failed to spawn {program}: {source}")]
  SpawnFailed {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("Write to player failed: {0}")]
  WriteFailed(#[from] std::io::Error),

  #[error("Player did not answer {0} in time")]
  QueryTimeout(CommandKind),

  #[error("Command {command} is missing argument {index}")]
  MissingArgument { command: CommandKind, index: usize },

  #[error("Player is not running")]
  NotRunning,

  #[error("Could not save position: {0}")]
  Persist(#[from] PersistError),
}
