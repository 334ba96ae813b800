use std::fmt;

use thiserror::Error;

use crate::config::AppConfig;
use crate::player::{PlaybackStatus, PlayerError, PlayerSession};
use crate::timefmt::{format_position, parse_seconds};

const SHORT_STEP: i64 = 5;
const MINUTE_STEP: i64 = 60;
const HOUR_STEP: i64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
  #[error("Unknown command: {0}")]
  Unknown(String),

  #[error("{command} needs an argument")]
  MissingArgument { command: &'static str },

  #[error("Invalid argument for {command}: {value:?}")]
  InvalidArgument { command: &'static str, value: String },
}

/// A command typed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
  Play,
  Rewind,
  Home,
  End,
  Skip(i64),
  Seek(i64),
  Stamp,
  Length,
  Position,
  Status,
  Quit,
}

impl HostCommand {
  /// Parse one input line. Blank lines yield `None`.
  pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
      return Ok(None);
    };
    let arg = words.next();

    let command = match name.to_ascii_lowercase().as_str() {
      "play" => Self::Play,
      "rewind" => Self::Rewind,
      "home" => Self::Home,
      "end" => Self::End,
      "fwd" => Self::Skip(SHORT_STEP),
      "back" => Self::Skip(-SHORT_STEP),
      "min+" => Self::Skip(MINUTE_STEP),
      "min-" => Self::Skip(-MINUTE_STEP),
      "hour+" => Self::Skip(HOUR_STEP),
      "hour-" => Self::Skip(-HOUR_STEP),
      "skip" => {
        let value = arg.ok_or(CommandError::MissingArgument { command: "skip" })?;
        let offset = value
          .strip_prefix('+')
          .unwrap_or(value)
          .parse()
          .map_err(|_| CommandError::InvalidArgument {
            command: "skip",
            value: value.to_string(),
          })?;
        Self::Skip(offset)
      }
      "seek" => {
        let value = arg.ok_or(CommandError::MissingArgument { command: "seek" })?;
        let target = parse_seconds(value)
          .and_then(|s| i64::try_from(s).ok())
          .ok_or_else(|| CommandError::InvalidArgument {
            command: "seek",
            value: value.to_string(),
          })?;
        Self::Seek(target)
      }
      "stamp" => Self::Stamp,
      "length" => Self::Length,
      "pos" => Self::Position,
      "status" => Self::Status,
      "quit" => Self::Quit,
      _ => return Err(CommandError::Unknown(name.to_string())),
    };
    Ok(Some(command))
  }

  pub fn is_quit(&self) -> bool {
    matches!(self, Self::Quit)
  }

  /// Run the command against a session. Returns text to show the user, if any.
  pub async fn execute(
    &self,
    session: &PlayerSession,
    config: &AppConfig,
  ) -> Result<Option<String>, PlayerError> {
    log::debug!("Executing {:?}", self);
    let moved = match *self {
      Self::Play => {
        session.toggle_play().await?;
        return Ok(None);
      }
      Self::Rewind => session.skip(-i64::from(config.rewind_seconds)).await?,
      Self::Home => session.seek(0).await?,
      Self::End => {
        if session.status() == PlaybackStatus::Null {
          false
        } else {
          let length = session.query_length().await?;
          let target = length
            .saturating_sub(i64::from(config.end_margin_seconds))
            .max(0);
          session.seek(target).await?
        }
      }
      Self::Skip(offset) => session.skip(offset).await?,
      Self::Seek(target) => session.seek(target).await?,
      Self::Stamp => return Ok(Some(format!("[{}]", session.position_display()))),
      Self::Length => {
        let length = session.query_length().await?;
        return Ok(Some(format_position(length)));
      }
      Self::Position => {
        let position = session.query_position().await?;
        return Ok(Some(format_position(position)));
      }
      Self::Status => return Ok(Some(status_line(session))),
      Self::Quit => {
        session.quit().await?;
        return Ok(None);
      }
    };

    if moved {
      Ok(None)
    } else {
      Ok(Some("No player running".to_string()))
    }
  }
}

impl fmt::Display for HostCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Play => f.write_str("play"),
      Self::Rewind => f.write_str("rewind"),
      Self::Home => f.write_str("home"),
      Self::End => f.write_str("end"),
      Self::Skip(offset) => write!(f, "skip {:+}", offset),
      Self::Seek(target) => write!(f, "seek {}", target),
      Self::Stamp => f.write_str("stamp"),
      Self::Length => f.write_str("length"),
      Self::Position => f.write_str("pos"),
      Self::Status => f.write_str("status"),
      Self::Quit => f.write_str("quit"),
    }
  }
}

fn status_line(session: &PlayerSession) -> String {
  let snapshot = session.snapshot();
  let status = match snapshot.status {
    PlaybackStatus::Null => "stopped",
    PlaybackStatus::Idle => "paused",
    PlaybackStatus::Playing => "playing",
  };
  let mut line = format!(
    "{} {} / {}",
    status,
    snapshot.position_display,
    format_position(snapshot.length)
  );
  if let Some(protocol) = &snapshot.protocol {
    line.push_str(&format!(" [{}]", protocol));
  }
  line
}
