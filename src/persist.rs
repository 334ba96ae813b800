//! Saved playback markers kept in the transcript document.
//!
//! A transcript starts with a block of `Key: value` lines ended by the first
//! blank line. The player reads and writes three of them:
//!
//! ```text
//! Sound-File: interview.wav
//! Playback-Position: 00:12:41
//! Cursor-Position: 5120
//!
//! Q: So when did you first ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::timefmt::{format_position, parse_seconds};

pub const SOUND_FILE_FIELD: &str = "Sound-File";
pub const POSITION_FIELD: &str = "Playback-Position";
pub const CURSOR_FIELD: &str = "Cursor-Position";

/// Errors reading or writing saved markers.
#[derive(Debug, Error)]
pub enum PersistError {
  #[error("Cannot access {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{} has no {field} header field", path.display())]
  MissingField { field: &'static str, path: PathBuf },

  #[error("Invalid {field} value {value:?}")]
  InvalidValue { field: &'static str, value: String },
}

/// Position markers persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedMarkers {
  pub sound_file: Option<PathBuf>,
  pub position: i64,
  pub cursor: u64,
}

/// Where a session loads and saves its markers.
pub trait PositionStore: Send + Sync {
  fn load(&self) -> Result<SavedMarkers, PersistError>;
  fn save(&self, markers: &SavedMarkers) -> Result<(), PersistError>;
}

/// Markers held in memory, for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
  markers: Mutex<SavedMarkers>,
}

impl MemoryStore {
  pub fn new(markers: SavedMarkers) -> Self {
    Self {
      markers: Mutex::new(markers),
    }
  }

  pub fn markers(&self) -> SavedMarkers {
    self.markers.lock().clone()
  }
}

impl PositionStore for MemoryStore {
  fn load(&self) -> Result<SavedMarkers, PersistError> {
    Ok(self.markers.lock().clone())
  }

  fn save(&self, markers: &SavedMarkers) -> Result<(), PersistError> {
    let mut stored = self.markers.lock();
    stored.position = markers.position;
    stored.cursor = markers.cursor;
    Ok(())
  }
}

/// Markers stored in the header block of a transcript text file.
#[derive(Debug, Clone)]
pub struct DocumentHeaderStore {
  path: PathBuf,
}

impl DocumentHeaderStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Create the document with an empty marker header unless it already exists.
  pub fn create_if_missing(&self, sound_file: Option<&Path>) -> Result<bool, PersistError> {
    if self.path.exists() {
      return Ok(false);
    }
    let mut header = String::new();
    if let Some(sound_file) = sound_file {
      header.push_str(&format!("{}: {}\n", SOUND_FILE_FIELD, sound_file.display()));
    }
    header.push_str(&format!("{}: {}\n", POSITION_FIELD, format_position(0)));
    header.push_str(&format!("{}: 0\n\n", CURSOR_FIELD));
    fs::write(&self.path, header).map_err(|source| self.io_error(source))?;
    log::info!("Created transcript {}", self.path.display());
    Ok(true)
  }

  fn io_error(&self, source: std::io::Error) -> PersistError {
    PersistError::Io {
      path: self.path.clone(),
      source,
    }
  }

  fn read(&self) -> Result<String, PersistError> {
    fs::read_to_string(&self.path).map_err(|source| self.io_error(source))
  }

  fn resolve_sound_file(&self, value: &str) -> PathBuf {
    let file = PathBuf::from(value);
    if file.is_absolute() {
      return file;
    }
    match self.path.parent() {
      Some(dir) if !dir.as_os_str().is_empty() => dir.join(file),
      _ => file,
    }
  }
}

/// Split a header line into its key and value.
fn header_field(line: &str) -> Option<(&str, &str)> {
  let (key, value) = line.split_once(':')?;
  let key = key.trim();
  if key.is_empty() || key.contains(char::is_whitespace) {
    return None;
  }
  Some((key, value.trim()))
}

fn header_lines(text: &str) -> impl Iterator<Item = &str> {
  text
    .split_inclusive('\n')
    .take_while(|line| !line.trim().is_empty())
}

impl PositionStore for DocumentHeaderStore {
  fn load(&self) -> Result<SavedMarkers, PersistError> {
    let text = self.read()?;
    let mut markers = SavedMarkers::default();

    for line in header_lines(&text) {
      let Some((key, value)) = header_field(line) else {
        continue;
      };
      if key.eq_ignore_ascii_case(SOUND_FILE_FIELD) && !value.is_empty() {
        markers.sound_file = Some(self.resolve_sound_file(value));
      } else if key.eq_ignore_ascii_case(POSITION_FIELD) {
        markers.position = parse_seconds(value)
          .and_then(|s| i64::try_from(s).ok())
          .ok_or_else(|| PersistError::InvalidValue {
            field: POSITION_FIELD,
            value: value.to_string(),
          })?;
      } else if key.eq_ignore_ascii_case(CURSOR_FIELD) {
        markers.cursor = value.parse().map_err(|_| PersistError::InvalidValue {
          field: CURSOR_FIELD,
          value: value.to_string(),
        })?;
      }
    }

    log::debug!("Loaded markers from {}: {:?}", self.path.display(), markers);
    Ok(markers)
  }

  fn save(&self, markers: &SavedMarkers) -> Result<(), PersistError> {
    let text = self.read()?;
    let header_len: usize = header_lines(&text).map(str::len).sum();
    let (header, body) = text.split_at(header_len);

    let mut saw_position = false;
    let mut saw_cursor = false;
    let mut rewritten = String::with_capacity(text.len() + 16);

    for line in header.split_inclusive('\n') {
      let ending = if line.ends_with("\r\n") {
        "\r\n"
      } else if line.ends_with('\n') {
        "\n"
      } else {
        ""
      };
      match header_field(line) {
        Some((key, _)) if key.eq_ignore_ascii_case(POSITION_FIELD) => {
          saw_position = true;
          rewritten.push_str(&format!(
            "{}: {}{}",
            key,
            format_position(markers.position),
            ending
          ));
        }
        Some((key, _)) if key.eq_ignore_ascii_case(CURSOR_FIELD) => {
          saw_cursor = true;
          rewritten.push_str(&format!("{}: {}{}", key, markers.cursor, ending));
        }
        _ => rewritten.push_str(line),
      }
    }

    if !saw_position {
      return Err(PersistError::MissingField {
        field: POSITION_FIELD,
        path: self.path.clone(),
      });
    }
    if !saw_cursor {
      return Err(PersistError::MissingField {
        field: CURSOR_FIELD,
        path: self.path.clone(),
      });
    }

    rewritten.push_str(body);
    fs::write(&self.path, rewritten).map_err(|source| self.io_error(source))?;
    log::info!(
      "Saved position {} and cursor {} to {}",
      format_position(markers.position),
      markers.cursor,
      self.path.display()
    );
    Ok(())
  }
}
