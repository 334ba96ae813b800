//! Host environment surface: display refresh, user notices and cursor access.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::player::PlaybackStatus;

/// Point-in-time view of a session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
  pub status: PlaybackStatus,
  pub position: i64,
  pub position_display: String,
  pub length: i64,
  pub frame_rate: i64,
  pub protocol: Option<String>,
  pub sound_file: Option<PathBuf>,
}

/// User-visible reports from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
  Starting,
  Resuming,
  StoppedAt(String),
  /// Player exit report, already normalized.
  Exited(String),
  Saved { position: String, cursor: u64 },
}

impl fmt::Display for Notice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Notice::Starting => f.write_str("Starting..."),
      Notice::Resuming => f.write_str("Resuming..."),
      Notice::StoppedAt(position) => write!(f, "Stopped at {}", position),
      Notice::Exited(report) => f.write_str(report),
      Notice::Saved { position, cursor } => {
        write!(f, "Saved position {} (cursor {})", position, cursor)
      }
    }
  }
}

/// The editing environment a session reports to.
pub trait TranscriptHost: Send + Sync {
  /// Redraw the playback indicator. Calls are rate-limited by the session.
  fn refresh(&self, snapshot: &PlaybackSnapshot);

  fn notify(&self, notice: &Notice);

  /// Current cursor offset in the document.
  fn cursor(&self) -> u64 {
    0
  }

  /// Move the cursor to a previously saved offset.
  fn restore_cursor(&self, _offset: u64) {}
}

/// Host that ignores everything.
#[derive(Debug, Default)]
pub struct NullHost;

impl TranscriptHost for NullHost {
  fn refresh(&self, _snapshot: &PlaybackSnapshot) {}
  fn notify(&self, _notice: &Notice) {}
}

/// Limits how often display refreshes fire.
#[derive(Debug, Clone)]
pub struct RefreshThrottle {
  interval: Duration,
  last: Option<Instant>,
}

impl RefreshThrottle {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      last: None,
    }
  }

  /// Whether a refresh may fire at `now`. Records the refresh when it may.
  pub fn ready_at(&mut self, now: Instant) -> bool {
    match self.last {
      Some(last) if now.saturating_duration_since(last) < self.interval => false,
      _ => {
        self.last = Some(now);
        true
      }
    }
  }

  pub fn ready(&mut self) -> bool {
    self.ready_at(Instant::now())
  }

  /// Time left in the current window at `now`.
  pub fn remaining_at(&self, now: Instant) -> Duration {
    match self.last {
      Some(last) => self
        .interval
        .saturating_sub(now.saturating_duration_since(last)),
      None => Duration::ZERO,
    }
  }

  pub fn remaining(&self) -> Duration {
    self.remaining_at(Instant::now())
  }
}
