//! Output interpreters for player status lines.
//!
//! Each player reports progress in its own single-line format. Lines that do
//! not match are diagnostics and yield no update.

/// Fields extracted from one status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialUpdate {
  pub position: Option<i64>,
  pub length: Option<i64>,
  pub frame_rate: Option<i64>,
}

impl PartialUpdate {
  pub fn position(position: i64) -> Self {
    Self {
      position: Some(position),
      ..Self::default()
    }
  }

  pub fn length(length: i64) -> Self {
    Self {
      length: Some(length),
      ..Self::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.position.is_none() && self.length.is_none() && self.frame_rate.is_none()
  }
}

/// Status line grammar of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
  /// `@F <frame> <frames-left> <seconds> <seconds-left>`
  FrameInfo,
  /// `Pos: <seconds> s / <seconds> s`
  PositionSlash,
  /// `A: <seconds> ...`, plus `ANS_TIME_POSITION=` and `ANS_LENGTH=` answers.
  AvStatus,
}

impl OutputFormat {
  /// Parse one raw output line.
  pub fn interpret(&self, line: &str) -> Option<PartialUpdate> {
    let line = line.trim();
    let update = match self {
      OutputFormat::FrameInfo => parse_frame_info(line),
      OutputFormat::PositionSlash => parse_position_slash(line),
      OutputFormat::AvStatus => parse_av_status(line),
    }?;
    if update.is_empty() {
      None
    } else {
      Some(update)
    }
  }
}

fn seconds(field: &str) -> Option<f64> {
  let value: f64 = field.trim().parse().ok()?;
  if value.is_finite() && value >= 0.0 {
    Some(value)
  } else {
    None
  }
}

fn parse_frame_info(line: &str) -> Option<PartialUpdate> {
  let rest = line.strip_prefix("@F")?;
  let mut fields = rest.split_whitespace();
  let frame: i64 = fields.next()?.parse().ok()?;
  let _frames_left: i64 = fields.next()?.parse().ok()?;
  let elapsed = seconds(fields.next()?)?;
  let remaining = seconds(fields.next()?)?;

  let frame_rate = if elapsed > 0.0 && frame > 0 {
    Some((frame as f64 / elapsed).round() as i64).filter(|r| *r > 0)
  } else {
    None
  };

  Some(PartialUpdate {
    position: Some(elapsed as i64),
    length: Some((elapsed + remaining) as i64),
    frame_rate,
  })
}

fn parse_position_slash(line: &str) -> Option<PartialUpdate> {
  let rest = line.strip_prefix("Pos:")?;
  let (current, total) = rest.split_once('/')?;
  let current = seconds(current.trim().strip_suffix('s')?)?;
  let total = seconds(total.trim().strip_suffix('s')?)?;

  Some(PartialUpdate {
    position: Some(current as i64),
    length: Some(total as i64),
    frame_rate: None,
  })
}

fn parse_av_status(line: &str) -> Option<PartialUpdate> {
  if let Some(value) = line.strip_prefix("ANS_TIME_POSITION=") {
    return seconds(value).map(|s| PartialUpdate::position(s as i64));
  }
  if let Some(value) = line.strip_prefix("ANS_LENGTH=") {
    return seconds(value).map(|s| PartialUpdate::length(s as i64));
  }

  let rest = line.strip_prefix("A:")?;
  let mut tokens = rest.split_whitespace();
  let position = seconds(tokens.next()?)?;

  // Audio-only status lines carry the total: `A: 21.6 (21.6) of 1710.0 (28:30.0)`.
  let length = tokens
    .skip_while(|t| *t != "of")
    .nth(1)
    .and_then(seconds)
    .map(|s| s as i64);

  Some(PartialUpdate {
    position: Some(position as i64),
    length,
    frame_rate: None,
  })
}
