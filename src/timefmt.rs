//! `HH:MM:SS` formatting for playback positions.

/// Format whole seconds as `HH:MM:SS`. Hours widen past two digits.
pub fn format_time(seconds: u64) -> String {
  let hours = seconds / 3600;
  let minutes = (seconds % 3600) / 60;
  let secs = seconds % 60;
  format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Format a signed position, clamping negatives to zero.
pub fn format_position(seconds: i64) -> String {
  format_time(seconds.max(0) as u64)
}

/// Parse `HH:MM:SS`, `MM:SS` or plain seconds.
///
/// Returns `None` for empty fields, non-digits, or more than three fields.
pub fn parse_seconds(text: &str) -> Option<u64> {
  let text = text.trim();
  if text.is_empty() {
    return None;
  }

  let fields: Vec<&str> = text.split(':').collect();
  if fields.len() > 3 {
    return None;
  }

  let mut total: u64 = 0;
  for field in fields {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    let value: u64 = field.parse().ok()?;
    total = total.checked_mul(60)?.checked_add(value)?;
  }
  Some(total)
}
