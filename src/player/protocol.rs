//! Player protocol descriptors.
//!
//! A descriptor says how to launch one player program and how to phrase each
//! abstract command for it. Commands are either positional templates or
//! callbacks that need live playback state (frame rate, current position).

use std::collections::HashMap;
use std::fmt;

use super::error::PlayerError;
use super::interpret::{OutputFormat, PartialUpdate};

/// Frames per second assumed for MPEG audio until the player reports one.
pub const DEFAULT_FRAME_RATE: i64 = 38;

/// Abstract commands understood by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
  Load,
  Play,
  Stop,
  Seek,
  Skip,
  Quit,
  QueryPosition,
  QueryLength,
}

impl CommandKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      CommandKind::Load => "load",
      CommandKind::Play => "play",
      CommandKind::Stop => "stop",
      CommandKind::Seek => "seek",
      CommandKind::Skip => "skip",
      CommandKind::Quit => "quit",
      CommandKind::QueryPosition => "query-position",
      CommandKind::QueryLength => "query-length",
    }
  }
}

impl fmt::Display for CommandKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Argument substituted into a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
  Int(i64),
  Text(String),
}

impl fmt::Display for CommandArg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CommandArg::Int(n) => write!(f, "{}", n),
      CommandArg::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for CommandArg {
  fn from(value: i64) -> Self {
    CommandArg::Int(value)
  }
}

impl From<&str> for CommandArg {
  fn from(value: &str) -> Self {
    CommandArg::Text(value.to_string())
  }
}

impl From<String> for CommandArg {
  fn from(value: String) -> Self {
    CommandArg::Text(value)
  }
}

/// Live playback values a command callback may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackContext {
  pub position: i64,
  pub length: i64,
  pub frame_rate: i64,
}

impl Default for PlaybackContext {
  fn default() -> Self {
    Self {
      position: 0,
      length: 0,
      frame_rate: DEFAULT_FRAME_RATE,
    }
  }
}

/// Computes the line to send from playback state and arguments.
pub type CommandFn = fn(&PlaybackContext, &[CommandArg]) -> Result<String, PlayerError>;

/// How one command is phrased for a player.
#[derive(Clone)]
pub enum CommandSpec {
  /// Positional template: `%s` and `%d` consume arguments in order, `%%` is a literal.
  Template(String),
  Callback(CommandFn),
}

impl fmt::Debug for CommandSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CommandSpec::Template(t) => f.debug_tuple("Template").field(t).finish(),
      CommandSpec::Callback(_) => f.write_str("Callback(..)"),
    }
  }
}

impl CommandSpec {
  fn render(
    &self,
    kind: CommandKind,
    ctx: &PlaybackContext,
    args: &[CommandArg],
  ) -> Result<String, PlayerError> {
    let mut line = match self {
      CommandSpec::Template(template) => fill_template(kind, template, args)?,
      CommandSpec::Callback(callback) => callback(ctx, args)?,
    };
    if !line.ends_with('\n') {
      line.push('\n');
    }
    Ok(line)
  }
}

/// Substitute positional arguments into a command template.
pub fn fill_template(
  kind: CommandKind,
  template: &str,
  args: &[CommandArg],
) -> Result<String, PlayerError> {
  let mut out = String::with_capacity(template.len() + 16);
  let mut next = 0;
  let mut chars = template.chars().peekable();

  while let Some(c) = chars.next() {
    if c != '%' {
      out.push(c);
      continue;
    }
    match chars.peek() {
      Some('%') => {
        chars.next();
        out.push('%');
      }
      Some('s') | Some('d') => {
        chars.next();
        let arg = args.get(next).ok_or(PlayerError::MissingArgument {
          command: kind,
          index: next,
        })?;
        out.push_str(&arg.to_string());
        next += 1;
      }
      _ => out.push('%'),
    }
  }

  Ok(out)
}

fn int_arg(kind: CommandKind, args: &[CommandArg], index: usize) -> Result<i64, PlayerError> {
  match args.get(index) {
    Some(CommandArg::Int(n)) => Ok(*n),
    Some(CommandArg::Text(s)) => s
      .trim()
      .parse()
      .map_err(|_| PlayerError::MissingArgument { command: kind, index }),
    None => Err(PlayerError::MissingArgument { command: kind, index }),
  }
}

fn frame_rate(ctx: &PlaybackContext) -> i64 {
  if ctx.frame_rate > 0 {
    ctx.frame_rate
  } else {
    DEFAULT_FRAME_RATE
  }
}

fn mpg123_seek(ctx: &PlaybackContext, args: &[CommandArg]) -> Result<String, PlayerError> {
  let seconds = int_arg(CommandKind::Seek, args, 0)?.max(0);
  Ok(format!("jump {}", seconds.saturating_mul(frame_rate(ctx))))
}

fn mpg123_skip(ctx: &PlaybackContext, args: &[CommandArg]) -> Result<String, PlayerError> {
  let seconds = int_arg(CommandKind::Skip, args, 0)?;
  Ok(format!("jump {:+}", seconds.saturating_mul(frame_rate(ctx))))
}

// ogg123 only seeks absolutely, so relative skips are resolved against the
// last reported position.
fn ogg123_skip(ctx: &PlaybackContext, args: &[CommandArg]) -> Result<String, PlayerError> {
  let offset = int_arg(CommandKind::Skip, args, 0)?;
  Ok(format!("r{}", ctx.position.saturating_add(offset).max(0)))
}

// mplayer's plain `seek` is relative. Slave commands without a `pausing_keep`
// prefix unpause the player.
fn mplayer_seek(ctx: &PlaybackContext, args: &[CommandArg]) -> Result<String, PlayerError> {
  let target = int_arg(CommandKind::Seek, args, 0)?.max(0);
  Ok(format!("pausing_keep seek {}", target.saturating_sub(ctx.position)))
}

/// Static definition of how to launch and talk to one player program.
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
  /// Identity used in logs, config overrides and exit reports.
  pub name: String,
  pub program: String,
  pub launch_options: Vec<String>,
  /// Whether the sound file is passed on the command line. When false the
  /// file is delivered with the `load` command after launch.
  pub file_argument: bool,
  pub commands: HashMap<CommandKind, CommandSpec>,
  /// Signed offset applied with `skip` before every stop.
  pub auto_rewind: Option<i64>,
  pub output: OutputFormat,
  /// Exit codes that mean ordinary completion for this player.
  pub clean_exit_codes: Vec<i32>,
}

impl ProtocolDescriptor {
  /// Frame-based mpg123 remote-control mode.
  pub fn mpg123() -> Self {
    let commands = HashMap::from([
      (CommandKind::Load, CommandSpec::Template("load %s".into())),
      (CommandKind::Play, CommandSpec::Template("pause".into())),
      (CommandKind::Stop, CommandSpec::Template("pause".into())),
      (CommandKind::Seek, CommandSpec::Callback(mpg123_seek)),
      (CommandKind::Skip, CommandSpec::Callback(mpg123_skip)),
      (CommandKind::Quit, CommandSpec::Template("quit".into())),
    ]);
    Self {
      name: "mpg123".into(),
      program: "mpg123".into(),
      launch_options: vec!["-R".into()],
      file_argument: false,
      commands,
      auto_rewind: None,
      output: OutputFormat::FrameInfo,
      clean_exit_codes: vec![1],
    }
  }

  pub fn ogg123() -> Self {
    let commands = HashMap::from([
      (CommandKind::Play, CommandSpec::Template("p".into())),
      (CommandKind::Stop, CommandSpec::Template("p".into())),
      (CommandKind::Seek, CommandSpec::Template("r%d".into())),
      (CommandKind::Skip, CommandSpec::Callback(ogg123_skip)),
      (CommandKind::Quit, CommandSpec::Template("q".into())),
    ]);
    Self {
      name: "ogg123".into(),
      program: "ogg123".into(),
      launch_options: Vec::new(),
      file_argument: true,
      commands,
      auto_rewind: None,
      output: OutputFormat::PositionSlash,
      clean_exit_codes: Vec::new(),
    }
  }

  /// mplayer slave mode.
  pub fn mplayer() -> Self {
    let commands = HashMap::from([
      (CommandKind::Play, CommandSpec::Template("pause".into())),
      (CommandKind::Stop, CommandSpec::Template("pause".into())),
      (CommandKind::Seek, CommandSpec::Callback(mplayer_seek)),
      (CommandKind::Skip, CommandSpec::Template("pausing_keep seek %d".into())),
      (CommandKind::Quit, CommandSpec::Template("quit".into())),
      (
        CommandKind::QueryPosition,
        CommandSpec::Template("pausing_keep_force get_time_pos".into()),
      ),
      (
        CommandKind::QueryLength,
        CommandSpec::Template("pausing_keep_force get_time_length".into()),
      ),
    ]);
    Self {
      name: "mplayer".into(),
      program: "mplayer".into(),
      // `-quiet` would suppress the `A:` status line the interpreter reads.
      launch_options: vec!["-slave".into()],
      file_argument: true,
      commands,
      auto_rewind: Some(-2),
      output: OutputFormat::AvStatus,
      clean_exit_codes: Vec::new(),
    }
  }

  /// All built-in descriptors.
  pub fn builtins() -> Vec<Self> {
    vec![Self::mpg123(), Self::ogg123(), Self::mplayer()]
  }

  /// Look up a built-in descriptor by name.
  pub fn builtin(name: &str) -> Option<Self> {
    Self::builtins().into_iter().find(|d| d.name == name)
  }

  /// Whether the player understands `kind`.
  pub fn supports(&self, kind: CommandKind) -> bool {
    self.commands.contains_key(&kind)
  }

  /// Render the line for `kind`, or `None` if this player has no such command.
  pub fn render(
    &self,
    kind: CommandKind,
    ctx: &PlaybackContext,
    args: &[CommandArg],
  ) -> Result<Option<String>, PlayerError> {
    match self.commands.get(&kind) {
      Some(spec) => spec.render(kind, ctx, args).map(Some),
      None => Ok(None),
    }
  }

  /// Parse one output line of this player.
  pub fn interpret(&self, line: &str) -> Option<PartialUpdate> {
    self.output.interpret(line)
  }
}
