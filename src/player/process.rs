//! Player executable lookup, spawning and exit reporting.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::error::PlayerError;
use super::protocol::ProtocolDescriptor;

/// A freshly spawned player with its pipes detached from the child handle.
pub struct SpawnedPlayer {
  pub child: Child,
  pub stdin: ChildStdin,
  pub stdout: ChildStdout,
}

/// Find the player executable.
///
/// Paths are used as given; bare names are looked up on `PATH`.
pub fn locate_program(program: &str) -> Result<PathBuf, PlayerError> {
  let path = Path::new(program);
  if path.components().count() > 1 {
    if path.exists() {
      return Ok(path.to_path_buf());
    }
    return Err(PlayerError::ProgramNotFound {
      program: program.to_string(),
    });
  }

  which::which(program).map_err(|_| PlayerError::ProgramNotFound {
    program: program.to_string(),
  })
}

/// Spawn the player described by `descriptor` for `sound_file`.
pub fn spawn_player(
  descriptor: &ProtocolDescriptor,
  sound_file: &Path,
) -> Result<SpawnedPlayer, PlayerError> {
  let exe = locate_program(&descriptor.program)?;

  log::info!(
    "Spawning {}: {:?} {:?} (file argument: {})",
    descriptor.name,
    exe,
    descriptor.launch_options,
    descriptor.file_argument
  );

  let mut cmd = Command::new(&exe);
  cmd.args(&descriptor.launch_options);
  if descriptor.file_argument {
    cmd.arg(sound_file);
  }

  let mut child = cmd
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()
    .map_err(|source| PlayerError::SpawnFailed {
      program: descriptor.program.clone(),
      source,
    })?;

  let stdin = child.stdin.take().ok_or_else(|| PlayerError::SpawnFailed {
    program: descriptor.program.clone(),
    source: std::io::Error::other("player has no stdin"),
  })?;
  let stdout = child.stdout.take().ok_or_else(|| PlayerError::SpawnFailed {
    program: descriptor.program.clone(),
    source: std::io::Error::other("player has no stdout"),
  })?;

  Ok(SpawnedPlayer {
    child,
    stdin,
    stdout,
  })
}

/// Human-readable report for a player exit.
pub fn describe_exit(name: &str, status: &ExitStatus) -> String {
  if status.success() {
    return format!("{} finished", name);
  }
  if let Some(code) = status.code() {
    return format!("{} exited abnormally with code {}", name, code);
  }

  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return format!("{} was killed by signal {}", name, signal);
    }
  }

  format!("{} exited: {}", name, status)
}

/// Rewrite an exit report whose "abnormal" code is ordinary completion for this player.
pub fn normalize_exit_message(descriptor: &ProtocolDescriptor, message: &str) -> String {
  for code in &descriptor.clean_exit_codes {
    let needle = format!("exited abnormally with code {}", code);
    if let Some(idx) = message.find(&needle) {
      let tail = &message[idx + needle.len()..];
      if !tail.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("{} finished", descriptor.name);
      }
    }
  }
  message.to_string()
}
