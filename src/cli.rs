//! Console front end: reads host commands from stdin and drives one session.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::HostCommand;
use crate::config::AppConfig;
use crate::host::{Notice, PlaybackSnapshot, TranscriptHost};
use crate::persist::DocumentHeaderStore;
use crate::player::{PlaybackStatus, PlayerSession};

#[derive(Parser, Debug)]
#[command(name = "tplay", author, version, about, long_about = None)]
pub struct Args {
  /// Transcript document holding the saved markers
  pub transcript: PathBuf,

  /// Media file to play, overriding the document's Sound-File field
  #[arg(short, long)]
  pub sound_file: Option<PathBuf>,

  /// Configuration file path
  #[arg(short, long)]
  pub config: Option<PathBuf>,

  /// Enable verbose logging
  #[arg(short, long)]
  pub verbose: bool,
}

/// Host that draws the playback indicator on stderr.
#[derive(Debug, Default)]
pub struct ConsoleHost {
  cursor: AtomicU64,
  last_line: Mutex<String>,
}

impl TranscriptHost for ConsoleHost {
  fn refresh(&self, snapshot: &PlaybackSnapshot) {
    let status = match snapshot.status {
      PlaybackStatus::Null => "--",
      PlaybackStatus::Idle => "||",
      PlaybackStatus::Playing => ">>",
    };
    let line = format!("{} {}", status, snapshot.position_display);

    let mut last = self.last_line.lock();
    if *last == line {
      return;
    }
    eprint!("\r{}  ", line);
    let _ = std::io::stderr().flush();
    *last = line;
  }

  fn notify(&self, notice: &Notice) {
    eprintln!("\r{}", notice);
    self.last_line.lock().clear();
  }

  fn cursor(&self) -> u64 {
    self.cursor.load(Ordering::Relaxed)
  }

  fn restore_cursor(&self, offset: u64) {
    self.cursor.store(offset, Ordering::Relaxed);
  }
}

fn init_logging(verbose: bool) {
  let level = if verbose { "debug" } else { "info" };
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
    .format_timestamp_millis()
    .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
  match path.cloned().or_else(AppConfig::default_path) {
    Some(path) => Ok(AppConfig::load(&path)?),
    None => {
      log::warn!("No config directory, using defaults");
      Ok(AppConfig::default())
    }
  }
}

/// Parse the command line and run until `quit` or end of input.
pub fn run() -> Result<()> {
  let args = Args::parse();
  init_logging(args.verbose);

  let config = load_config(args.config.as_ref())?;
  let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
  runtime.block_on(serve(args, config))
}

async fn serve(args: Args, config: AppConfig) -> Result<()> {
  let store = DocumentHeaderStore::new(&args.transcript);
  store
    .create_if_missing(args.sound_file.as_deref())
    .with_context(|| format!("Cannot open transcript {}", args.transcript.display()))?;

  let session = PlayerSession::new(
    Arc::new(config.registry()),
    Arc::new(store),
    Arc::new(ConsoleHost::default()),
    config.session_settings(),
  );
  if let Some(sound_file) = &args.sound_file {
    session.set_sound_file(sound_file);
  }
  if let Err(e) = session.setup(false) {
    log::warn!("{}", e);
  }

  log::info!("Ready, reading commands from stdin");
  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  while let Some(line) = lines.next_line().await? {
    let command = match HostCommand::parse(&line) {
      Ok(Some(command)) => command,
      Ok(None) => continue,
      Err(e) => {
        eprintln!("{}", e);
        continue;
      }
    };

    match command.execute(&session, &config).await {
      Ok(Some(output)) => println!("{}", output),
      Ok(None) => {}
      Err(e) => log::error!("{} failed: {}", command, e),
    }

    if command.is_quit() {
      return Ok(());
    }
  }

  log::info!("End of input, quitting");
  session.quit().await?;
  Ok(())
}
