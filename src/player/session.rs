//! Player session: one transcript, one media file, at most one player process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::PlayerError;
use super::interpret::PartialUpdate;
use super::io::PlayerIo;
use super::process::{describe_exit, normalize_exit_message, spawn_player, SpawnedPlayer};
use super::protocol::{CommandArg, CommandKind, PlaybackContext, ProtocolDescriptor, DEFAULT_FRAME_RATE};
use super::registry::ProtocolRegistry;
use crate::host::{Notice, PlaybackSnapshot, RefreshThrottle, TranscriptHost};
use crate::persist::{PositionStore, SavedMarkers};
use crate::timefmt::format_position;

/// Playback state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
  /// No player process.
  Null,
  /// Player running, paused.
  Idle,
  Playing,
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
  /// How long position/length queries wait for an answer.
  pub query_timeout: Duration,
  /// Minimum time between display refreshes.
  pub refresh_interval: Duration,
  /// How long a quitting player may take before it is killed.
  pub quit_grace: Duration,
}

impl Default for SessionSettings {
  fn default() -> Self {
    Self {
      query_timeout: Duration::from_millis(1000),
      refresh_interval: Duration::from_millis(100),
      quit_grace: Duration::from_millis(2000),
    }
  }
}

/// Counters bumped whenever the player reports a field.
#[derive(Debug, Clone, Copy, Default)]
struct UpdateCounters {
  position: u64,
  length: u64,
}

/// A running player instance owned by the session.
struct PlayerHandle {
  generation: u64,
  io: PlayerIo,
  alive: Arc<AtomicBool>,
  cancel: CancellationToken,
}

impl PlayerHandle {
  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }
}

impl Drop for PlayerHandle {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

struct SessionState {
  sound_file: Option<PathBuf>,
  protocol: Option<Arc<ProtocolDescriptor>>,
  initialized: bool,
  status: PlaybackStatus,
  process: Option<Arc<PlayerHandle>>,
  position: i64,
  position_display: String,
  length: i64,
  frame_rate: i64,
  saved: SavedMarkers,
  next_generation: u64,
  throttle: RefreshThrottle,
  /// A throttled refresh is waiting for the window to close.
  refresh_pending: bool,
}

impl SessionState {
  fn context(&self) -> PlaybackContext {
    PlaybackContext {
      position: self.position,
      length: self.length,
      frame_rate: self.frame_rate,
    }
  }

  fn set_position(&mut self, position: i64) {
    self.position = position.max(0);
    self.position_display = format_position(self.position);
  }

  fn snapshot(&self) -> PlaybackSnapshot {
    PlaybackSnapshot {
      status: self.status,
      position: self.position,
      position_display: self.position_display.clone(),
      length: self.length,
      frame_rate: self.frame_rate,
      protocol: self.protocol.as_ref().map(|p| p.name.clone()),
      sound_file: self.sound_file.clone(),
    }
  }

  fn current_process(&self, generation: u64) -> bool {
    self
      .process
      .as_ref()
      .is_some_and(|p| p.generation == generation)
  }
}

struct SessionInner {
  this: Weak<SessionInner>,
  registry: Arc<ProtocolRegistry>,
  store: Arc<dyn PositionStore>,
  host: Arc<dyn TranscriptHost>,
  settings: SessionSettings,
  state: Mutex<SessionState>,
  updates: watch::Sender<UpdateCounters>,
}

/// Drives one external player for one transcript document.
#[derive(Clone)]
pub struct PlayerSession {
  inner: Arc<SessionInner>,
}

impl PlayerSession {
  pub fn new(
    registry: Arc<ProtocolRegistry>,
    store: Arc<dyn PositionStore>,
    host: Arc<dyn TranscriptHost>,
    settings: SessionSettings,
  ) -> Self {
    let (updates, _) = watch::channel(UpdateCounters::default());
    let state = SessionState {
      sound_file: None,
      protocol: None,
      initialized: false,
      status: PlaybackStatus::Null,
      process: None,
      position: 0,
      position_display: format_position(0),
      length: 0,
      frame_rate: DEFAULT_FRAME_RATE,
      saved: SavedMarkers::default(),
      next_generation: 1,
      throttle: RefreshThrottle::new(settings.refresh_interval),
      refresh_pending: false,
    };

    Self {
      inner: Arc::new_cyclic(|this| SessionInner {
        this: this.clone(),
        registry,
        store,
        host,
        settings,
        state: Mutex::new(state),
        updates,
      }),
    }
  }

  /// Use `path` as the media file. Takes effect at the next setup.
  pub fn set_sound_file(&self, path: impl Into<PathBuf>) {
    let mut state = self.inner.state.lock();
    state.sound_file = Some(path.into());
    state.initialized = false;
  }

  pub fn status(&self) -> PlaybackStatus {
    self.inner.state.lock().status
  }

  pub fn snapshot(&self) -> PlaybackSnapshot {
    self.inner.state.lock().snapshot()
  }

  /// Last known position as `HH:MM:SS`.
  pub fn position_display(&self) -> String {
    self.inner.state.lock().position_display.clone()
  }

  pub fn protocol(&self) -> Option<Arc<ProtocolDescriptor>> {
    self.inner.state.lock().protocol.clone()
  }

  /// Resolve the protocol and load saved markers.
  ///
  /// A no-op when already initialized unless `force` is set.
  pub fn setup(&self, force: bool) -> Result<(), PlayerError> {
    if self.inner.state.lock().initialized && !force {
      return Ok(());
    }

    let markers = self.inner.store.load()?;

    let sound_file = {
      let mut state = self.inner.state.lock();
      if state.sound_file.is_none() {
        state.sound_file = markers.sound_file.clone();
      }
      state.sound_file.clone()
    };
    let sound_file = sound_file.ok_or(PlayerError::NoSoundFile)?;

    let protocol = self.inner.registry.resolve(Some(&sound_file))?;
    check_readable(&sound_file)?;

    log::info!(
      "Session set up for {} using {} (saved position {})",
      sound_file.display(),
      protocol.name,
      format_position(markers.position)
    );

    {
      let mut state = self.inner.state.lock();
      state.protocol = Some(protocol);
      state.initialized = true;
      state.set_position(markers.position);
      state.saved = markers.clone();
    }

    self.inner.host.restore_cursor(markers.cursor);
    Ok(())
  }

  /// Make sure a live player exists, launching one if needed.
  ///
  /// Returns whether a new player was launched.
  pub async fn ensure_running(&self) -> Result<bool, PlayerError> {
    self.setup(false)?;
    self.reap();

    let (protocol, sound_file) = {
      let state = self.inner.state.lock();
      if state.process.is_some() {
        return Ok(false);
      }
      let protocol = state.protocol.clone().ok_or(PlayerError::NotRunning)?;
      let sound_file = state.sound_file.clone().ok_or(PlayerError::NoSoundFile)?;
      (protocol, sound_file)
    };

    let SpawnedPlayer {
      child,
      stdin,
      stdout,
    } = spawn_player(&protocol, &sound_file)?;
    log::info!("{} started (pid {:?})", protocol.name, child.id());

    let weak = Arc::downgrade(&self.inner);
    let grace = self.inner.settings.quit_grace;
    let generation = self.install(PlayerIo::attach(stdout, stdin), move |alive, cancel, generation| {
      tokio::spawn(watch_child(child, cancel, grace, weak, generation, alive));
    });

    self.after_launch(generation, &sound_file).await?;
    Ok(true)
  }

  /// Connect already-open player streams instead of spawning a process.
  ///
  /// The streams are treated exactly like a freshly launched player's pipes.
  pub async fn attach_io<R, W>(&self, reader: R, writer: W) -> Result<(), PlayerError>
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    self.setup(false)?;
    let sound_file = self
      .inner
      .state
      .lock()
      .sound_file
      .clone()
      .ok_or(PlayerError::NoSoundFile)?;

    let generation = self.install(PlayerIo::attach(reader, writer), |_, _, _| {});
    self.after_launch(generation, &sound_file).await
  }

  /// Store a new player handle and start consuming its output.
  fn install(
    &self,
    io: PlayerIo,
    on_installed: impl FnOnce(Arc<AtomicBool>, CancellationToken, u64),
  ) -> u64 {
    let alive = Arc::new(AtomicBool::new(true));
    let cancel = CancellationToken::new();
    let lines = io.lines();

    let generation = {
      let mut state = self.inner.state.lock();
      let generation = state.next_generation;
      state.next_generation += 1;
      state.process = Some(Arc::new(PlayerHandle {
        generation,
        io,
        alive: alive.clone(),
        cancel: cancel.clone(),
      }));
      generation
    };

    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      while let Ok(line) = lines.recv().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.handle_line(generation, &line);
      }
    });

    on_installed(alive, cancel, generation);
    generation
  }

  /// Deliver the file if needed and resume at the saved position.
  async fn after_launch(&self, generation: u64, sound_file: &Path) -> Result<(), PlayerError> {
    // A fresh player starts at zero; relative seek commands depend on that.
    let saved_position = {
      let mut state = self.inner.state.lock();
      if !state.current_process(generation) {
        return Ok(());
      }
      state.set_position(0);
      state.saved.position
    };

    let file = sound_file.to_string_lossy().into_owned();
    self.issue(CommandKind::Load, &[CommandArg::Text(file)]).await?;
    let sent = self
      .issue(CommandKind::Seek, &[CommandArg::Int(saved_position)])
      .await?;
    if sent {
      self.inner.state.lock().set_position(saved_position);
    }
    Ok(())
  }

  /// Release a player that is known to be dead.
  fn reap(&self) {
    let mut state = self.inner.state.lock();
    let dead = state.process.as_ref().is_some_and(|p| !p.is_alive());
    if dead {
      log::info!("Releasing dead player handle");
      state.process = None;
      state.status = PlaybackStatus::Null;
    }
  }

  /// Send `kind` to the player.
  ///
  /// Returns `Ok(false)` without writing when the active protocol has no such command.
  pub async fn issue(&self, kind: CommandKind, args: &[CommandArg]) -> Result<bool, PlayerError> {
    let (line, handle) = {
      let state = self.inner.state.lock();
      let Some(protocol) = state.protocol.as_ref() else {
        return Ok(false);
      };
      let Some(line) = protocol.render(kind, &state.context(), args)? else {
        log::debug!("{} has no {} command, skipped", protocol.name, kind);
        return Ok(false);
      };
      let handle = state.process.clone().ok_or(PlayerError::NotRunning)?;
      (line, handle)
    };

    log::debug!("Sending {}: {:?}", kind, line);
    if let Err(e) = handle.io.write_line(&line).await {
      log::error!("Failed to send {} to player: {}", kind, e);
      handle.alive.store(false, Ordering::SeqCst);
      return Err(PlayerError::WriteFailed(e));
    }
    Ok(true)
  }

  /// Start, pause or resume playback.
  pub async fn toggle_play(&self) -> Result<PlaybackStatus, PlayerError> {
    self.reap();
    let status = self.status();

    let (next, notice) = match status {
      PlaybackStatus::Null => {
        self.ensure_running().await?;
        (PlaybackStatus::Playing, Notice::Starting)
      }
      PlaybackStatus::Idle => {
        self.issue(CommandKind::Play, &[]).await?;
        (PlaybackStatus::Playing, Notice::Resuming)
      }
      PlaybackStatus::Playing => {
        let rewind = self.protocol().and_then(|p| p.auto_rewind);
        if let Some(offset) = rewind {
          self.skip(offset).await?;
        }
        self.issue(CommandKind::Stop, &[]).await?;
        (
          PlaybackStatus::Idle,
          Notice::StoppedAt(self.position_display()),
        )
      }
    };

    let next = {
      let mut state = self.inner.state.lock();
      // The player may have exited while the commands were in flight.
      if state.process.is_some() {
        state.status = next;
        next
      } else {
        PlaybackStatus::Null
      }
    };
    log::info!("Playback {:?} -> {:?}", status, next);
    self.inner.host.notify(&notice);
    self.inner.refresh(true);
    Ok(next)
  }

  /// Jump to an absolute position in seconds. No-op without a player.
  pub async fn seek(&self, seconds: i64) -> Result<bool, PlayerError> {
    if self.status() == PlaybackStatus::Null {
      return Ok(false);
    }
    let target = seconds.max(0);
    let sent = self
      .issue(CommandKind::Seek, &[CommandArg::Int(target)])
      .await?;
    if sent {
      self.inner.state.lock().set_position(target);
      self.inner.refresh(false);
    }
    Ok(sent)
  }

  /// Move by a relative offset in seconds. No-op without a player.
  pub async fn skip(&self, offset: i64) -> Result<bool, PlayerError> {
    if self.status() == PlaybackStatus::Null {
      return Ok(false);
    }
    let sent = self
      .issue(CommandKind::Skip, &[CommandArg::Int(offset)])
      .await?;
    if sent {
      let mut state = self.inner.state.lock();
      let target = state.position.saturating_add(offset);
      state.set_position(target);
      drop(state);
      self.inner.refresh(false);
    }
    Ok(sent)
  }

  /// Ask the player for its position, falling back to the last known value.
  pub async fn query_position(&self) -> Result<i64, PlayerError> {
    self.query(CommandKind::QueryPosition).await
  }

  /// Ask the player for the file length, falling back to the last known value.
  pub async fn query_length(&self) -> Result<i64, PlayerError> {
    self.query(CommandKind::QueryLength).await
  }

  async fn query(&self, kind: CommandKind) -> Result<i64, PlayerError> {
    let read = |state: &SessionState| match kind {
      CommandKind::QueryLength => state.length,
      _ => state.position,
    };
    let seen = |counters: &UpdateCounters| match kind {
      CommandKind::QueryLength => counters.length,
      _ => counters.position,
    };

    let mut updates = self.inner.updates.subscribe();
    let before = seen(&updates.borrow());

    if self.status() == PlaybackStatus::Null || !self.issue(kind, &[]).await? {
      return Ok(read(&self.inner.state.lock()));
    }

    let answered = matches!(
      tokio::time::timeout(
        self.inner.settings.query_timeout,
        updates.wait_for(|c| seen(c) > before),
      )
      .await,
      Ok(Ok(_))
    );

    if !answered {
      log::warn!("{}, using last known value", PlayerError::QueryTimeout(kind));
    }
    Ok(read(&self.inner.state.lock()))
  }

  /// Save markers and shut the player down.
  ///
  /// The player is torn down even when saving fails; the save error is returned.
  pub async fn quit(&self) -> Result<(), PlayerError> {
    let saved = self.save_markers();

    self.reap();
    if self.status() != PlaybackStatus::Null {
      if let Err(e) = self.issue(CommandKind::Quit, &[]).await {
        log::warn!("Failed to send quit to player: {}", e);
      }
    }

    let handle = {
      let mut state = self.inner.state.lock();
      state.status = PlaybackStatus::Null;
      state.process.take()
    };
    if let Some(handle) = handle {
      log::info!("Player {} released", handle.generation);
      handle.cancel.cancel();
    }
    self.inner.refresh(true);

    saved
  }

  fn save_markers(&self) -> Result<(), PlayerError> {
    let markers = {
      let state = self.inner.state.lock();
      if !state.initialized {
        return Ok(());
      }
      SavedMarkers {
        sound_file: state.sound_file.clone(),
        position: state.position,
        cursor: self.inner.host.cursor(),
      }
    };

    self.inner.store.save(&markers)?;

    let notice = Notice::Saved {
      position: format_position(markers.position),
      cursor: markers.cursor,
    };
    self.inner.state.lock().saved = markers;
    self.inner.host.notify(&notice);
    Ok(())
  }
}

impl SessionInner {
  /// Route one output line of player `generation` through the interpreter.
  fn handle_line(&self, generation: u64, line: &str) {
    let update = {
      let state = self.state.lock();
      if !state.current_process(generation) {
        return;
      }
      state.protocol.as_ref().and_then(|p| p.interpret(line))
    };

    if let Some(update) = update {
      self.apply(update);
    } else {
      log::trace!("Ignored player output: {}", line);
    }
    self.refresh(false);
  }

  fn apply(&self, update: PartialUpdate) {
    {
      let mut state = self.state.lock();
      if let Some(position) = update.position {
        state.set_position(position);
      }
      if let Some(length) = update.length {
        state.length = length;
      }
      if let Some(rate) = update.frame_rate {
        state.frame_rate = rate;
      }
    }

    self.updates.send_modify(|c| {
      if update.position.is_some() {
        c.position += 1;
      }
      if update.length.is_some() {
        c.length += 1;
      }
    });
  }

  /// Redraw the host display, rate-limited unless `force` is set.
  ///
  /// A throttled call schedules one trailing redraw for when the window closes,
  /// so the last update is drawn even if the player goes quiet.
  fn refresh(&self, force: bool) {
    let snapshot = {
      let mut state = self.state.lock();
      let ready = state.throttle.ready();
      if !ready && !force {
        if !state.refresh_pending {
          state.refresh_pending = true;
          self.schedule_refresh(state.throttle.remaining());
        }
        return;
      }
      state.refresh_pending = false;
      state.snapshot()
    };
    self.host.refresh(&snapshot);
  }

  fn schedule_refresh(&self, delay: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let weak = self.this.clone();
    runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = weak.upgrade() {
        let pending = inner.state.lock().refresh_pending;
        if pending {
          inner.refresh(true);
        }
      }
    });
  }

  /// Termination observer for player `generation`.
  fn on_exit(&self, generation: u64, report: String) {
    let report = {
      let mut state = self.state.lock();
      if !state.current_process(generation) {
        log::debug!("Exit of released player {} ignored: {}", generation, report);
        return;
      }
      state.process = None;
      state.status = PlaybackStatus::Null;
      match state.protocol.as_ref() {
        Some(protocol) => normalize_exit_message(protocol, &report),
        None => report,
      }
    };

    log::info!("{}", report);
    self.host.notify(&Notice::Exited(report));
    self.refresh(true);
  }
}

fn check_readable(path: &Path) -> Result<(), PlayerError> {
  std::fs::File::open(path)
    .map(|_| ())
    .map_err(|source| PlayerError::UnreadableFile {
      path: path.to_path_buf(),
      source,
    })
}

/// Own the child until it exits, killing it if a requested quit takes too long.
async fn watch_child(
  mut child: Child,
  cancel: CancellationToken,
  grace: Duration,
  session: Weak<SessionInner>,
  generation: u64,
  alive: Arc<AtomicBool>,
) {
  let exited = tokio::select! {
    status = child.wait() => Some(status),
    _ = cancel.cancelled() => None,
  };

  let status = match exited {
    Some(status) => status,
    None => match tokio::time::timeout(grace, child.wait()).await {
      Ok(status) => status,
      Err(_) => {
        log::warn!("Player {} ignored quit, killing it", generation);
        if let Err(e) = child.kill().await {
          log::error!("kill() failed: {}", e);
        }
        child.wait().await
      }
    },
  };
  alive.store(false, Ordering::SeqCst);

  let Some(session) = session.upgrade() else {
    log::debug!("Player {} exited after its session closed", generation);
    return;
  };
  let name = session
    .state
    .lock()
    .protocol
    .as_ref()
    .map(|p| p.name.clone())
    .unwrap_or_else(|| "player".to_string());
  let report = match status {
    Ok(status) => describe_exit(&name, &status),
    Err(e) => format!("{} exited: {}", name, e),
  };
  session.on_exit(generation, report);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::NullHost;
  use crate::persist::MemoryStore;
  use crate::player::protocol::CommandSpec;
  use tempfile::NamedTempFile;
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

  #[derive(Default)]
  struct RecordingHost {
    notices: Mutex<Vec<Notice>>,
    refreshes: Mutex<usize>,
    last_drawn: Mutex<Option<PlaybackSnapshot>>,
  }

  impl TranscriptHost for RecordingHost {
    fn refresh(&self, snapshot: &PlaybackSnapshot) {
      *self.refreshes.lock() += 1;
      *self.last_drawn.lock() = Some(snapshot.clone());
    }

    fn notify(&self, notice: &Notice) {
      self.notices.lock().push(notice.clone());
    }

    fn cursor(&self) -> u64 {
      77
    }
  }

  struct Harness {
    session: PlayerSession,
    store: Arc<MemoryStore>,
    host: Arc<RecordingHost>,
    player_out: DuplexStream,
    commands: Lines<BufReader<DuplexStream>>,
    _media: NamedTempFile,
  }

  fn media_file(suffix: &str) -> NamedTempFile {
    tempfile::Builder::new().suffix(suffix).tempfile().unwrap()
  }

  fn session_for(
    registry: ProtocolRegistry,
    media: &NamedTempFile,
    position: i64,
    settings: SessionSettings,
  ) -> (PlayerSession, Arc<MemoryStore>, Arc<RecordingHost>) {
    let store = Arc::new(MemoryStore::new(SavedMarkers {
      sound_file: Some(media.path().to_path_buf()),
      position,
      cursor: 5,
    }));
    let host = Arc::new(RecordingHost::default());
    let session = PlayerSession::new(Arc::new(registry), store.clone(), host.clone(), settings);
    (session, store, host)
  }

  async fn harness(suffix: &str, position: i64, settings: SessionSettings) -> Harness {
    let media = media_file(suffix);
    let (session, store, host) =
      session_for(ProtocolRegistry::with_defaults(), &media, position, settings);

    let (player_out, session_in) = tokio::io::duplex(4096);
    let (session_out, player_in) = tokio::io::duplex(4096);
    session.attach_io(session_in, session_out).await.unwrap();

    Harness {
      session,
      store,
      host,
      player_out,
      commands: BufReader::new(player_in).lines(),
      _media: media,
    }
  }

  async fn next_command(commands: &mut Lines<BufReader<DuplexStream>>) -> String {
    tokio::time::timeout(Duration::from_secs(2), commands.next_line())
      .await
      .expect("command timed out")
      .unwrap()
      .expect("command stream closed")
  }

  async fn wait_until(session: &PlayerSession, check: impl Fn(&PlaybackSnapshot) -> bool) {
    for _ in 0..200 {
      if check(&session.snapshot()) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", session.snapshot());
  }

  #[tokio::test]
  async fn test_attach_resumes_saved_position() {
    let mut h = harness(".mp3", 90, SessionSettings::default()).await;
    let load = next_command(&mut h.commands).await;
    assert!(load.starts_with("load "));
    assert!(load.ends_with(".mp3"));
    assert_eq!(next_command(&mut h.commands).await, "jump 3420");
    assert_eq!(h.session.position_display(), "00:01:30");
  }

  #[tokio::test]
  async fn test_toggle_cycle_with_auto_rewind() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    assert_eq!(next_command(&mut h.commands).await, "pausing_keep seek 0");

    assert_eq!(h.session.toggle_play().await.unwrap(), PlaybackStatus::Playing);
    assert_eq!(h.session.toggle_play().await.unwrap(), PlaybackStatus::Idle);
    assert_eq!(h.session.toggle_play().await.unwrap(), PlaybackStatus::Playing);

    assert_eq!(next_command(&mut h.commands).await, "pausing_keep seek -2");
    assert_eq!(next_command(&mut h.commands).await, "pause");
    assert_eq!(next_command(&mut h.commands).await, "pause");

    let notices = h.host.notices.lock().clone();
    assert_eq!(
      notices,
      vec![
        Notice::Starting,
        Notice::StoppedAt("00:00:00".into()),
        Notice::Resuming
      ]
    );
  }

  #[tokio::test]
  async fn test_auto_rewind_precedes_stop() {
    let media = media_file(".wav");
    let mut mplayer = ProtocolDescriptor::mplayer();
    mplayer.auto_rewind = Some(-2);
    mplayer
      .commands
      .insert(CommandKind::Stop, CommandSpec::Template("stop-now".into()));
    let mut registry = ProtocolRegistry::new();
    registry.push("*.wav", mplayer);
    let (session, _, _) = session_for(registry, &media, 0, SessionSettings::default());

    let (mut player_out, session_in) = tokio::io::duplex(4096);
    let (session_out, player_in) = tokio::io::duplex(4096);
    session.attach_io(session_in, session_out).await.unwrap();
    let mut commands = BufReader::new(player_in).lines();
    assert_eq!(next_command(&mut commands).await, "pausing_keep seek 0");

    session.toggle_play().await.unwrap();
    player_out.write_all(b"A:  30.2 V:  30.2\n").await.unwrap();
    wait_until(&session, |s| s.position == 30).await;

    assert_eq!(session.toggle_play().await.unwrap(), PlaybackStatus::Idle);
    assert_eq!(next_command(&mut commands).await, "pausing_keep seek -2");
    assert_eq!(next_command(&mut commands).await, "stop-now");
    assert_eq!(session.position_display(), "00:00:28");
  }

  #[tokio::test]
  async fn test_output_updates_position() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    h.player_out
      .write_all(b"A:  21.6 V:  21.6 A-V:  0.001\n")
      .await
      .unwrap();

    wait_until(&h.session, |s| s.position == 21).await;
    assert_eq!(h.session.position_display(), "00:00:21");
  }

  #[tokio::test]
  async fn test_unrecognized_output_changes_nothing() {
    let mut h = harness(".ogg", 0, SessionSettings::default()).await;
    let before = h.session.snapshot();

    h.player_out.write_all(b"Playing interview.ogg\n").await.unwrap();
    h.player_out.write_all(b"Playing interview.ogg\n").await.unwrap();
    h.player_out.write_all(b"Pos: 125 s / 1710 s\n").await.unwrap();
    wait_until(&h.session, |s| s.position == 125).await;

    let after = h.session.snapshot();
    assert_eq!(after.length, 1710);
    assert_eq!(after.status, before.status);
    assert_eq!(after.frame_rate, before.frame_rate);
  }

  #[tokio::test]
  async fn test_output_burst_is_throttled_and_last_update_drawn() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    let burst: String = (1..=40).map(|i| format!("A: {}.0 V: {}.0\r", i, i)).collect();
    h.player_out.write_all(burst.as_bytes()).await.unwrap();

    wait_until(&h.session, |s| s.position == 40).await;
    for _ in 0..100 {
      if h.host.last_drawn.lock().as_ref().is_some_and(|s| s.position == 40) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let drawn = h.host.last_drawn.lock().clone().unwrap();
    assert_eq!(drawn.position_display, "00:00:40");
    let refreshes = *h.host.refreshes.lock();
    assert!(refreshes <= 5, "{} refreshes for a 40-line burst", refreshes);
    assert_eq!(h.session.snapshot().position, 40);
  }

  #[tokio::test]
  async fn test_huge_offsets_do_not_overflow() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    h.session.toggle_play().await.unwrap();
    h.player_out.write_all(b"A: 65.0 V: 65.0\n").await.unwrap();
    wait_until(&h.session, |s| s.position == 65).await;

    assert!(h.session.skip(i64::MAX).await.unwrap());
    assert_eq!(h.session.snapshot().position, i64::MAX);
    assert!(h.session.skip(i64::MIN).await.unwrap());
    assert_eq!(h.session.snapshot().position, 0);

    let mp3 = harness(".mp3", 0, SessionSettings::default()).await;
    mp3.session.toggle_play().await.unwrap();
    assert!(mp3.session.seek(9_000_000_000_000_000_000).await.unwrap());
    assert!(mp3.session.skip(i64::MAX).await.unwrap());
  }

  #[tokio::test]
  async fn test_frame_rate_follows_player() {
    let mut h = harness(".mp3", 0, SessionSettings::default()).await;
    h.player_out
      .write_all(b"@F 400 6000 10.00 150.00\n")
      .await
      .unwrap();
    wait_until(&h.session, |s| s.frame_rate == 40).await;
    assert_eq!(h.session.snapshot().length, 160);
  }

  #[tokio::test]
  async fn test_issue_absent_command_writes_nothing() {
    let mut h = harness(".mp3", 0, SessionSettings::default()).await;
    next_command(&mut h.commands).await;
    next_command(&mut h.commands).await;

    let sent = h.session.issue(CommandKind::QueryLength, &[]).await.unwrap();
    assert!(!sent);
    assert!(h.session.issue(CommandKind::Quit, &[]).await.unwrap());
    assert_eq!(next_command(&mut h.commands).await, "quit");
  }

  #[tokio::test]
  async fn test_seek_and_skip_ignored_without_player() {
    let media = media_file(".wav");
    let (session, _, _) = session_for(
      ProtocolRegistry::with_defaults(),
      &media,
      0,
      SessionSettings::default(),
    );
    assert!(!session.seek(10).await.unwrap());
    assert!(!session.skip(-5).await.unwrap());
    assert_eq!(session.status(), PlaybackStatus::Null);
  }

  #[tokio::test]
  async fn test_seek_while_idle_is_forwarded() {
    let mut h = harness(".ogg", 0, SessionSettings::default()).await;
    next_command(&mut h.commands).await;
    h.session.toggle_play().await.unwrap();
    h.session.toggle_play().await.unwrap();
    assert_eq!(next_command(&mut h.commands).await, "p");
    assert_eq!(h.session.status(), PlaybackStatus::Idle);

    assert!(h.session.seek(300).await.unwrap());
    assert_eq!(next_command(&mut h.commands).await, "r300");
    assert!(h.session.skip(-60).await.unwrap());
    assert_eq!(next_command(&mut h.commands).await, "r240");
    assert_eq!(h.session.position_display(), "00:04:00");
  }

  #[tokio::test]
  async fn test_query_length_answered() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    next_command(&mut h.commands).await;
    h.session.toggle_play().await.unwrap();

    let mut commands = h.commands;
    let mut player_out = h.player_out;
    let responder = tokio::spawn(async move {
      let line = next_command(&mut commands).await;
      assert_eq!(line, "pausing_keep_force get_time_length");
      player_out.write_all(b"ANS_LENGTH=1710.00\n").await.unwrap();
      (commands, player_out)
    });

    assert_eq!(h.session.query_length().await.unwrap(), 1710);
    responder.await.unwrap();
  }

  #[tokio::test]
  async fn test_query_timeout_returns_stale_value() {
    let settings = SessionSettings {
      query_timeout: Duration::from_millis(50),
      ..SessionSettings::default()
    };
    let mut h = harness(".wav", 0, settings).await;
    h.player_out
      .write_all(b"A:  21.6 (21.6) of 99.0 (01:39.0)\n")
      .await
      .unwrap();
    wait_until(&h.session, |s| s.length == 99).await;
    h.session.toggle_play().await.unwrap();

    assert_eq!(h.session.query_length().await.unwrap(), 99);
    assert_eq!(h.session.query_position().await.unwrap(), 21);
  }

  #[tokio::test]
  async fn test_query_without_command_uses_cache() {
    let mut h = harness(".mp3", 0, SessionSettings::default()).await;
    h.player_out
      .write_all(b"@F 380 6120 10.00 160.50\n")
      .await
      .unwrap();
    wait_until(&h.session, |s| s.length == 170).await;
    h.session.toggle_play().await.unwrap();

    assert_eq!(h.session.query_length().await.unwrap(), 170);
  }

  #[tokio::test]
  async fn test_quit_saves_and_releases() {
    let mut h = harness(".wav", 0, SessionSettings::default()).await;
    next_command(&mut h.commands).await;
    h.session.toggle_play().await.unwrap();
    h.player_out.write_all(b"A: 65.0 V: 65.0\n").await.unwrap();
    wait_until(&h.session, |s| s.position == 65).await;

    h.session.quit().await.unwrap();
    assert_eq!(next_command(&mut h.commands).await, "quit");
    assert_eq!(h.session.status(), PlaybackStatus::Null);

    let markers = h.store.markers();
    assert_eq!(markers.position, 65);
    assert_eq!(markers.cursor, 77);
    assert!(h.host.notices.lock().contains(&Notice::Saved {
      position: "00:01:05".into(),
      cursor: 77
    }));
  }

  #[tokio::test]
  async fn test_late_exit_report_is_ignored() {
    let h = harness(".wav", 0, SessionSettings::default()).await;
    let generation = h
      .session
      .inner
      .state
      .lock()
      .process
      .as_ref()
      .map(|p| p.generation)
      .unwrap();
    h.session.toggle_play().await.unwrap();
    h.session.quit().await.unwrap();

    h.session
      .inner
      .on_exit(generation, "mplayer finished".to_string());
    assert_eq!(h.session.status(), PlaybackStatus::Null);
    assert!(!h
      .host
      .notices
      .lock()
      .iter()
      .any(|n| matches!(n, Notice::Exited(_))));
  }

  #[tokio::test]
  async fn test_exit_of_current_player_resets_state() {
    let h = harness(".mp3", 0, SessionSettings::default()).await;
    let generation = h
      .session
      .inner
      .state
      .lock()
      .process
      .as_ref()
      .map(|p| p.generation)
      .unwrap();
    h.session.toggle_play().await.unwrap();

    h.session
      .inner
      .on_exit(generation, "mpg123 exited abnormally with code 1".to_string());
    assert_eq!(h.session.status(), PlaybackStatus::Null);
    assert!(h
      .host
      .notices
      .lock()
      .contains(&Notice::Exited("mpg123 finished".into())));
  }

  #[tokio::test]
  async fn test_write_failure_degrades_to_null() {
    let h = harness(".wav", 0, SessionSettings::default()).await;
    h.session.toggle_play().await.unwrap();
    drop(h.commands);

    let err = h.session.toggle_play().await.unwrap_err();
    assert!(matches!(err, PlayerError::WriteFailed(_)));
    h.session.reap();
    assert_eq!(h.session.status(), PlaybackStatus::Null);
  }

  #[tokio::test]
  async fn test_setup_errors() {
    let host: Arc<dyn TranscriptHost> = Arc::new(NullHost);
    let registry = Arc::new(ProtocolRegistry::with_defaults());

    let empty = PlayerSession::new(
      registry.clone(),
      Arc::new(MemoryStore::default()),
      host.clone(),
      SessionSettings::default(),
    );
    assert!(matches!(empty.setup(false), Err(PlayerError::NoSoundFile)));

    let missing = PlayerSession::new(
      registry.clone(),
      Arc::new(MemoryStore::default()),
      host.clone(),
      SessionSettings::default(),
    );
    missing.set_sound_file("/nonexistent/tape.wav");
    assert!(matches!(
      missing.setup(false),
      Err(PlayerError::UnreadableFile { .. })
    ));

    let media = media_file(".xyz");
    let unknown = PlayerSession::new(
      registry,
      Arc::new(MemoryStore::default()),
      host,
      SessionSettings::default(),
    );
    unknown.set_sound_file(media.path());
    assert!(matches!(
      unknown.setup(false),
      Err(PlayerError::UnknownProtocol { .. })
    ));
  }

  #[test]
  fn test_setup_is_idempotent_unless_forced() {
    let media = media_file(".wav");
    let (session, store, _) = session_for(
      ProtocolRegistry::with_defaults(),
      &media,
      30,
      SessionSettings::default(),
    );
    session.setup(false).unwrap();
    assert_eq!(session.position_display(), "00:00:30");

    store
      .save(&SavedMarkers {
        sound_file: None,
        position: 45,
        cursor: 0,
      })
      .unwrap();
    session.setup(false).unwrap();
    assert_eq!(session.position_display(), "00:00:30");
    session.setup(true).unwrap();
    assert_eq!(session.position_display(), "00:00:45");
  }

  #[cfg(unix)]
  fn shell_registry(script: &str) -> ProtocolRegistry {
    let mut mplayer = ProtocolDescriptor::mplayer();
    mplayer.name = "sh".into();
    mplayer.program = "sh".into();
    mplayer.launch_options = vec!["-c".into(), script.into()];
    let mut registry = ProtocolRegistry::new();
    registry.push("*.wav", mplayer);
    registry
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_real_player_receives_commands() {
    let media = media_file(".wav");
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("commands.log");
    let script = format!("cat > '{}'", log.display());
    let (session, _, _) = session_for(shell_registry(&script), &media, 0, SessionSettings::default());

    assert_eq!(session.toggle_play().await.unwrap(), PlaybackStatus::Playing);
    assert_eq!(session.toggle_play().await.unwrap(), PlaybackStatus::Idle);
    assert_eq!(session.toggle_play().await.unwrap(), PlaybackStatus::Playing);
    session.quit().await.unwrap();

    let expected = "pausing_keep seek 0\npausing_keep seek -2\npause\npause\nquit\n";
    for _ in 0..200 {
      if std::fs::read_to_string(&log).unwrap_or_default() == expected {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
      "unexpected command log: {:?}",
      std::fs::read_to_string(&log).unwrap_or_default()
    );
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_real_player_exit_resets_to_null() {
    let media = media_file(".wav");
    let (session, _, host) = session_for(
      shell_registry("read first; echo 'A: 12.0 V: 12.0'; exit 0"),
      &media,
      0,
      SessionSettings::default(),
    );

    session.toggle_play().await.unwrap();
    wait_until(&session, |s| s.status == PlaybackStatus::Null).await;
    assert!(host
      .notices
      .lock()
      .contains(&Notice::Exited("sh finished".into())));
  }

  #[tokio::test]
  async fn test_missing_executable_is_fatal() {
    let media = media_file(".wav");
    let mut mplayer = ProtocolDescriptor::mplayer();
    mplayer.program = "no-such-player-binary".into();
    let mut registry = ProtocolRegistry::new();
    registry.push("*.wav", mplayer);
    let (session, _, _) = session_for(registry, &media, 0, SessionSettings::default());

    let err = session.toggle_play().await.unwrap_err();
    assert!(matches!(err, PlayerError::ProgramNotFound { .. }));
    assert_eq!(session.status(), PlaybackStatus::Null);
  }
}
