//! Application configuration with persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::player::{ProtocolDescriptor, ProtocolRegistry, SessionSettings};

const CONFIG_DIR: &str = "transcript-player";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Cannot read config {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config {}: {source}", path.display())]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Per-player launch overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerOverride {
  /// Executable path or name looked up on PATH.
  #[serde(default)]
  pub program: Option<String>,

  /// Replaces the player's launch options.
  #[serde(default)]
  pub launch_options: Option<Vec<String>>,
}

/// Extra file pattern mapping, checked before the built-in ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternEntry {
  pub pattern: String,
  pub protocol: String,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  /// Launch overrides keyed by protocol name.
  #[serde(default)]
  pub players: HashMap<String, PlayerOverride>,

  /// Extra pattern mappings, highest priority first.
  #[serde(default)]
  pub patterns: Vec<PatternEntry>,

  /// How long position/length queries wait for the player.
  #[serde(default = "default_query_timeout_ms")]
  pub query_timeout_ms: u64,

  /// Minimum time between display refreshes.
  #[serde(default = "default_refresh_interval_ms")]
  pub refresh_interval_ms: u64,

  /// How long a quitting player may take before it is killed.
  #[serde(default = "default_quit_grace_ms")]
  pub quit_grace_ms: u64,

  /// Step of the `rewind` command.
  #[serde(default = "default_rewind_seconds")]
  pub rewind_seconds: u32,

  /// Distance from the end that `end` jumps to.
  #[serde(default = "default_end_margin_seconds")]
  pub end_margin_seconds: u32,
}

fn default_query_timeout_ms() -> u64 {
  1000
}

fn default_refresh_interval_ms() -> u64 {
  100
}

fn default_quit_grace_ms() -> u64 {
  2000
}

fn default_rewind_seconds() -> u32 {
  3
}

fn default_end_margin_seconds() -> u32 {
  3
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      players: HashMap::new(),
      patterns: Vec::new(),
      query_timeout_ms: default_query_timeout_ms(),
      refresh_interval_ms: default_refresh_interval_ms(),
      quit_grace_ms: default_quit_grace_ms(),
      rewind_seconds: default_rewind_seconds(),
      end_margin_seconds: default_end_margin_seconds(),
    }
  }
}

impl AppConfig {
  /// `<config dir>/transcript-player/config.json`
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
  }

  /// Load and validate a config file. A missing file yields defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = match std::fs::read_to_string(path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Self::default());
      }
      Err(source) => {
        return Err(ConfigError::Io {
          path: path.to_path_buf(),
          source,
        })
      }
    };

    let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate().map_err(ConfigError::Invalid)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if !(10..=60_000).contains(&self.query_timeout_ms) {
      return Err("queryTimeoutMs must be between 10 and 60000".to_string());
    }
    if !(10..=5_000).contains(&self.refresh_interval_ms) {
      return Err("refreshIntervalMs must be between 10 and 5000".to_string());
    }
    if self.quit_grace_ms > 60_000 {
      return Err("quitGraceMs must be at most 60000".to_string());
    }
    if !(1..=600).contains(&self.rewind_seconds) {
      return Err("rewindSeconds must be between 1 and 600".to_string());
    }
    if self.end_margin_seconds > 600 {
      return Err("endMarginSeconds must be at most 600".to_string());
    }
    for name in self.players.keys() {
      if ProtocolDescriptor::builtin(name).is_none() {
        return Err(format!("players: unknown protocol {:?}", name));
      }
    }
    for entry in &self.patterns {
      if entry.pattern.trim().is_empty() {
        return Err("patterns: pattern cannot be empty".to_string());
      }
      if ProtocolDescriptor::builtin(&entry.protocol).is_none() {
        return Err(format!(
          "patterns: unknown protocol {:?} for {:?}",
          entry.protocol, entry.pattern
        ));
      }
    }
    Ok(())
  }

  fn descriptor(&self, name: &str) -> Option<ProtocolDescriptor> {
    let mut descriptor = ProtocolDescriptor::builtin(name)?;
    if let Some(over) = self.players.get(name) {
      if let Some(program) = over.program.as_ref().filter(|p| !p.trim().is_empty()) {
        descriptor.program = program.clone();
      }
      if let Some(options) = &over.launch_options {
        descriptor.launch_options = options.clone();
      }
    }
    Some(descriptor)
  }

  /// Build the protocol registry: configured patterns first, then the defaults.
  pub fn registry(&self) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    for entry in &self.patterns {
      if let Some(descriptor) = self.descriptor(&entry.protocol) {
        registry.push(&entry.pattern, descriptor);
      }
    }
    for (pattern, descriptor) in ProtocolRegistry::with_defaults().entries() {
      if let Some(descriptor) = self.descriptor(&descriptor.name) {
        registry.push(pattern.as_str(), descriptor);
      }
    }
    registry
  }

  pub fn session_settings(&self) -> SessionSettings {
    SessionSettings {
      query_timeout: Duration::from_millis(self.query_timeout_ms),
      refresh_interval: Duration::from_millis(self.refresh_interval_ms),
      quit_grace: Duration::from_millis(self.quit_grace_ms),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig::load(&dir.path().join("config.json")).unwrap();
    assert_eq!(config, AppConfig::default());
  }

  #[test]
  fn test_partial_file_fills_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
      &path,
      r#"{
        "players": { "mplayer": { "program": "/usr/local/bin/mplayer" } },
        "patterns": [ { "pattern": "*.mp3", "protocol": "mplayer" } ],
        "rewindSeconds": 5
      }"#,
    )
    .unwrap();

    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.rewind_seconds, 5);
    assert_eq!(config.query_timeout_ms, 1000);

    let registry = config.registry();
    let mp3 = registry
      .resolve(Some(Path::new("/data/tape.mp3")))
      .unwrap();
    assert_eq!(mp3.name, "mplayer");
    assert_eq!(mp3.program, "/usr/local/bin/mplayer");

    let ogg = registry.resolve(Some(Path::new("/data/tape.ogg"))).unwrap();
    assert_eq!(ogg.name, "ogg123");
  }

  #[test]
  fn test_validation_errors() {
    let mut config = AppConfig::default();
    config.rewind_seconds = 0;
    assert!(config.validate().unwrap_err().contains("rewindSeconds"));

    let mut config = AppConfig::default();
    config.patterns.push(PatternEntry {
      pattern: "*.wav".into(),
      protocol: "vlc".into(),
    });
    assert!(config.validate().unwrap_err().contains("vlc"));

    let mut config = AppConfig::default();
    config
      .players
      .insert("winamp".into(), PlayerOverride::default());
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_malformed_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
      AppConfig::load(&path),
      Err(ConfigError::Json { .. })
    ));
  }
}
