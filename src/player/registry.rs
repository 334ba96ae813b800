//! Maps media file names to player protocols.

use std::path::Path;
use std::sync::Arc;

use super::error::PlayerError;
use super::protocol::ProtocolDescriptor;

/// One or more `|`-separated globs matched case-insensitively against a file name.
///
/// `*` matches any run of characters and `?` matches a single character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePattern {
  source: String,
  globs: Vec<Vec<char>>,
}

impl FilePattern {
  pub fn new(pattern: &str) -> Self {
    let globs = pattern
      .split('|')
      .map(str::trim)
      .filter(|g| !g.is_empty())
      .map(|g| g.to_lowercase().chars().collect())
      .collect();
    Self {
      source: pattern.to_string(),
      globs,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  pub fn matches(&self, name: &str) -> bool {
    let name: Vec<char> = name.to_lowercase().chars().collect();
    self.globs.iter().any(|glob| glob_match(glob, &name))
  }
}

fn glob_match(glob: &[char], text: &[char]) -> bool {
  let (mut g, mut t) = (0, 0);
  let mut star: Option<(usize, usize)> = None;

  while t < text.len() {
    if g < glob.len() && (glob[g] == '?' || glob[g] == text[t]) {
      g += 1;
      t += 1;
    } else if g < glob.len() && glob[g] == '*' {
      star = Some((g, t));
      g += 1;
    } else if let Some((sg, st)) = star {
      g = sg + 1;
      t = st + 1;
      star = Some((sg, st + 1));
    } else {
      return false;
    }
  }

  glob[g..].iter().all(|c| *c == '*')
}

/// Ordered list of (pattern, descriptor) pairs. The first matching entry wins.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
  entries: Vec<(FilePattern, Arc<ProtocolDescriptor>)>,
}

impl ProtocolRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in mappings.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    registry.push("*.mp3", ProtocolDescriptor::mpg123());
    registry.push("*.ogg|*.oga", ProtocolDescriptor::ogg123());
    registry.push(
      "*.wav|*.avi|*.mp4|*.mkv|*.flac|*.m4a|*.webm|*.mov",
      ProtocolDescriptor::mplayer(),
    );
    registry
  }

  /// Append an entry with the lowest priority.
  pub fn push(&mut self, pattern: &str, descriptor: ProtocolDescriptor) {
    self
      .entries
      .push((FilePattern::new(pattern), Arc::new(descriptor)));
  }

  /// Insert an entry ahead of every existing one.
  pub fn prepend(&mut self, pattern: &str, descriptor: ProtocolDescriptor) {
    self
      .entries
      .insert(0, (FilePattern::new(pattern), Arc::new(descriptor)));
  }

  /// Replace every registered descriptor named `name`.
  pub fn update_protocol(&mut self, name: &str, update: impl Fn(&mut ProtocolDescriptor)) {
    for (_, descriptor) in self.entries.iter_mut() {
      if descriptor.name == name {
        update(Arc::make_mut(descriptor));
      }
    }
  }

  /// Find a registered descriptor by name.
  pub fn protocol(&self, name: &str) -> Option<Arc<ProtocolDescriptor>> {
    self
      .entries
      .iter()
      .find(|(_, d)| d.name == name)
      .map(|(_, d)| d.clone())
  }

  pub fn entries(&self) -> impl Iterator<Item = (&FilePattern, &ProtocolDescriptor)> {
    self.entries.iter().map(|(p, d)| (p, d.as_ref()))
  }

  /// Resolve the descriptor for a media file.
  pub fn resolve(&self, file: Option<&Path>) -> Result<Arc<ProtocolDescriptor>, PlayerError> {
    let file = file.ok_or(PlayerError::NoSoundFile)?;
    let name = file
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| file.to_string_lossy().into_owned());

    let found = self
      .entries
      .iter()
      .find(|(pattern, _)| pattern.matches(&name))
      .map(|(_, descriptor)| descriptor.clone());

    match found {
      Some(descriptor) => {
        log::debug!("Resolved {} to protocol {}", name, descriptor.name);
        Ok(descriptor)
      }
      None => Err(PlayerError::UnknownProtocol {
        file: file.to_path_buf(),
      }),
    }
  }
}
