//! Player control core - drives external player programs over stdin/stdout.
//!
//! Architecture:
//! - `protocol.rs` - Per-player descriptors: launch options and command phrasing
//! - `registry.rs` - File name pattern to descriptor resolution (first match wins)
//! - `interpret.rs` - Status line parsers producing position/length/frame-rate updates
//! - `process.rs` - Executable lookup, spawning and exit reports
//! - `io.rs` - Line-oriented pipes with a background reader task
//! - `session.rs` - Session state machine, command dispatch and queries

mod error;
mod interpret;
mod io;
mod process;
mod protocol;
mod registry;
mod session;

pub use error::PlayerError;
pub use interpret::{OutputFormat, PartialUpdate};
pub use io::PlayerIo;
pub use process::{describe_exit, locate_program, normalize_exit_message};
pub use protocol::{
  fill_template, CommandArg, CommandFn, CommandKind, CommandSpec, PlaybackContext,
  ProtocolDescriptor, DEFAULT_FRAME_RATE,
};
pub use registry::{FilePattern, ProtocolRegistry};
pub use session::{PlaybackStatus, PlayerSession, SessionSettings};
