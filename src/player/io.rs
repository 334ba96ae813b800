//! Line-oriented pipes to a running player.
//!
//! A reader task splits player output into lines and forwards them over a
//! channel. Commands are written straight to the input stream.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};

/// Longest status line accepted from a player.
const MAX_LINE_LENGTH: usize = 64 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits output on `\r` or `\n`. Oversized lines come out as empty frames
/// instead of errors, since `FramedRead` ends the stream after any error.
struct OutputLineCodec {
  inner: AnyDelimiterCodec,
}

impl OutputLineCodec {
  fn new(max_length: usize) -> Self {
    Self {
      inner: AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), b"\n".to_vec(), max_length),
    }
  }

  fn skip_oversized(
    result: Result<Option<Bytes>, AnyDelimiterCodecError>,
  ) -> Result<Option<Bytes>, AnyDelimiterCodecError> {
    match result {
      Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
        log::warn!("Player output line exceeded {} bytes, skipped", MAX_LINE_LENGTH);
        Ok(Some(Bytes::new()))
      }
      other => other,
    }
  }
}

impl Decoder for OutputLineCodec {
  type Item = Bytes;
  type Error = AnyDelimiterCodecError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
    Self::skip_oversized(self.inner.decode(buf))
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
    Self::skip_oversized(self.inner.decode_eof(buf))
  }
}

/// Pipes to one player instance.
pub struct PlayerIo {
  writer: Arc<AsyncMutex<BoxedWriter>>,
  lines: Receiver<String>,
  reader_handle: JoinHandle<()>,
}

impl PlayerIo {
  /// Wrap a player's output and input streams. Must be called inside a tokio runtime.
  pub fn attach<R, W>(reader: R, writer: W) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let (line_tx, line_rx) = async_channel::unbounded();
    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, line_tx).await;
    });

    Self {
      writer: Arc::new(AsyncMutex::new(Box::new(writer))),
      lines: line_rx,
      reader_handle,
    }
  }

  async fn reader_loop<R: AsyncRead + Unpin>(reader: R, line_tx: Sender<String>) {
    log::debug!("Player reader loop started");
    // Progress lines are usually terminated by a bare carriage return.
    let mut frames = FramedRead::new(reader, OutputLineCodec::new(MAX_LINE_LENGTH));

    while let Some(frame) = frames.next().await {
      match frame {
        Ok(bytes) => {
          if bytes.is_empty() {
            continue;
          }
          let line = String::from_utf8_lossy(&bytes).into_owned();
          if line_tx.send(line).await.is_err() {
            break;
          }
        }
        Err(e) => {
          log::error!("Player read error: {}", e);
          break;
        }
      }
    }

    log::debug!("Player output closed");
  }

  /// Write one command line and flush it.
  pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
    let mut writer = self.writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
  }

  /// Receiver of output lines, in arrival order. Closed when the output stream ends.
  pub fn lines(&self) -> Receiver<String> {
    self.lines.clone()
  }

  /// Stop reading output.
  pub fn close(&self) {
    self.reader_handle.abort();
    self.lines.close();
  }
}

impl Drop for PlayerIo {
  fn drop(&mut self) {
    self.close();
  }
}
