//! Standard I/O of a runtime's container.
//!
//! Output is exposed as a stream of decoded lines, input as a cloneable
//! [`StdinSink`]. Line splitting happens on raw bytes so that non-UTF-8
//! encodings survive.

use super::RuntimeStatus;
use crate::engine::{ByteStream, StdinSocket};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;
use tracing::debug;

/// Decoded output lines.
pub type LineStream = BoxStream<'static, Result<String>>;

/// Text encoding of a container's standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// UTF-8; invalid sequences become U+FFFD.
    #[default]
    Utf8,
    /// ISO-8859-1.
    Latin1,
}

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    /// Characters outside Latin-1 are written as `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

fn decode_line(bytes: &[u8], encoding: Encoding) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    encoding.decode(bytes)
}

/// Splits a byte stream into lines as bytes arrive.
pub(crate) fn stream_lines(bytes: ByteStream, encoding: Encoding) -> LineStream {
    let reader = StreamReader::new(bytes.map_err(std::io::Error::other));
    FramedRead::new(reader, AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new()))
        .map(move |chunk| {
            chunk
                .map(|line| decode_line(&line, encoding))
                .map_err(|e| Error::engine("read_output", e))
        })
        .boxed()
}

/// Reads a byte stream to its end, then yields its lines.
pub(crate) async fn buffered_lines(bytes: ByteStream, encoding: Encoding) -> Result<LineStream> {
    let chunks: Vec<Bytes> = bytes.try_collect().await?;
    let buffer = chunks.concat();

    let mut lines: Vec<Result<String>> = buffer
        .split(|&b| b == b'\n')
        .map(|line| Ok(decode_line(line, encoding)))
        .collect();
    if buffer.ends_with(b"\n") || buffer.is_empty() {
        lines.pop();
    }
    Ok(stream::iter(lines).boxed())
}

/// Write end of a container's standard input.
///
/// Clones share the socket; once the runtime closes it (on stop) every
/// clone fails with [`Error::StdinClosed`].
#[derive(Clone)]
pub struct StdinSink {
    container: String,
    socket: Arc<Mutex<Option<StdinSocket>>>,
    status: watch::Receiver<RuntimeStatus>,
    encoding: Encoding,
}

impl StdinSink {
    pub(crate) fn new(
        container: String,
        socket: Arc<Mutex<Option<StdinSocket>>>,
        status: watch::Receiver<RuntimeStatus>,
        encoding: Encoding,
    ) -> Self {
        Self {
            container,
            socket,
            status,
            encoding,
        }
    }

    /// Encodes and writes `text`.
    pub async fn write(&self, text: &str) -> Result<()> {
        self.write_bytes(&self.encoding.encode(text)).await
    }

    /// Writes raw bytes.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let status = *self.status.borrow();
        if !status.accepts_input() {
            return Err(Error::invalid_state(
                format!("stdin of {}", self.container),
                status,
                &RuntimeStatus::INPUT,
            ));
        }

        let mut guard = self.socket.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| Error::StdinClosed(self.container.clone()))?;
        socket.write_all(data).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Closes the input. Later writes through any clone fail.
    pub async fn close(&self) -> Result<()> {
        close_socket(&self.socket, &self.container).await
    }
}

impl std::fmt::Debug for StdinSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinSink")
            .field("container", &self.container)
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Shuts the socket down if it is still open.
pub(crate) async fn close_socket(
    socket: &Mutex<Option<StdinSocket>>,
    container: &str,
) -> Result<()> {
    let Some(mut socket) = socket.lock().await.take() else {
        return Ok(());
    };
    debug!(container = %container, "closing stdin");
    socket.shutdown().await?;
    Ok(())
}
