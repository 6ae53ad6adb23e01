//! Duplex frame transports.
//!
//! A session only needs an ordered, reliable channel of text frames. Two
//! bindings ship with the crate: an in-memory pair for tests and embedding,
//! and newline-delimited JSON over any async byte stream.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::messages::WireMessage;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,
    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a duplex channel
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Inbound half of a duplex channel. `None` means the peer closed.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// A duplex channel that can be split into its halves
pub trait Transport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

/// Records every frame passing through a tapped transport.
#[derive(Clone, Default)]
pub struct FrameTap {
    frames: Arc<Mutex<Vec<String>>>,
}

impl FrameTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Frames decoded as wire messages; undecodable frames are skipped
    pub fn messages(&self) -> Vec<WireMessage> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| WireMessage::decode(frame).ok())
            .collect()
    }

    /// Number of recorded messages of the given kind (`"call_graph"`, ...)
    pub fn count(&self, kind: &str) -> usize {
        self.messages().iter().filter(|m| m.kind() == kind).count()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    fn record(&self, frame: &str) {
        self.frames.lock().push(frame.to_string());
    }
}

/// In-memory duplex channel backed by tokio mpsc queues.
pub struct MemoryTransport {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    tap: Option<FrameTap>,
}

impl MemoryTransport {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(256)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                tap: None,
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                tap: None,
            },
        )
    }

    /// Record outgoing frames on `tap`
    pub fn with_tap(mut self, tap: FrameTap) -> Self {
        self.tap = Some(tap);
        self
    }
}

struct MemorySink {
    tx: mpsc::Sender<String>,
    tap: Option<FrameTap>,
}

struct MemoryStream {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if let Some(tap) = &self.tap {
            tap.record(&frame);
        }
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl Transport for MemoryTransport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(MemorySink {
                tx: self.tx,
                tap: self.tap,
            }),
            Box::new(MemoryStream { rx: self.rx }),
        )
    }
}

/// Newline-delimited JSON frames over an async byte stream
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    max_frame_bytes: usize,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            writer,
            max_frame_bytes,
        }
    }
}

struct LineSink<W> {
    inner: FramedWrite<W, LinesCodec>,
    max_frame_bytes: usize,
}

struct LineStream<R> {
    inner: FramedRead<R, LinesCodec>,
    max_frame_bytes: usize,
}

fn codec_error(err: LinesCodecError, limit: usize) -> TransportError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => TransportError::FrameTooLarge(limit),
        LinesCodecError::Io(err) => TransportError::Io(err),
    }
}

#[async_trait]
impl<W> FrameSink for LineSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge(self.max_frame_bytes));
        }
        let limit = self.max_frame_bytes;
        self.inner
            .send(frame)
            .await
            .map_err(|err| codec_error(err, limit))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let limit = self.max_frame_bytes;
        SinkExt::<String>::close(&mut self.inner)
            .await
            .map_err(|err| codec_error(err, limit))
    }
}

#[async_trait]
impl<R> FrameStream for LineStream<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        let limit = self.max_frame_bytes;
        loop {
            match self.inner.next().await? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(Ok(line)),
                Err(err) => return Some(Err(codec_error(err, limit))),
            }
        }
    }
}

impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(LineSink {
                inner: FramedWrite::new(self.writer, LinesCodec::new()),
                max_frame_bytes: self.max_frame_bytes,
            }),
            Box::new(LineStream {
                inner: FramedRead::new(
                    self.reader,
                    LinesCodec::new_with_max_length(self.max_frame_bytes),
                ),
                max_frame_bytes: self.max_frame_bytes,
            }),
        )
    }
}
