//! A single framed stream connection to one peer.
//!
//! Used directly by the server, which owns each accepted connection for its whole life, and split
//! into independent read and write halves by the client so that its receive loop can run
//! alongside callers sending requests.
use super::frame::{FrameCodec, FrameError};
use crate::error::*;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use snafu::{OptionExt, ResultExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::*;

pub struct Connection<S = TcpStream> {
    /// `None` once the connection has been closed
    framed: Option<Framed<S, FrameCodec>>,
    peer: String,
    receive_timeout: Option<Duration>,
}

impl Connection<TcpStream> {
    /// Connect to `address` (anything that resolves as `host:port`).
    #[instrument(skip(connect_timeout, max_frame_length))]
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        max_frame_length: usize,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .ok()
            .context(ConnectTimeoutSnafu {
                address,
                timeout: connect_timeout,
            })?
            .context(ConnectSnafu { address })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Unable to disable Nagle's algorithm");
        }
        debug!("Connected");

        Ok(Self::new(stream, address, max_frame_length))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>, max_frame_length: usize) -> Self {
        Self {
            framed: Some(Framed::new(stream, FrameCodec::new(max_frame_length))),
            peer: peer.into(),
            receive_timeout: None,
        }
    }

    /// Fail [`Self::receive_frame`] with [`Error::ReceiveTimeout`] if no frame arrives within
    /// `timeout`.  `None` waits forever.
    pub fn with_receive_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.receive_timeout = timeout.into();
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    /// Write one complete frame and flush it
    pub async fn send(&mut self, frame: Bytes) -> Result<()> {
        let framed = self.framed.as_mut().context(ConnectionClosedSnafu {
            pending: 0usize,
        })?;

        framed.send(frame).await.map_err(send_error)
    }

    /// Wait for the next complete frame from the peer.
    ///
    /// Cancel safe: if the returned future is dropped before it completes, any partially received
    /// frame stays buffered for the next call.
    pub async fn receive_frame(&mut self) -> Result<Bytes> {
        let framed = self.framed.as_mut().context(ConnectionClosedSnafu {
            pending: 0usize,
        })?;

        let next = match self.receive_timeout {
            Some(timeout) => tokio::time::timeout(timeout, framed.next())
                .await
                .ok()
                .context(ReceiveTimeoutSnafu { timeout })?,
            None => framed.next().await,
        };

        receive_result(next)
    }

    /// Shut down the write side and release the stream.
    ///
    /// Closing an already-closed connection does nothing.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            if let Err(e) = framed.get_mut().shutdown().await {
                debug!(peer = %self.peer, error = %e, "Error shutting down connection");
            }
        }
    }

    /// Split into halves that can be used from different tasks.
    ///
    /// Any bytes already buffered by the read side carry over into the [`FrameReader`].
    pub fn into_split(self) -> Result<(FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)> {
        let framed = self.framed.context(ConnectionClosedSnafu {
            pending: 0usize,
        })?;
        let parts = framed.into_parts();
        let (read, write) = tokio::io::split(parts.io);

        let mut reader = FramedRead::new(read, parts.codec.clone());
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);

        Ok((
            FrameReader {
                inner: reader,
                peer: self.peer.clone(),
            },
            FrameWriter {
                inner: Some(FramedWrite::new(write, parts.codec)),
                peer: self.peer,
            },
        ))
    }
}

/// The read half of a split [`Connection`]
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
    peer: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// See [`Connection::receive_frame`].  There is no receive timeout on a split reader.
    pub async fn receive_frame(&mut self) -> Result<Bytes> {
        receive_result(self.inner.next().await)
    }
}

/// The write half of a split [`Connection`]
pub struct FrameWriter<W> {
    inner: Option<FramedWrite<W, FrameCodec>>,
    peer: String,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn send(&mut self, frame: Bytes) -> Result<()> {
        let inner = self.inner.as_mut().context(ConnectionClosedSnafu {
            pending: 0usize,
        })?;

        inner.send(frame).await.map_err(send_error)
    }

    /// Shut down the write side.  Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            if let Err(e) = inner.get_mut().shutdown().await {
                debug!(peer = %self.peer, error = %e, "Error shutting down write half");
            }
        }
    }
}

/// Object-safe sending side of a connection, so that owners of a writer don't need to be generic
/// over the underlying stream type.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    async fn close(&mut self);
}

#[async_trait::async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        FrameWriter::send(self, frame).await
    }

    async fn close(&mut self) {
        FrameWriter::close(self).await
    }
}

fn send_error(error: FrameError) -> Error {
    match error {
        FrameError::Io { source } => Error::Send { source },
        FrameError::TooLarge { max } => Error::FrameTooLarge { max },
        e @ FrameError::EmbeddedDelimiter => Error::MalformedMessage {
            reason: e.to_string(),
        },
        FrameError::Truncated { pending } => Error::ConnectionClosed { pending },
    }
}

fn receive_result(next: Option<Result<Bytes, FrameError>>) -> Result<Bytes> {
    match next {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(FrameError::Io { source })) => Err(Error::Receive { source }),
        Some(Err(FrameError::TooLarge { max })) => Err(Error::FrameTooLarge { max }),
        Some(Err(FrameError::Truncated { pending })) => Err(Error::ConnectionClosed { pending }),
        Some(Err(e @ FrameError::EmbeddedDelimiter)) => Err(Error::MalformedMessage {
            reason: e.to_string(),
        }),
        None => Err(Error::ConnectionClosed { pending: 0 }),
    }
}
