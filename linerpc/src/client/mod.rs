//! Client side: issue calls and wait for the responses that correlate with them.
//!
//! Each [`Client`] owns one connection.  A background task reads every frame the server sends
//! and hands each response to whichever call is waiting on its id, so any number of calls can be
//! outstanding at once and responses may come back in any order.
mod pending;

use crate::codec::{self, Message, Request, Response};
use crate::config::ClientConfig;
use crate::error::*;
use crate::transport::{Connection, FrameReader, FrameSink};
use pending::PendingCalls;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;

pub struct Client {
    shared: Arc<ClientShared>,

    /// Stops the receive loop; cancelled by [`Client::close`] and on drop
    cancellation_token: CancellationToken,
    peer: String,
}

struct ClientShared {
    writer: tokio::sync::Mutex<Box<dyn FrameSink>>,
    pending: Mutex<PendingCalls>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl Client {
    /// Connect to the server at `config.address` and start the receive loop
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let connection = Connection::connect(
            &config.address,
            config.connect_timeout,
            config.max_frame_length,
        )
        .await?;

        Self::from_connection(connection, config.default_timeout)
    }

    /// Run a client over an already established connection.
    ///
    /// Must be called from within a tokio runtime, as it spawns the receive loop.
    pub fn from_connection<S>(connection: Connection<S>, default_timeout: Duration) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer = connection.peer().to_string();
        let (reader, writer) = connection.into_split()?;

        let shared = Arc::new(ClientShared {
            writer: tokio::sync::Mutex::new(Box::new(writer) as Box<dyn FrameSink>),
            pending: Mutex::new(PendingCalls::new()),
            next_id: AtomicU64::new(1),
            default_timeout,
        });
        let cancellation_token = CancellationToken::new();

        tokio::spawn(receive_loop(
            reader,
            shared.clone(),
            cancellation_token.clone(),
        ));

        Ok(Self {
            shared,
            cancellation_token,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Number of calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Invoke `method` on the server and wait for its result.
    ///
    /// `timeout` bounds the whole exchange, sending included; `None` means the client's default
    /// timeout.  On timeout the connection stays open, and a response that arrives later is
    /// discarded.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (id, receiver) = self.register_next_id(method)?;

        self.exchange(id, receiver, method, params, timeout).await
    }

    /// Like [`Self::call`], but with a caller-chosen request id.
    ///
    /// Fails with [`Error::IdInUse`] if another call with the same id is still waiting for its
    /// response.
    pub async fn call_with_id(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let receiver = lock(&self.shared.pending).register(id, method)?;

        self.exchange(id, receiver, method, params, timeout).await
    }

    /// Call with params built from any serializable value (usually a tuple), deserializing the
    /// result into `R`
    pub async fn call_typed<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = codec::to_params(params)?;
        let result = self.call(method, params, timeout).await?;

        serde_json::from_value(result).context(DecodeSnafu)
    }

    /// Stop the receive loop and shut down the connection.
    ///
    /// Calls still waiting fail with [`Error::ConnectionClosed`].  Closing twice is a no-op.
    pub async fn close(&self) {
        self.cancellation_token.cancel();
        self.shared.writer.lock().await.close().await;
    }

    /// Allocate the next id that isn't already taken by a pending call, and register it.
    ///
    /// Ids only collide after the counter wraps, or when [`Self::call_with_id`] has claimed one
    /// ahead of the counter.
    fn register_next_id(
        &self,
        method: &str,
    ) -> Result<(u64, tokio::sync::oneshot::Receiver<Response>)> {
        loop {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            match lock(&self.shared.pending).register(id, method) {
                Ok(receiver) => return Ok((id, receiver)),
                Err(Error::IdInUse { .. }) => {
                    trace!(id, "Skipping id still in use");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self, receiver, params), fields(peer = %self.peer))]
    async fn exchange(
        &self,
        id: u64,
        receiver: tokio::sync::oneshot::Receiver<Response>,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        // Whatever happens from here on, including this future being dropped, the pending entry
        // goes away with the guard
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };

        let timeout = timeout.unwrap_or(self.shared.default_timeout);
        // An absurdly large timeout is as good as none
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
        let timed_out = || {
            warn!(timeout = ?timeout, "Call timed out");
            CallTimeoutSnafu {
                method,
                id,
                timeout,
            }
            .build()
        };

        let frame = codec::encode(&Request::new(method, params, id)?)?;

        tokio::time::timeout_at(deadline, async move {
            self.shared.writer.lock().await.send(frame).await
        })
        .await
        .map_err(|_| timed_out())?
        .inspect_err(|e| {
            error!(error = ?e, "Error sending request");
        })?;

        let response = match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                debug!("Connection closed while waiting for response");
                return ConnectionClosedSnafu { pending: 0usize }.fail();
            }
            Err(_) => return Err(timed_out()),
        };

        response.into_outcome().map_err(|error| {
            debug!(code = error.code, message = %error.message, "Remote error");
            Error::Remote {
                code: error.code,
                message: error.message,
            }
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Removes a pending call's entry when the call finishes, one way or another
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingCalls>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

/// The pending map is never left in an inconsistent state mid-operation, so a poisoned lock is
/// still safe to use
fn lock(pending: &Mutex<PendingCalls>) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientShared {
    fn dispatch(&self, frame: &[u8]) {
        match codec::decode(frame) {
            Ok(Message::Response(response)) => {
                let id = response.id();
                if !lock(&self.pending).complete(response) {
                    warn!(id, "Dropping response that matches no pending call");
                }
            }
            Ok(Message::Request(request)) => {
                warn!(
                    method = request.method(),
                    id = request.id(),
                    "Dropping request sent by the server; clients do not serve methods"
                );
            }
            Err(e) => {
                warn!(
                    error = ?e,
                    frame = %String::from_utf8_lossy(frame),
                    "Dropping frame that could not be decoded"
                );
            }
        }
    }
}

#[instrument(skip_all, fields(peer = %reader.peer()))]
async fn receive_loop<R>(
    mut reader: FrameReader<R>,
    shared: Arc<ClientShared>,
    cancellation_token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let result = tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!("Client closed; stopping receive loop");
                break;
            },
            result = reader.receive_frame() => result,
        };

        match result {
            Ok(frame) => shared.dispatch(&frame),
            Err(e @ Error::ConnectionClosed { .. }) => {
                debug!(error = %e, "Server closed the connection");
                break;
            }
            Err(e) => {
                error!(error = ?e, "Error receiving frame; stopping receive loop");
                break;
            }
        }
    }

    let abandoned = lock(&shared.pending).close();
    if abandoned > 0 {
        warn!(abandoned, "Connection closed with calls still waiting for a response");
    }
}
