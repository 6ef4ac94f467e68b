//! Server side: accept connections, dispatch each request to the handler registered for its
//! method, and send back the handler's result or error.
use crate::codec::{self, ErrorObject, Message, Request, Response};
use crate::config::ServerConfig;
use crate::error::*;
use crate::transport::Connection;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Implementation of one RPC method.
///
/// Any `Fn(Vec<Value>) -> impl Future<Output = anyhow::Result<Value>>` is a handler, so in most
/// cases an async closure or function is all that's needed.
///
/// Errors are reported to the caller with the [`codec::HANDLER_ERROR`] code and the error chain
/// as the message, unless the error is a [`MethodError`], in which case its code and message are
/// used as-is.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, params: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Vec<Value>) -> anyhow::Result<Value> {
        (self)(params).await
    }
}

/// An error a handler can return to control exactly which error code the caller sees
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodError {
    pub code: i32,
    pub message: String,
}

impl MethodError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codec::INVALID_PARAMS, message)
    }
}

impl Display for MethodError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MethodError {}

/// Helper for handlers to deserialize their positional params into the type they expect,
/// usually a tuple.  Properly handles error reporting.
pub fn expect_params<P: DeserializeOwned>(params: Vec<Value>) -> Result<P, MethodError> {
    let params = Value::Array(params);
    serde_json::from_value(params.clone()).map_err(|e| {
        error!(error = %e, %params, "Error deserializing params");
        MethodError::invalid_params(format!("Invalid params: {}", e))
    })
}

/// Mapping from method name to the handler that implements it
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Add a handler, replacing any previously registered under the same name
    pub fn insert(&mut self, method: impl Into<String>, handler: impl Handler) {
        let method = method.into();
        if self.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            debug!(%method, "Replaced previously registered handler");
        }
    }

    pub fn get(&self, method: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut methods = self.methods().collect::<Vec<_>>();
        methods.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("methods", &methods)
            .finish()
    }
}

/// Populates the handler table of a [`Server`].
///
/// Handlers can only be registered here, before the server exists, so the table a running server
/// reads from never changes and needs no locking.
#[derive(Debug)]
pub struct ServerBuilder {
    config: ServerConfig,
    registry: HandlerRegistry,
}

impl ServerBuilder {
    pub fn register_handler(&mut self, method: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.registry.insert(method, handler);
        self
    }

    pub fn build(self) -> Server {
        info!(methods = ?self.registry, "Server built");
        Server {
            config: Arc::new(self.config),
            registry: Arc::new(self.registry),
        }
    }
}

/// What to do after handling one frame received from a client
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    /// Send this response back
    Respond(Response),

    /// Nothing to send; keep reading
    Ignore,

    /// The frame was so malformed that not even its id can be recovered.  The connection can't
    /// be trusted anymore and should be closed.
    Drop,
}

/// RPC server which implements the protocol plumbing, then invokes the registered [`Handler`]s to
/// do the actual work.
///
/// Cheap to clone; clones share the same configuration and handler table.
#[derive(Clone, Debug)]
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<HandlerRegistry>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            registry: HandlerRegistry::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind to the configured address and serve until cancelled
    pub async fn serve(&self, cancellation_token: CancellationToken) -> Result<()> {
        let address = self.config.bind_address.as_str();
        let listener = TcpListener::bind(address)
            .await
            .context(BindSnafu { address })?;

        self.serve_listener(listener, cancellation_token).await
    }

    /// Accept connections from `listener` until the cancellation token is triggered.
    ///
    /// Each connection is served by its own task.  Cancellation also closes every connection that
    /// is still open.
    #[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        info!("Listening");

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!("Cancellation requested; no longer accepting connections");
                    return Ok(());
                },
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(%peer, error = %e, "Unable to disable Nagle's algorithm");
                            }
                            let connection = Connection::new(stream, peer.to_string(), self.config.max_frame_length)
                                .with_receive_timeout(self.config.idle_timeout);
                            let server = self.clone();
                            let token = cancellation_token.child_token();

                            tokio::spawn(async move {
                                server.serve_connection(connection, token).await;
                            });
                        }
                        Err(e) => {
                            // Usually resource exhaustion (too many open files); back off a little
                            // instead of spinning
                            error!(error = %e, "Error accepting connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// Serve requests from a single connection until the peer disconnects, the connection fails
    /// or goes idle, or the cancellation token is triggered.
    ///
    /// Requests are handled concurrently, so responses are written in the order handlers finish,
    /// not the order requests arrived.  Nothing that goes wrong here is reported beyond this
    /// connection; it is logged and the connection is closed.
    #[instrument(skip_all, fields(peer = %connection.peer()))]
    pub async fn serve_connection<S>(
        &self,
        mut connection: Connection<S>,
        cancellation_token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Serving connection");
        let mut in_flight = FuturesUnordered::new();

        // Set when the peer has finished sending; responses still owed are sent before closing
        let mut draining = false;

        loop {
            if draining && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!("Cancellation requested; closing connection");
                    break;
                },
                result = connection.receive_frame(), if !draining => {
                    match result {
                        Ok(frame) => in_flight.push(self.handle_frame(frame)),
                        Err(Error::ConnectionClosed { pending: 0 }) => {
                            debug!(in_flight = in_flight.len(), "Peer finished sending");
                            draining = true;
                        }
                        Err(e @ Error::ReceiveTimeout { .. }) if in_flight.is_empty() => {
                            info!(error = %e, "Closing idle connection");
                            break;
                        }
                        Err(Error::ReceiveTimeout { .. }) => {
                            // Not idle, just waiting on slow handlers
                        }
                        Err(e) => {
                            warn!(error = %e, "Closing connection after receive error");
                            break;
                        }
                    }
                },
                outcome = in_flight.next(), if !in_flight.is_empty() => {
                    match outcome {
                        Some(FrameOutcome::Respond(response)) => {
                            if let Err(e) = self.send_response(&mut connection, &response).await {
                                warn!(error = %e, id = response.id(), "Closing connection after send error");
                                break;
                            }
                        }
                        Some(FrameOutcome::Ignore) | None => {}
                        Some(FrameOutcome::Drop) => {
                            warn!("Closing connection after unrecoverable frame");
                            break;
                        }
                    }
                }
            }
        }

        connection.close().await;
        debug!("Connection closed");
    }

    /// Handle one frame received from a client, producing the response (if any) to send back.
    pub async fn handle_frame(&self, frame: bytes::Bytes) -> FrameOutcome {
        if frame.iter().all(u8::is_ascii_whitespace) {
            trace!("Ignoring blank frame");
            return FrameOutcome::Ignore;
        }

        match codec::decode(&frame) {
            Ok(Message::Request(request)) => FrameOutcome::Respond(self.dispatch(request).await),
            Ok(Message::Response(response)) => {
                warn!(id = response.id(), "Received a response where a request was expected");
                FrameOutcome::Respond(Response::error(
                    response.id(),
                    ErrorObject::new(codec::PARSE_ERROR, "Expected a request, got a response"),
                ))
            }
            Err(e) => match codec::recover_id(&frame) {
                Some(id) => {
                    warn!(id, error = ?e, "Rejecting malformed request");
                    FrameOutcome::Respond(Response::error(
                        id,
                        ErrorObject::new(codec::PARSE_ERROR, error_chain(&e)),
                    ))
                }
                None => {
                    warn!(
                        error = ?e,
                        frame = %String::from_utf8_lossy(&frame),
                        "Malformed frame with no recoverable id"
                    );
                    FrameOutcome::Drop
                }
            },
        }
    }

    #[instrument(skip_all, fields(method = %request.method(), id = request.id()))]
    async fn dispatch(&self, request: Request) -> Response {
        let id = request.id();
        let (method, params) = request.into_parts();

        let Some(handler) = self.registry.get(&method) else {
            warn!("Method not found");
            return Response::error(id, ErrorObject::method_not_found(&method));
        };

        match AssertUnwindSafe(handler.call(params)).catch_unwind().await {
            Ok(Ok(result)) => {
                trace!("Method invocation succeeded");
                Response::success(id, result)
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Error handling method invocation");
                Response::error(id, handler_error(&e))
            }
            Err(_) => {
                error!("Handler panicked");
                Response::error(
                    id,
                    ErrorObject::new(codec::HANDLER_ERROR, "Handler panicked"),
                )
            }
        }
    }

    async fn send_response<S>(&self, connection: &mut Connection<S>, response: &Response) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = match codec::encode_response(response) {
            Ok(frame) => frame,
            Err(e) => {
                // Can't happen with `serde_json::Value` results, but report it rather than leave
                // the caller waiting
                error!(error = ?e, "Error encoding response");
                codec::encode_response(&Response::error(
                    response.id(),
                    ErrorObject::new(codec::INTERNAL_ERROR, error_chain(&e)),
                ))?
            }
        };

        connection.send(frame).await
    }
}

fn handler_error(error: &anyhow::Error) -> ErrorObject {
    match error.downcast_ref::<MethodError>() {
        Some(MethodError { code, message }) => ErrorObject::new(*code, message.clone()),
        None => ErrorObject::new(codec::HANDLER_ERROR, format!("{:#}", error)),
    }
}

/// The error's message followed by the messages of its sources
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut inner = error.source();
    while let Some(e) = inner {
        message.push_str(": ");
        message.push_str(&e.to_string());
        inner = e.source();
    }

    message
}
