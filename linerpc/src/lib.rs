//! Minimal correlated request/response RPC over TCP.
//!
//! Every message is one line of compact JSON shaped like a JSON-RPC 2.0 request or response.  A
//! [`Client`] can have any number of calls outstanding on one connection; each is matched to its
//! response by request id, so responses may arrive in any order.  A [`Server`] dispatches each
//! request to the [`Handler`] registered for its method.
pub mod codec;
mod client;
pub mod config;
mod error;
mod server;
pub mod transport;

pub use client::Client;
pub use codec::{ErrorObject, Message, Request, Response};
pub use config::{ClientConfig, RpcConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::{
    expect_params, FrameOutcome, Handler, HandlerRegistry, MethodError, Server, ServerBuilder,
};
