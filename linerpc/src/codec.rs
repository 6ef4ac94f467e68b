//! The wire format: JSON-RPC 2.0 shaped messages, serialized as compact JSON.
//!
//! Framing is not handled here; see [`crate::transport`].  Everything in this module is a pure
//! transformation between Rust values and the bytes of a single frame.
use crate::error::*;
use bytes::Bytes;
use jsonrpsee_types as jsonrpc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snafu::{ensure, ResultExt};

/// The frame is not valid JSON, or is JSON but not a valid request
pub const PARSE_ERROR: i32 = jsonrpc::error::PARSE_ERROR_CODE;
pub const METHOD_NOT_FOUND: i32 = jsonrpc::error::METHOD_NOT_FOUND_CODE;
pub const INVALID_PARAMS: i32 = jsonrpc::error::INVALID_PARAMS_CODE;
pub const INTERNAL_ERROR: i32 = jsonrpc::error::INTERNAL_ERROR_CODE;
/// A registered handler failed.  First code of the range JSON-RPC reserves for
/// implementation-defined server errors.
pub const HANDLER_ERROR: i32 = -32000;

/// A method invocation sent from a client to a server.
///
/// Immutable once constructed; the only way to build one is [`Request::new`], which rejects an
/// empty method name.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    method: String,
    params: Vec<Value>,
    id: u64,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Result<Self> {
        let method = method.into();
        ensure!(!method.is_empty(), InvalidMethodSnafu);

        Ok(Self { method, params, id })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the method name and params, for handing off to a handler
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.method, self.params)
    }
}

/// The error half of a response, as reported by the server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, jsonrpc::ErrorCode::ParseError.message())
    }
}

/// The answer to exactly one [`Request`], carrying either a result or an error, never both.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    id: u64,
    outcome: std::result::Result<Value, ErrorObject>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: u64, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error_object(&self) -> Option<&ErrorObject> {
        self.outcome.as_ref().err()
    }

    pub fn into_outcome(self) -> std::result::Result<Value, ErrorObject> {
        self.outcome
    }
}

/// Any message that can appear in a frame
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn id(&self) -> u64 {
        match self {
            Message::Request(request) => request.id(),
            Message::Response(response) => response.id(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: jsonrpc::TwoPointZero,
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: jsonrpc::TwoPointZero,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

/// Superset of the fields of a request and a response.
///
/// Decoding goes through this type so that whichever kind of message a frame holds, the problem
/// with it (if any) can be reported precisely instead of as a generic "did not match" error.
#[derive(Deserialize)]
struct Envelope {
    /// Optional because clients in the wild omit it, but if present it must be "2.0"
    #[serde(rename = "jsonrpc")]
    _version: Option<jsonrpc::TwoPointZero>,
    method: Option<String>,
    params: Option<Value>,
    id: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<ErrorObject>,
}

/// Distinguishes `"result": null` (which is `Some(Value::Null)`) from a missing `result`
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

pub fn encode(request: &Request) -> Result<Bytes> {
    let wire = WireRequest {
        jsonrpc: jsonrpc::TwoPointZero,
        method: &request.method,
        params: &request.params,
        id: request.id,
    };

    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .context(EncodeSnafu)
}

pub fn encode_response(response: &Response) -> Result<Bytes> {
    let wire = WireResponse {
        jsonrpc: jsonrpc::TwoPointZero,
        id: response.id,
        result: response.result(),
        error: response.error_object(),
    };

    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .context(EncodeSnafu)
}

/// Decode the contents of one frame into either a request or a response.
///
/// A frame with a `method` field is a request; anything else is treated as a response.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let envelope: Envelope = serde_json::from_slice(frame).context(DecodeSnafu)?;

    let id = match envelope.id {
        Some(id) => match id.as_u64() {
            Some(id) => id,
            None => return malformed(format!("id must be a non-negative integer, got {}", id)),
        },
        None => return malformed("missing id"),
    };

    match envelope.method {
        Some(method) => {
            ensure!(
                !method.is_empty(),
                MalformedMessageSnafu {
                    reason: "method must not be empty"
                }
            );
            ensure!(
                envelope.result.is_none() && envelope.error.is_none(),
                MalformedMessageSnafu {
                    reason: "request must not carry a result or error"
                }
            );
            let params = match envelope.params {
                None => vec![],
                Some(Value::Array(params)) => params,
                Some(other) => {
                    return malformed(format!("params must be an array, got {}", kind(&other)))
                }
            };

            Ok(Message::Request(Request { method, params, id }))
        }
        None => {
            let outcome = match (envelope.result, envelope.error) {
                (Some(result), None) => Ok(result),
                // Some servers send `"result": null` alongside the error
                (None, Some(error)) | (Some(Value::Null), Some(error)) => Err(error),
                (Some(_), Some(_)) => return malformed("response carries both result and error"),
                (None, None) => return malformed("response carries neither result nor error"),
            };

            Ok(Message::Response(Response { id, outcome }))
        }
    }
}

/// Best-effort extraction of the id from a frame that failed to [`decode`].
///
/// Only works if the frame is at least syntactically valid JSON with an integer `id` field.
pub fn recover_id(frame: &[u8]) -> Option<u64> {
    serde_json::from_slice::<Value>(frame).ok()?.get("id")?.as_u64()
}

/// Convert any serializable value into the positional params of a request.
///
/// Tuples, arrays and `Vec`s become the params list directly.  `()` becomes an empty list.
pub fn to_params<T: Serialize + ?Sized>(params: &T) -> Result<Vec<Value>> {
    match serde_json::to_value(params).context(EncodeSnafu)? {
        Value::Array(params) => Ok(params),
        Value::Null => Ok(vec![]),
        other => ParamsNotArraySnafu { kind: kind(&other) }.fail(),
    }
}

fn malformed<T>(reason: impl Into<String>) -> Result<T> {
    MalformedMessageSnafu {
        reason: reason.into(),
    }
    .fail()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
