use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Error encoding message to JSON"))]
    Encode { source: serde_json::Error },

    #[snafu(display("Params must serialize to a JSON array, got {kind}"))]
    ParamsNotArray { kind: &'static str },

    #[snafu(display("Error decoding JSON message"))]
    Decode { source: serde_json::Error },

    #[snafu(display("Malformed message: {reason}"))]
    MalformedMessage { reason: String },

    #[snafu(display("Method name must not be empty"))]
    InvalidMethod,

    #[snafu(display("Error connecting to '{address}'"))]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Timed out after {timeout:?} connecting to '{address}'"))]
    ConnectTimeout { address: String, timeout: Duration },

    #[snafu(display("Error binding listener to '{address}'"))]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Error sending frame"))]
    Send { source: std::io::Error },

    #[snafu(display("Error receiving frame"))]
    Receive { source: std::io::Error },

    #[snafu(display("Frame exceeds the maximum frame length of {max} bytes"))]
    FrameTooLarge { max: usize },

    #[snafu(display("Connection closed by peer ({pending} bytes of an incomplete frame discarded)"))]
    ConnectionClosed { pending: usize },

    #[snafu(display("No frame received within {timeout:?}"))]
    ReceiveTimeout { timeout: Duration },

    #[snafu(display("Call to '{method}' (id {id}) timed out after {timeout:?}"))]
    CallTimeout {
        method: String,
        id: u64,
        timeout: Duration,
    },

    #[snafu(display("Remote error {code}: {message}"))]
    Remote { code: i32, message: String },

    #[snafu(display("Request id {id} is already in use by a pending call"))]
    IdInUse { id: u64 },

    #[snafu(display("Error reading config file '{}'", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error parsing config file '{}'", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
