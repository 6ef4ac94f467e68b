//! Configuration supplied by the application embedding a client or server.
//!
//! [`RpcConfig`] is the serializable form, usually loaded from a JSON file with
//! [`RpcConfig::from_file`]:
//!
//! ```json
//! { "bindAddress": "0.0.0.0:8090", "defaultTimeout": 2000, "idleTimeout": 60000 }
//! ```
//!
//! Durations are given in milliseconds.  Every option has a default, so any subset may be given.
//! The handler table is not part of this; handlers are registered on the server builder in code.
//! A `handlers` key is accepted for compatibility with existing config files, but its contents are
//! ignored.  Any other unknown key is an error.
use crate::error::*;
use crate::transport::DEFAULT_MAX_FRAME_LENGTH;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::Path;
use std::time::Duration;
use tracing::*;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8090";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RpcConfig {
    /// Address the server listens on
    pub bind_address: String,

    /// How long a client call waits for its response unless the call says otherwise
    #[serde(with = "millis")]
    pub default_timeout: Duration,

    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Server connections that receive nothing for this long are closed
    #[serde(with = "optional_millis")]
    pub idle_timeout: Option<Duration>,

    pub max_frame_length: usize,

    #[serde(skip_serializing)]
    handlers: Option<IgnoredAny>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handlers: None,
        }
    }
}

impl RpcConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;

        let config: Self = serde_json::from_str(&contents).context(ConfigParseSnafu { path })?;
        if config.handlers.is_some() {
            warn!(
                path = %path.display(),
                "Ignoring 'handlers' in config file; handlers are registered on the server builder"
            );
        }

        Ok(config)
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address.clone(),
            idle_timeout: self.idle_timeout,
            max_frame_length: self.max_frame_length,
        }
    }

    /// Client settings for talking to the server at `address`
    pub fn client(&self, address: impl Into<String>) -> ClientConfig {
        ClientConfig {
            address: address.into(),
            default_timeout: self.default_timeout,
            connect_timeout: self.connect_timeout,
            max_frame_length: self.max_frame_length,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub idle_timeout: Option<Duration>,
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        RpcConfig::default().server()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub address: String,
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_length: usize,
}

impl ClientConfig {
    /// Default settings for talking to the server at `address`
    pub fn new(address: impl Into<String>) -> Self {
        RpcConfig::default().client(address)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_options() {
        let config: RpcConfig =
            serde_json::from_str(r#"{"bindAddress": "0.0.0.0:9000", "idleTimeout": 1500}"#)
                .unwrap();

        assert_eq!(
            config,
            RpcConfig {
                bind_address: "0.0.0.0:9000".to_string(),
                idle_timeout: Some(Duration::from_millis(1500)),
                ..Default::default()
            }
        );
    }

    #[test]
    fn serialized_form() {
        let config = RpcConfig::default();
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "bindAddress": "127.0.0.1:8090",
                "defaultTimeout": 5000,
                "connectTimeout": 5000,
                "idleTimeout": null,
                "maxFrameLength": 1048576,
            })
        );
        assert_eq!(serde_json::from_value::<RpcConfig>(value).unwrap(), config);
    }

    #[test]
    fn handlers_key_is_ignored() {
        let config: RpcConfig = serde_json::from_str(
            r#"{"idleTimeout": 60000, "handlers": {"market.list": "market_list", "order.put": 3}}"#,
        )
        .unwrap();

        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        let expected = RpcConfig {
            idle_timeout: config.idle_timeout,
            ..Default::default()
        };
        assert_eq!(config.server(), expected.server());
        assert!(serde_json::to_value(&config).unwrap().get("handlers").is_none());
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(serde_json::from_str::<RpcConfig>(r#"{"bindAdress": "typo"}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"defaultTimeout": 250}}"#).unwrap();

        let config = RpcConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(
            config.client("127.0.0.1:1").default_timeout,
            Duration::from_millis(250)
        );

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert_matches!(
            RpcConfig::from_file(garbage.path()),
            Err(Error::ConfigParse { .. })
        );

        assert_matches!(
            RpcConfig::from_file("/definitely/not/here.json"),
            Err(Error::ConfigRead { .. })
        );
    }
}
