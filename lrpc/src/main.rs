use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use linerpc::{expect_params, Client, RpcConfig, Server};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Read client and server settings from this JSON file
    #[arg(short, long, value_name = "FILE", global = true, env = "LRPC_CONFIG")]
    config: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a method on a server and print the result as JSON
    Call {
        /// Server to connect to.  Defaults to the bind address from the config.
        #[arg(short, long)]
        address: Option<String>,

        /// How long to wait for the response, in milliseconds
        #[arg(short, long, value_name = "MS")]
        timeout: Option<u64>,

        method: String,

        /// Positional params.  Each is parsed as JSON if possible, otherwise passed as a string.
        #[arg(allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Run a server with a few demo methods (`echo`, `math.add`, `server.time`) until Ctrl-C
    Serve {
        /// Address to listen on.  Defaults to the bind address from the config.
        #[arg(short, long)]
        bind: Option<String>,
    },
}

impl Globals {
    fn load_config(&self) -> anyhow::Result<RpcConfig> {
        match self.config.as_deref() {
            Some(path) => {
                debug!(path = %path.display(), "Loading config");
                Ok(RpcConfig::from_file(path)?)
            }
            None => Ok(RpcConfig::default()),
        }
    }
}

impl Commands {
    async fn execute(self, globals: &Globals) -> anyhow::Result<()> {
        let config = globals.load_config()?;

        use Commands::*;
        match self {
            Call {
                address,
                timeout,
                method,
                params,
            } => {
                let address = address.unwrap_or_else(|| config.bind_address.clone());
                let client = Client::connect(&config.client(address)).await?;

                let params = params.iter().map(String::as_str).map(parse_param).collect();
                let result = client
                    .call(&method, params, timeout.map(Duration::from_millis))
                    .await
                    .with_context(|| format!("Call to '{}' failed", method))?;
                client.close().await;

                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Serve { bind } => {
                let mut server_config = config.server();
                if let Some(bind) = bind {
                    server_config.bind_address = bind;
                }

                let mut builder = Server::builder(server_config);
                builder
                    .register_handler("echo", echo)
                    .register_handler("math.add", add)
                    .register_handler("server.time", server_time);
                let server = builder.build();

                let cancellation_token = CancellationToken::new();
                ctrlc::set_handler({
                    let token = cancellation_token.clone();
                    move || {
                        eprintln!("Ctrl-C detected; shutting down...");
                        token.cancel();
                    }
                })?;

                info!(address = %server.config().bind_address, "Starting server");
                server.serve(cancellation_token).await?;
            }
        }

        Ok(())
    }
}

/// `42` and `{"a": 1}` are JSON; `BTCBCH` isn't, so it's taken as the string `"BTCBCH"`
fn parse_param(param: &str) -> Value {
    serde_json::from_str(param).unwrap_or_else(|_| Value::String(param.to_string()))
}

async fn echo(params: Vec<Value>) -> anyhow::Result<Value> {
    Ok(Value::Array(params))
}

async fn add(params: Vec<Value>) -> anyhow::Result<Value> {
    let (a, b): (f64, f64) = expect_params(params)?;
    Ok(json!(a + b))
}

async fn server_time(_params: Vec<Value>) -> anyhow::Result<Value> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(json!(now.as_secs()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Logs go to stderr as JSON so stdout carries only call results
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    if let Err(e) = cli.command.execute(&cli.globals).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that there aren't any invalid attributes in the CLI definition that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn params_fall_back_to_strings() {
        assert_eq!(parse_param("42"), json!(42));
        assert_eq!(parse_param(r#"{"a": [1]}"#), json!({"a": [1]}));
        assert_eq!(parse_param("BTCBCH"), json!("BTCBCH"));
        assert_eq!(parse_param("true"), json!(true));
    }

    #[tokio::test]
    async fn demo_handlers() {
        assert_eq!(echo(vec![json!("x")]).await.unwrap(), json!(["x"]));
        assert_eq!(add(vec![json!(1), json!(2.5)]).await.unwrap(), json!(3.5));
        assert!(add(vec![json!("one")]).await.is_err());
        assert!(server_time(vec![]).await.unwrap().as_u64().is_some());
    }
}
