use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use beach_beacon::config::{
    handshake_timeout_from_secs, matches_truthy, ServerConfig, DEFAULT_AUTH_TIMEOUT_SECS,
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_LISTEN_ADDR, DEFAULT_SEND_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_GRACE_SECS,
};
use beach_beacon::registry::DEFAULT_CHANNEL_DEPTH;
use beach_beacon::telemetry::TelemetryConfig;
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Debug, Parser)]
#[command(
    name = "beach-beacon",
    author,
    version,
    about = "Beach push-notification relay and debug listener"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Export tracing spans to stdout via OpenTelemetry (true/1/yes/on).
    #[arg(long, env = "BEACH_BEACON_OTEL_STDOUT", global = true)]
    otel_stdout: Option<String>,

    #[command(flatten)]
    pub server: ServerArgs,
}

impl Cli {
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            otel_stdout: self.otel_stdout.as_deref().is_some_and(matches_truthy),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a relay as a client and print every notification received
    Listen {
        /// Relay base URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Connection id passed as the `cid` query parameter
        #[arg(short, long)]
        cid: String,

        /// Token forwarded to the authentication service
        #[arg(short, long, env = "BEACH_BEACON_TOKEN")]
        token: String,
    },
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_BEACON_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,

    /// Authentication service endpoint that exchanges tokens for user ids.
    #[arg(long, env = "AUTH_URL")]
    auth_url: Option<String>,

    /// Client id mixed into submission tokens.
    #[arg(long, env = "CLIENT_ID")]
    client_id: Option<String>,

    /// Client secret mixed into submission tokens.
    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Serve the /test debug page (true/1/yes/on).
    #[arg(long, env = "TESTING")]
    testing: Option<String>,

    /// Seconds a new connection has to send its token frame; 0 waits forever.
    #[arg(
        long,
        env = "BEACH_BEACON_HANDSHAKE_TIMEOUT_SECS",
        default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_SECS
    )]
    handshake_timeout_secs: u64,

    /// Per-request timeout for the authentication service.
    #[arg(
        long,
        env = "BEACH_BEACON_AUTH_TIMEOUT_SECS",
        default_value_t = DEFAULT_AUTH_TIMEOUT_SECS
    )]
    auth_timeout_secs: u64,

    /// Notifications buffered per connection before it is evicted.
    #[arg(long, env = "BEACH_BEACON_CHANNEL_DEPTH", default_value_t = DEFAULT_CHANNEL_DEPTH)]
    channel_depth: usize,

    /// Milliseconds a notification may wait on a full connection queue
    /// before that connection is evicted.
    #[arg(
        long,
        env = "BEACH_BEACON_SEND_TIMEOUT_MS",
        default_value_t = DEFAULT_SEND_TIMEOUT_MS
    )]
    send_timeout_ms: u64,

    /// Grace period applied during shutdown.
    #[arg(
        long,
        env = "BEACH_BEACON_SHUTDOWN_GRACE_SECS",
        default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS
    )]
    shutdown_grace_secs: u64,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let auth_url = required(args.auth_url, "AUTH_URL")?;
        let client_id = required(args.client_id, "CLIENT_ID")?;
        let client_secret = required(args.client_secret, "CLIENT_SECRET")?;
        if args.channel_depth == 0 {
            bail!("channel depth must be greater than zero");
        }
        if args.send_timeout_ms == 0 {
            bail!("send timeout must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            auth_url,
            client_id,
            client_secret,
            testing: args.testing.as_deref().is_some_and(matches_truthy),
            handshake_timeout: handshake_timeout_from_secs(args.handshake_timeout_secs),
            auth_timeout: Duration::from_secs(args.auth_timeout_secs),
            channel_depth: args.channel_depth,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(anyhow!("{name} must be set (flag or environment)")),
    }
}

pub async fn run_listener(url: String, cid: String, token: String) -> Result<()> {
    let ws_url = format!("{}/ws?cid={}", url.trim_end_matches('/'), cid);
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let hello = json!({ "token": token }).to_string();
    write.send(Message::Text(hello.into())).await?;
    println!("Connected to {ws_url}; waiting for notifications (Ctrl-C to stop)");

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(Message::Binary(bytes))) => {
                    println!("{}", String::from_utf8_lossy(&bytes))
                }
                Some(Ok(Message::Close(frame))) => {
                    match frame {
                        Some(frame) => println!(
                            "Relay closed the connection: code {} {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ),
                        None => println!("Relay closed the connection"),
                    }
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!("Connection error: {}", e)),
                None => {
                    println!("Connection closed");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                write.send(Message::Close(None)).await?;
                return Ok(());
            }
        }
    }
}
