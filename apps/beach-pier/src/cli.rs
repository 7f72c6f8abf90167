use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::value::RawValue;
use tokio::{
    net::TcpStream,
    time::{timeout, Duration},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use crate::config::ServeArgs;
use crate::envelope::{Envelope, ErrorCode, RelayKind, RelayRoute};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "beach-pier", version)]
#[command(about = "Beach Pier signaling relay and diagnostic peers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server options (used when no subcommand is given)
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register an identity and print every envelope the relay sends it
    Watch {
        /// Relay endpoint (e.g., ws://localhost:5000/ws)
        #[arg(short, long, default_value = "ws://localhost:5000/ws")]
        url: String,

        /// Identity to register as
        #[arg(short, long)]
        identity: String,
    },

    /// Register an identity, wait for a peer to appear and send it one relay envelope
    Signal {
        /// Relay endpoint (e.g., ws://localhost:5000/ws)
        #[arg(short, long, default_value = "ws://localhost:5000/ws")]
        url: String,

        /// Identity to register as
        #[arg(short, long)]
        identity: String,

        /// Identity of the receiving peer
        #[arg(short, long)]
        to: String,

        /// Relay envelope type
        #[arg(short, long, value_enum, default_value_t = KindArg::Offer)]
        kind: KindArg,

        /// JSON payload placed in the envelope's data field
        #[arg(short, long, default_value = "null")]
        data: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Offer,
    Answer,
    Candidate,
}

impl From<KindArg> for RelayKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Offer => RelayKind::Offer,
            KindArg::Answer => RelayKind::Answer,
            KindArg::Candidate => RelayKind::Candidate,
        }
    }
}

pub async fn run_watch(url: String, identity: String) -> Result<()> {
    let (_write, mut read) = connect_and_register(&url, &identity).await?;

    while let Some(frame) = read.next().await {
        match frame.context("relay connection failed")? {
            Message::Text(text) => {
                if let Ok(Envelope::Error {
                    data: ErrorCode::IdentityInUse,
                }) = Envelope::decode(&text)
                {
                    bail!("identity {identity:?} is already in use");
                }
                println!("{}", text.as_str());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("relay closed the connection");
    Ok(())
}

pub async fn run_signal(
    url: String,
    identity: String,
    to: String,
    kind: KindArg,
    data: String,
) -> Result<()> {
    let payload = RawValue::from_string(data).context("--data must be valid JSON")?;
    let (mut write, mut read) = connect_and_register(&url, &identity).await?;

    let wait = timeout(CONNECT_TIMEOUT, async {
        while let Some(frame) = read.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            match Envelope::decode(&text) {
                Ok(Envelope::UserList { data }) if data.iter().any(|peer| peer == &to) => {
                    return Ok(());
                }
                Ok(Envelope::UserList { data }) => {
                    debug!("waiting for {} (online: {:?})", to, data);
                }
                Ok(Envelope::Error {
                    data: ErrorCode::IdentityInUse,
                }) => {
                    return Err(anyhow!("identity {identity:?} is already in use"));
                }
                _ => {}
            }
        }
        Err::<(), _>(anyhow!("Connection closed unexpectedly"))
    })
    .await;

    match wait {
        Ok(result) => result?,
        Err(_) => {
            error!("Timeout waiting for {} to come online", to);
            bail!("peer {to:?} is not registered with the relay");
        }
    }

    let envelope = Envelope::relay(
        kind.into(),
        RelayRoute {
            from: Some(identity),
            to,
            data: Some(payload),
        },
    );
    write
        .send(Message::Text(envelope.to_json()?.into()))
        .await
        .context("failed to send relay envelope")?;
    write.close().await.ok();
    Ok(())
}

async fn connect_and_register(
    url: &str,
    identity: &str,
) -> Result<(SplitSink<Socket, Message>, SplitStream<Socket>)> {
    debug!("Connecting to {} as {}", url, identity);

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, read) = ws_stream.split();

    let register = Envelope::Register {
        from: identity.to_string(),
    };
    write.send(Message::Text(register.to_json()?.into())).await?;
    Ok((write, read))
}
