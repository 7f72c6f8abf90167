use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Args;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub outbound_buffer: usize,
    /// `None` disables the idle deadline.
    pub idle_timeout: Option<Duration>,
    /// `None` disables keepalive pings.
    pub ping_interval: Option<Duration>,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            outbound_buffer: 64,
            idle_timeout: Some(Duration::from_secs(90)),
            ping_interval: Some(Duration::from_secs(30)),
            write_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// Frames queued per peer before further frames to it are dropped.
    #[arg(long, env = "BEACH_PIER_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Close sessions that send nothing (not even a pong) for this long. 0 disables.
    #[arg(long, env = "BEACH_PIER_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Interval between keepalive pings. 0 disables.
    #[arg(long, env = "BEACH_PIER_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Maximum time a single socket write may take before the peer is dropped.
    #[arg(long, env = "BEACH_PIER_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must be greater than zero");
        }
        if args.write_timeout_secs == 0 {
            bail!("write timeout must be greater than zero");
        }
        Ok(RelayConfig {
            listen_addr,
            outbound_buffer: args.outbound_buffer,
            idle_timeout: non_zero_secs(args.idle_timeout_secs),
            ping_interval: non_zero_secs(args.ping_interval_secs),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
