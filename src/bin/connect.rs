use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tether::{ConnectedEndpoint, Options};

/// Maintain one outbound connection and print its statistics until ctrl-c.
#[derive(Parser, Debug)]
#[command(
    name = "tether-connect",
    version,
    about = "Keep a connection to [LOCAL_IFACE;]HOST:PORT alive"
)]
struct ConnectArgs {
    /// Address to connect to, `[LOCAL_IFACE;]HOST:PORT`.
    address: String,
    /// Allow IPv6 during resolution and socket creation.
    #[arg(long)]
    ipv6: bool,
    /// Initial reconnect interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    reconnect_ivl: u64,
    /// Maximum reconnect interval in milliseconds (0 keeps the interval
    /// flat).
    #[arg(long, default_value_t = 0)]
    reconnect_ivl_max: u64,
    /// Statistics print interval in seconds.
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = ConnectArgs::parse();
    let options = Options {
        ipv4_only: !args.ipv6,
        reconnect_ivl: Duration::from_millis(args.reconnect_ivl),
        reconnect_ivl_max: Duration::from_millis(args.reconnect_ivl_max),
        ..Options::default()
    };
    let endpoint = ConnectedEndpoint::create(&args.address, options)
        .with_context(|| format!("failed to create connected endpoint for {}", args.address))?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = endpoint.stats();
                println!(
                    "connected={} established={} broken={} connect_errors={}",
                    stats.sessions, stats.established, stats.broken, stats.connect_errors
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    endpoint.stop();
    endpoint.stopped().await;
    Ok(())
}
