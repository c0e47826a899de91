use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tether::{BoundEndpoint, Options, DEFAULT_HOST, DEFAULT_PORT};

/// Stand up a bound endpoint and print its statistics until ctrl-c.
#[derive(Parser, Debug)]
#[command(name = "tether-listen", version, about = "Accept connections on IFACE:PORT")]
struct ListenArgs {
    /// Address to listen on, `IFACE:PORT` (`*` for any interface).
    #[arg(default_value_t = format!("{DEFAULT_HOST}:{DEFAULT_PORT}"))]
    address: String,
    /// Allow IPv6 during resolution and socket creation.
    #[arg(long)]
    ipv6: bool,
    /// Statistics print interval in seconds.
    #[arg(long, default_value_t = 2)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = ListenArgs::parse();
    let options = Options {
        ipv4_only: !args.ipv6,
        ..Options::default()
    };
    let endpoint = BoundEndpoint::create(&args.address, options)
        .with_context(|| format!("failed to create bound endpoint on {}", args.address))?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = endpoint.stats();
                println!(
                    "sessions={} established={} broken={}",
                    stats.sessions, stats.established, stats.broken
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    endpoint.stop();
    endpoint.stopped().await;
    Ok(())
}
