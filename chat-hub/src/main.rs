use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_hub::{
    cli::{Cli, Command, HubArgs, RelayArgs},
    hub::Hub,
    observer::ObserverReactor,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => run_hub(args).await,
        Command::Relay(args) => run_relay(args).await,
    }
}

async fn run_hub(args: HubArgs) -> Result<()> {
    // The observer feed must be up before any chat traffic can be published.
    let reactor = ObserverReactor::start(args.observer_listen)?;
    info!("observer feed listening on {}", reactor.local_addr());

    let listener = TcpListener::bind(args.listen).await?;
    let hub = Hub::new(listener, reactor.bridge(), args.hub_config());
    info!("chat hub listening on {}", hub.local_addr()?);

    let served = hub.run_until_ctrl_c().await;
    if let Err(err) = &served {
        warn!("hub exited with error: {err:?}");
    }
    reactor.shutdown().await?;
    served
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;
    let relay = Relay::new(listener, args.relay_config());
    info!(upstream = %args.upstream, "relay forwarding to hub");
    info!("relay listening on {}", relay.local_addr()?);

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
