use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_hub::{
    config::{HubConfig, RelayConfig},
    hub::Hub,
    observer::ObserverBridge,
    protocol::{CONNECTED, read_frame, write_frame},
    relay::Relay,
};
use tokio::{
    io::{AsyncBufRead, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};

async fn next_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    timeout(Duration::from_secs(2), read_frame(reader))
        .await
        .context("timed out waiting for a frame")??
        .ok_or_else(|| anyhow!("connection closed"))
}

async fn spawn_hub() -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (bridge, _events) = ObserverBridge::channel();
    let hub = Hub::new(listener, bridge, HubConfig::default());
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(hub.run_until(async move {
        let _ = stopped.await;
    }));
    Ok((addr, stop))
}

async fn spawn_relay(upstream: SocketAddr) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::new(
        listener,
        RelayConfig {
            upstream,
            ..RelayConfig::default()
        },
    );
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(relay.run_until(async move {
        let _ = stopped.await;
    }));
    Ok((addr, stop))
}

#[tokio::test]
async fn relayed_client_joins_with_a_marked_nickname() -> Result<()> {
    let (hub_addr, stop_hub) = spawn_hub().await?;
    let (relay_addr, stop_relay) = spawn_relay(hub_addr).await?;

    let mut ann = BufReader::new(TcpStream::connect(hub_addr).await?);
    write_frame(&mut ann, "ann").await?;
    assert_eq!(next_line(&mut ann).await?, CONNECTED);
    assert_eq!(next_line(&mut ann).await?, "USERLIST_UPDATE:ann");

    let mut dan = BufReader::new(TcpStream::connect(relay_addr).await?);
    write_frame(&mut dan, "dan").await?;
    assert_eq!(next_line(&mut dan).await?, CONNECTED);
    assert_eq!(next_line(&mut dan).await?, "USERLIST_UPDATE:ann,*dan");
    assert_eq!(next_line(&mut ann).await?, "*dan has joined the chat.");
    assert_eq!(next_line(&mut ann).await?, "USERLIST_UPDATE:ann,*dan");

    write_frame(&mut dan, "hello through the relay").await?;
    assert_eq!(next_line(&mut ann).await?, "*dan: hello through the relay");

    write_frame(&mut ann, "PM *dan welcome").await?;
    assert_eq!(next_line(&mut dan).await?, "[Private Message] ann: welcome");
    assert_eq!(
        next_line(&mut ann).await?,
        "[System] Your message was sent to *dan."
    );

    // Closing the client end tears down the hub connection too.
    drop(dan);
    assert_eq!(next_line(&mut ann).await?, "*dan has left the chat.");
    assert_eq!(next_line(&mut ann).await?, "USERLIST_UPDATE:ann");

    let _ = stop_relay.send(());
    let _ = stop_hub.send(());
    Ok(())
}
