use anyhow::Result;
use clap::Parser;
use rfcomm_link_shared::keepalive;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rfcomm-peer")]
#[command(version, about = "Accept serial links and log what arrives", long_about = None)]
struct Args {
    /// TCP address to listen on (simulation mode)
    #[arg(long, default_value = "127.0.0.1:9000", env = "RFCOMM_PEER_LISTEN")]
    listen: String,

    /// Listen on this RFCOMM channel instead of TCP
    #[cfg(feature = "bluez")]
    #[arg(long, env = "RFCOMM_PEER_CHANNEL")]
    rfcomm_channel: Option<u8>,
}

/// Drop keep-alive probes from received data
fn strip_keepalive(data: &[u8]) -> Vec<u8> {
    data.iter()
        .copied()
        .filter(|b| *b != keepalive::SENTINEL)
        .collect()
}

/// Log everything read from one link until it closes
async fn serve_link<R: AsyncRead + Unpin>(mut reader: R, peer: String) {
    let mut buf = vec![0u8; 1024];
    let mut probes = 0usize;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("[PEER] {} disconnected ({} keep-alive probes)", peer, probes);
                break;
            }
            Ok(n) => {
                let payload = strip_keepalive(&buf[..n]);
                probes += n - payload.len();
                if !payload.is_empty() {
                    info!(
                        "[PEER] {} bytes from {}: {}",
                        payload.len(),
                        peer,
                        String::from_utf8_lossy(&payload).trim_end()
                    );
                }
            }
            Err(e) => {
                warn!("[PEER] Read error from {}: {}", peer, e);
                break;
            }
        }
    }
}

async fn listen_tcp(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[PEER] Listening on {}", listener.local_addr()?);

    loop {
        let (socket, addr) = listener.accept().await?;
        info!("[PEER] Link from {}", addr);
        tokio::spawn(serve_link(socket, addr.to_string()));
    }
}

#[cfg(feature = "bluez")]
async fn listen_rfcomm(channel: u8) -> Result<()> {
    use bluer::rfcomm::{Listener, SocketAddr};

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter.set_discoverable(true).await?;

    let listener = Listener::bind(SocketAddr::new(adapter.address().await?, channel)).await?;
    info!("[PEER] Listening on RFCOMM channel {}", channel);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("[PEER] Link from {}", addr.addr);
        tokio::spawn(serve_link(stream, addr.addr.to_string()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    run(Args::parse()).await
}

#[cfg(feature = "bluez")]
async fn run(args: Args) -> Result<()> {
    match args.rfcomm_channel {
        Some(channel) => listen_rfcomm(channel).await,
        None => listen_tcp(&args.listen).await,
    }
}

#[cfg(not(feature = "bluez"))]
async fn run(args: Args) -> Result<()> {
    listen_tcp(&args.listen).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_keepalive() {
        assert_eq!(strip_keepalive(&[0, b'h', 0, b'i', 0]), b"hi");
        assert!(strip_keepalive(&[0, 0, 0]).is_empty());
    }
}
