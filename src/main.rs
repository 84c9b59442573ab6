use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rfcomm_link::config::{BluetoothConfig, BluetoothMode, LinkConfig};
use rfcomm_link::control::ControlServer;
use rfcomm_link::transport::{SimulatedDevice, TcpSimProvider, TransportProvider};
use rfcomm_link::LinkService;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Real RFCOMM through BlueZ
    Rfcomm,
    /// TCP endpoints standing in for devices
    Sim,
}

impl From<Mode> for BluetoothMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Rfcomm => BluetoothMode::Rfcomm,
            Mode::Sim => BluetoothMode::TcpSimulation,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "rfcomm-linkd")]
#[command(version, about = "RFCOMM link daemon with a line-oriented control socket", long_about = None)]
struct Args {
    /// Transport mode
    #[arg(long, value_enum, default_value = "sim", env = "RFCOMM_LINK_MODE")]
    mode: Mode,

    /// Control socket address
    #[arg(long, default_value = "127.0.0.1:7878", env = "RFCOMM_LINK_CONTROL_ADDR")]
    control_addr: String,

    /// RFCOMM channel of the serial service on the peers
    #[arg(long, default_value = "1", env = "RFCOMM_LINK_CHANNEL")]
    channel: u8,

    /// Length of a discovery scan in seconds
    #[arg(long, default_value = "10", env = "RFCOMM_LINK_SCAN_SECS")]
    scan_secs: u64,

    /// Seconds between keep-alive probes
    #[arg(long, default_value = "10", env = "RFCOMM_LINK_KEEPALIVE_SECS")]
    keepalive_secs: u64,

    /// Simulated device `id=host:port[,name]` (repeatable)
    #[arg(long = "sim-device", value_delimiter = ';', env = "RFCOMM_LINK_SIM_DEVICES")]
    sim_devices: Vec<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<LinkConfig> {
        let simulated_devices = self
            .sim_devices
            .iter()
            .map(|s| s.parse::<SimulatedDevice>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut config = LinkConfig {
            control_addr: self.control_addr,
            bluetooth: BluetoothConfig {
                mode: self.mode.into(),
                channel: self.channel,
                scan_duration: Duration::from_secs(self.scan_secs),
                simulated_devices,
            },
            ..Default::default()
        };
        config.service.keepalive_interval = Duration::from_secs(self.keepalive_secs.max(1));
        Ok(config)
    }
}

async fn build_provider(config: &BluetoothConfig) -> anyhow::Result<Arc<dyn TransportProvider>> {
    match config.mode {
        BluetoothMode::TcpSimulation => {
            info!(
                "  Simulated devices: {}",
                config.simulated_devices.len()
            );
            Ok(Arc::new(TcpSimProvider::new(config.simulated_devices.clone())))
        }
        #[cfg(feature = "bluez")]
        BluetoothMode::Rfcomm => {
            use rfcomm_link::transport::{BluezProvider, BtDiscoveryConfig, RfcommConfig};

            let provider = BluezProvider::new(RfcommConfig {
                channel: config.channel,
                discovery: BtDiscoveryConfig {
                    scan_duration: config.scan_duration,
                },
            })
            .await?;
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "bluez"))]
        BluetoothMode::Rfcomm => {
            anyhow::bail!("RFCOMM mode requires building with the `bluez` feature")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Args::parse().into_config()?;

    info!("rfcomm-linkd starting");
    info!("  Mode: {:?}", config.bluetooth.mode);
    info!("  Control socket: {}", config.control_addr);

    let provider = build_provider(&config.bluetooth).await?;
    let service = LinkService::new(provider, config.service.clone()).await;

    let server = ControlServer::new(service.clone(), config.service.notification_capacity);

    // Log every relayed event
    let mut events = server.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.is_error() => warn!("[CTL] {:?}", event),
                Ok(event) => info!("[CTL] {:?}", event),
                Err(RecvError::Lagged(n)) => warn!("[CTL] Event log lagged by {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let listener = TcpListener::bind(&config.control_addr).await?;

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!("Control socket failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    service.teardown().await;
    server.shutdown();
    info!("rfcomm-linkd stopped");
    Ok(())
}
