//! Line-oriented control socket for the daemon
//!
//! Clients send one request per line and receive zero or more listing lines
//! followed by `OK` or `ERR <message>`. Service events are pushed to every
//! client as `EVENT ...` lines at any time.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rfcomm_link_shared::codec::{self, LineDecoder, Response};
use rfcomm_link_shared::{Request, ServiceEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::events::{EventBridge, Subscription};
use crate::service::LinkService;

/// Relays requests into a [`LinkService`] and its events out to clients
pub struct ControlServer {
    service: LinkService,
    bridge: Arc<EventBridge>,
    subscriptions: Vec<Subscription>,
}

impl ControlServer {
    /// Register the event bridge on every listener slot of `service`
    pub fn new(service: LinkService, capacity: usize) -> Self {
        let bridge = Arc::new(EventBridge::new(capacity));
        let subscriptions = vec![
            service.set_discovery_listener(bridge.clone()),
            service.set_bond_listener(bridge.clone()),
            service.set_connection_listener(bridge.clone()),
            service.set_write_listener(bridge.clone()),
        ];

        // Notifications travel on their own broadcast channel
        let mut notifications = service.subscribe_notifications();
        let relay = Arc::clone(&bridge);
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => relay.send(ServiceEvent::from(notification)),
                    Err(RecvError::Lagged(n)) => {
                        warn!("[CTL] Notification relay lagged by {}", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            service,
            bridge,
            subscriptions,
        }
    }

    /// Subscribe to the relayed events
    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.bridge.subscribe()
    }

    /// Accept clients until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("[CTL] Control socket listening on {}", listener.local_addr()?);

        loop {
            let (socket, addr) = listener.accept().await?;
            info!("[CTL] Client connected: {}", addr);

            let service = self.service.clone();
            let events = self.bridge.subscribe();
            tokio::spawn(async move {
                if let Err(e) = handle_client(service, events, socket, addr).await {
                    warn!("[CTL] Client {} error: {}", addr, e);
                }
                info!("[CTL] Client disconnected: {}", addr);
            });
        }
    }

    /// Remove the bridge from the listener slots
    pub fn shutdown(self) {
        for sub in self.subscriptions {
            self.service.unsubscribe(sub);
        }
    }
}

async fn handle_client(
    service: LinkService,
    mut events: broadcast::Receiver<ServiceEvent>,
    mut socket: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let (mut reader, mut writer) = socket.split();
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                decoder.extend(&buf[..n]);

                // Process all complete lines
                loop {
                    let line = match decoder.decode_next() {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            let reply = Response::Err(e.to_string());
                            writer.write_all(&codec::encode_line(&codec::encode_response(&reply))).await?;
                            return Err(e.into());
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    debug!("[CTL] {} -> {}", addr, line);
                    for response in handle_request(&service, &line).await {
                        writer.write_all(&codec::encode_line(&codec::encode_response(&response))).await?;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let line = codec::encode_response(&Response::Event(event));
                    writer.write_all(&codec::encode_line(&line)).await?;
                }
                Err(RecvError::Lagged(n)) => warn!("[CTL] Client {} missed {} events", addr, n),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Execute one request line and build its reply
pub async fn handle_request(service: &LinkService, line: &str) -> Vec<Response> {
    let request = match codec::parse_request(line) {
        Ok(request) => request,
        Err(e) => return vec![Response::Err(e.to_string())],
    };

    match request {
        Request::Command(command) => match service.execute(command).await {
            Ok(()) => vec![Response::Ok],
            Err(e) => vec![Response::Err(e.to_string())],
        },
        Request::Paired => match service.paired_devices().await {
            Ok(devices) => devices
                .into_iter()
                .map(Response::Device)
                .chain(std::iter::once(Response::Ok))
                .collect(),
            Err(e) => vec![Response::Err(e.to_string())],
        },
        Request::Devices => service
            .discovered_devices()
            .into_iter()
            .map(Response::Device)
            .chain(std::iter::once(Response::Ok))
            .collect(),
        Request::Status(device) => vec![
            Response::State {
                state: service.link_state(&device),
                connected: service.is_connected(&device),
                device,
            },
            Response::Ok,
        ],
    }
}
