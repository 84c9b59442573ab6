use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rfcomm_link_shared::codec::{self, Response};
use rfcomm_link_shared::{Command, DeviceId, Request, ServiceEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "rfcomm-linkctl")]
#[command(version, about = "Control an rfcomm-linkd daemon", long_about = None)]
struct Cli {
    /// Daemon control socket
    #[arg(
        short,
        long,
        global = true,
        default_value = "127.0.0.1:7878",
        env = "RFCOMM_LINK_CONTROL_ADDR"
    )]
    addr: String,

    /// Keep printing events after the reply
    #[arg(short, long, global = true)]
    follow: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby devices
    Discover,
    /// Bond with a device
    Pair { device: String },
    /// Remove the bond with a device
    Unpair { device: String },
    /// Open (or re-open) the serial link to a device
    Connect { device: String },
    /// Close the serial link to a device
    Disconnect { device: String },
    /// Send text over the serial link
    Write {
        device: String,
        text: String,
        /// Do not append a newline
        #[arg(long)]
        no_newline: bool,
    },
    /// Start keep-alive probing of a link
    Monitor { device: String },
    /// Stop keep-alive probing of a link
    Unmonitor { device: String },
    /// List bonded devices
    Paired,
    /// List devices seen during discovery
    Devices,
    /// Show the link state of a device
    Status { device: String },
    /// Close every link
    Teardown,
    /// Print events until interrupted
    Watch,
}

impl Commands {
    /// Request to send, `None` for commands that only listen
    fn request(&self) -> Option<Request> {
        let id = |device: &String| DeviceId::from(device.as_str());
        let request = match self {
            Commands::Discover => Command::Discover.into(),
            Commands::Pair { device } => Command::Pair(id(device)).into(),
            Commands::Unpair { device } => Command::Unpair(id(device)).into(),
            Commands::Connect { device } => Command::Connect(id(device)).into(),
            Commands::Disconnect { device } => Command::Disconnect(id(device)).into(),
            Commands::Write {
                device,
                text,
                no_newline,
            } => {
                let mut payload = text.clone().into_bytes();
                if !no_newline {
                    payload.push(b'\n');
                }
                Command::Write(id(device), Bytes::from(payload)).into()
            }
            Commands::Monitor { device } => Command::Monitor(id(device)).into(),
            Commands::Unmonitor { device } => Command::StopMonitor(id(device)).into(),
            Commands::Paired => Request::Paired,
            Commands::Devices => Request::Devices,
            Commands::Status { device } => Request::Status(id(device)),
            Commands::Teardown => Command::Teardown.into(),
            Commands::Watch => return None,
        };
        Some(request)
    }
}

/// Human-readable form of a reply line
fn render(response: &Response) -> String {
    match response {
        Response::Ok => "ok".to_string(),
        Response::Err(message) => format!("error: {}", message),
        Response::Device(record) => format!(
            "{}  {:<7}  {}",
            record.id,
            record.bond_state.as_str(),
            record.name.as_deref().unwrap_or("-")
        ),
        Response::State {
            device,
            state,
            connected,
        } => format!(
            "{}  {}  {}",
            device,
            state,
            if *connected { "connected" } else { "not connected" }
        ),
        Response::Event(event) => render_event(event),
    }
}

fn render_event(event: &ServiceEvent) -> String {
    let detail = match event {
        ServiceEvent::DeviceFound(record) => format!(" {} ({})", record.id, record.display_name()),
        ServiceEvent::ConnectionError { device, reason }
        | ServiceEvent::WriteError { device, reason } => format!(" {}: {}", device, reason),
        ServiceEvent::WriteFinished { device, bytes } => format!(" {} ({} bytes)", device, bytes),
        other => other
            .device()
            .map(|d| format!(" {}", d))
            .unwrap_or_default(),
    };
    format!("[{}]{}", event.kind().to_ascii_lowercase(), detail)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let stream = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("cannot reach rfcomm-linkd at {}", cli.addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let request = cli.command.request();
    let follow = cli.follow || request.is_none();
    if let Some(request) = &request {
        let line = codec::encode_request(request);
        writer.write_all(&codec::encode_line(&line)).await?;
    }

    let mut answered = request.is_none();
    while let Some(line) = lines.next_line().await? {
        let response = match codec::parse_response(&line) {
            Ok(response) => response,
            Err(e) => {
                eprintln!("unreadable line from daemon ({}): {}", e, line);
                continue;
            }
        };

        // Events that arrive before the reply are shown only when following
        if matches!(response, Response::Event(_)) && !follow {
            continue;
        }

        println!("{}", render(&response));

        if !answered && response.is_terminal() {
            answered = true;
            if let Response::Err(message) = &response {
                bail!("request failed: {}", message);
            }
            if !follow {
                break;
            }
        }
    }

    Ok(())
}
