// mock-airspy-tcp -- stands in for airspy_tcp in end-to-end tests.
//
// Binds the control socket, announces readiness on stdout, then serves
// every connection: a 12-byte header first, then one JSON settings line in
// reply to each 5-byte command. Settings are reported in native units.
//
// Usage:
//   mock-airspy-tcp -p /tmp/airspy-1:4.sock -S a74068c82f4e3c53 -s 6000000 -B 48128

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use sdrlib::ParamTable;
use sdrlib::airspy::commands::{COMMAND_LEN, REPLY_HEADER_LEN, decode_command};
use sdrlib_test_app::mock;

#[derive(Parser)]
#[command(name = "mock-airspy-tcp")]
struct Cli {
    /// Control socket path.
    #[arg(short = 'p')]
    socket: PathBuf,

    /// Device serial number.
    #[arg(short = 'S')]
    serial: Option<String>,

    /// Hardware sample rate.
    #[arg(short = 's', default_value_t = 6_000_000)]
    rate: u32,

    /// USB buffer size in bytes.
    #[arg(short = 'B', default_value_t = 0)]
    buffer: usize,
}

type Settings = Arc<Mutex<BTreeMap<String, Value>>>;

fn header() -> [u8; REPLY_HEADER_LEN] {
    let mut h = [0u8; REPLY_HEADER_LEN];
    h[..4].copy_from_slice(b"RTL0");
    h[7] = 5;
    h
}

fn apply(settings: &Settings, code: u8, value: u32) -> Value {
    let name = ParamTable::standard()
        .specs()
        .iter()
        .find(|s| s.code == code)
        .map(|s| s.name);
    let mut settings = settings.lock().unwrap_or_else(|p| p.into_inner());
    match name {
        Some(name) => {
            settings.insert(name.to_string(), json!(value));
        }
        None => warn!(code, value, "unknown command"),
    }
    Value::Object(settings.clone().into_iter().collect())
}

async fn serve(mut stream: UnixStream, settings: Settings) -> Result<()> {
    stream.write_all(&header()).await?;
    let mut frame = [0u8; COMMAND_LEN];
    loop {
        match stream.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let Some((code, value)) = decode_command(&frame) else {
            continue;
        };
        info!(code, value, "command");
        let reply = apply(&settings, code, value);
        stream.write_all(format!("{reply}\n").as_bytes()).await?;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    mock::init_logging();
    let cli = Cli::parse();
    let launches = mock::record_launch("mock-airspy-tcp").context("launch log")?;
    mock::arm_crash(launches, 1);

    let listener = UnixListener::bind(&cli.socket)
        .with_context(|| format!("failed to bind {}", cli.socket.display()))?;
    info!(
        serial = cli.serial.as_deref().unwrap_or("-"),
        rate = cli.rate,
        buffer = cli.buffer,
        "mock airspy up"
    );

    let settings: Settings = Arc::new(Mutex::new(BTreeMap::from([
        ("frequency".to_string(), json!(0)),
        ("rate".to_string(), json!(cli.rate)),
        ("streaming".to_string(), json!(0)),
    ])));
    mock::announce(&format!("airspy_tcp: Listening on {}", cli.socket.display()))?;

    loop {
        let (stream, _) = listener.accept().await?;
        let settings = settings.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, settings).await {
                warn!(error = %e, "connection ended");
            }
        });
    }
}
