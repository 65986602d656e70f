// mock-grh -- stands in for the GNU Radio bridge in end-to-end tests.
//
// Binds `<dir>/<name>` (dir from GRH_SOCKET_DIR, default /tmp), announces
// readiness on stdout, and treats connections in arrival order: command,
// data, then raw streams. Only `list` gets a reply; every other command is
// acted on silently, as the real bridge does.
//
// Environment:
//   GRH_SOCKET_DIR     socket directory
//   MOCK_GRH_RATE      frames per second reported for each started port (100)
//   MOCK_GRH_SILENT    comma-separated ports left out of `list` replies
//   MOCK_LOG, MOCK_CRASH_FIRST_MS   see sdrlib_test_app::mock
//
// Usage:
//   mock-grh -s gnuradio.sock

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use sdrlib_test_app::mock;

#[derive(Parser)]
#[command(name = "mock-grh")]
struct Cli {
    /// Socket file name.
    #[arg(short = 's', default_value = "gnuradio.sock")]
    socket: String,
}

#[derive(Debug)]
struct Bridge {
    rate: f64,
    silent: BTreeSet<u32>,
    /// Start time per running port.
    started: BTreeMap<u32, Instant>,
}

type Shared = Arc<Mutex<Bridge>>;

fn lock(shared: &Shared) -> std::sync::MutexGuard<'_, Bridge> {
    shared.lock().unwrap_or_else(|p| p.into_inner())
}

fn status(shared: &Shared) -> Value {
    let bridge = lock(shared);
    let mut map = serde_json::Map::new();
    for (port, since) in &bridge.started {
        if bridge.silent.contains(port) {
            continue;
        }
        let frames = (since.elapsed().as_secs_f64() * bridge.rate) as u64;
        map.insert(
            format!("p{port}"),
            json!({"type": "PluginRunner", "rate": bridge.rate, "totalFrames": frames}),
        );
    }
    Value::Object(map)
}

fn parse_port(word: Option<&str>) -> Option<u32> {
    word?.parse().ok()
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &Value) -> Result<()> {
    writer.write_all(format!("{value}\n").as_bytes()).await?;
    Ok(())
}

async fn serve_commands(stream: UnixStream, shared: Shared) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        match verb {
            "list" => {
                let reply = status(&shared);
                write_line(&mut writer, &reply).await?;
            }
            "start" => {
                if let Some(port) = parse_port(words.next()) {
                    info!(port, "start");
                    lock(&shared).started.insert(port, Instant::now());
                    let event = json!({"async": true, "event": "devStarted", "devLabel": format!("p{port}")});
                    write_line(&mut writer, &event).await?;
                }
            }
            "stop" => {
                if let Some(port) = parse_port(words.next()) {
                    info!(port, "stop");
                    lock(&shared).started.remove(&port);
                }
            }
            "" => {}
            name => match (parse_port(words.next()), words.next()) {
                (Some(port), Some(value)) => info!(port, name, value, "parameter"),
                _ => warn!(line = %line, "unrecognized command"),
            },
        }
    }
    Ok(())
}

async fn serve_data(stream: UnixStream, shared: Shared) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(label) = line.strip_prefix("receive ") else {
            warn!(line = %line, "unrecognized data request");
            continue;
        };
        let label = label.trim().to_string();
        let Some(port) = label.strip_prefix('p').and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        info!(label = %label, "receiving");
        let writer = writer.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            let mut n = 0u64;
            loop {
                tick.tick().await;
                let running = lock(&shared).started.contains_key(&port);
                if !running {
                    continue;
                }
                n += 1;
                let line = format!("{label},{n},-42.5,-71.0\n");
                if writer.lock().await.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
    }
    Ok(())
}

async fn serve_raw(stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.starts_with("rawStream ") {
            writer.write_all(&[0u8; 64]).await?;
        } else if line.starts_with("rawStreamOff") {
            return Ok(());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    mock::init_logging();
    let cli = Cli::parse();
    let launches = mock::record_launch("mock-grh").context("launch log")?;
    mock::arm_crash(launches, 2);

    let dir = std::env::var("GRH_SOCKET_DIR").unwrap_or_else(|_| "/tmp".into());
    let path = PathBuf::from(dir).join(&cli.socket);
    let rate = std::env::var("MOCK_GRH_RATE")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(100.0);
    let silent = std::env::var("MOCK_GRH_SILENT")
        .unwrap_or_default()
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    let shared: Shared = Arc::new(Mutex::new(Bridge {
        rate,
        silent,
        started: BTreeMap::new(),
    }));

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    mock::announce(&format!("grh: serving {}", path.display()))?;

    let mut accepted = 0usize;
    loop {
        let (stream, _) = listener.accept().await?;
        let shared = shared.clone();
        let role = accepted;
        accepted += 1;
        tokio::spawn(async move {
            let result = match role {
                0 => serve_commands(stream, shared).await,
                1 => serve_data(stream, shared).await,
                _ => serve_raw(stream).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "connection ended");
            }
        });
    }
}
