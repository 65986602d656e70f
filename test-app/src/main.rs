// sdrlib station CLI -- runs a station for one device, encodes airspy
// commands, and lists the parameter table.
//
// Usage:
//   sdrlib-station run --kind airspy --usb-path 1:4 --port 2 --plan plan.json
//   sdrlib-station run --kind gnuradio --usb-path 1:5 --port 3 --plan plan.json --duration 60
//   sdrlib-station run --kind airspy --usb-path 1:4 --port 2 --plan plan.json \
//       --reference-mhz 166.380 --serial a74068c82f4e3c53
//   sdrlib-station encode frequency 166.376
//   sdrlib-station params
//
// Logs go to stderr (RUST_LOG, default info); station events go to stdout,
// one per line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use sdrlib::airspy::AirspyBuilder;
use sdrlib::airspy::commands::encode_param;
use sdrlib::factory::DefaultFactory;
use sdrlib::gnuradio::BridgeBuilder;
use sdrlib::{
    Device, DriverKind, ParamTable, Plan, Station, StationConfig, StationEvent, StaticPlans,
    StaticSerials,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// sdrlib station -- supervise SDR device sessions from the command line.
#[derive(Parser)]
#[command(name = "sdrlib-station", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a station for one device and print its events.
    Run(RunArgs),

    /// Encode a parameter as a 5-byte airspy command.
    Encode {
        /// Parameter name (e.g. frequency, lna_gain).
        name: String,
        /// Value in natural units (MHz for frequency).
        value: f64,
    },

    /// List the parameter table.
    Params,
}

#[derive(Args)]
struct RunArgs {
    /// Driver variant for the device.
    #[arg(long, value_enum)]
    kind: Kind,

    /// USB path in bus:device form (e.g. 1:4).
    #[arg(long)]
    usb_path: String,

    /// Station port number.
    #[arg(long)]
    port: u32,

    /// Hardware serial number, if known.
    #[arg(long)]
    serial: Option<String>,

    /// JSON plan file, e.g. {"rate": 6000000, "params": {"frequency": 166.376}}.
    #[arg(long)]
    plan: PathBuf,

    /// Tune relative to this reference frequency in MHz instead of the
    /// plan's frequency.
    #[arg(long)]
    reference_mhz: Option<f64>,

    /// Override the airspy server binary.
    #[arg(long)]
    airspy_program: Option<PathBuf>,

    /// Override the bridge binary.
    #[arg(long)]
    bridge_program: Option<PathBuf>,

    /// Directory for control sockets.
    #[arg(long, default_value = "/tmp")]
    socket_dir: PathBuf,

    /// Kill leftover bridge processes before starting.
    #[arg(long)]
    reap_stale: bool,

    /// Seconds to run (0 = run until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Delay before a restarted device is re-added, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    readd_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Airspy,
    Gnuradio,
}

impl From<Kind> for DriverKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Airspy => DriverKind::Airspy,
            Kind::Gnuradio => DriverKind::GnuRadio,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_plan(args: &RunArgs) -> Result<Plan> {
    let text = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("failed to read plan {}", args.plan.display()))?;
    let mut plan: Plan = serde_json::from_str(&text)
        .with_context(|| format!("invalid plan {}", args.plan.display()))?;
    if let Some(mhz) = args.reference_mhz {
        plan.retune_to_reference(mhz);
    }
    Ok(plan)
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let plan = load_plan(&args)?;

    let mut airspy = AirspyBuilder::new().socket_dir(&args.socket_dir);
    if let Some(program) = &args.airspy_program {
        airspy = airspy.program(program);
    }
    let mut bridge = BridgeBuilder::new()
        .socket_dir(&args.socket_dir)
        .reap_stale(args.reap_stale);
    if let Some(program) = &args.bridge_program {
        bridge = bridge.program(program);
    }

    let mut serials = StaticSerials::new();
    if let Some(serial) = &args.serial {
        serials = serials.with_serial(&args.usb_path, serial);
    }

    let config = StationConfig {
        readd_delay: Duration::from_millis(args.readd_delay_ms),
        ..StationConfig::default()
    };
    let bus = config.bus();
    let mut events = bus.subscribe();
    let station = Station::start(
        config,
        Arc::new(StaticPlans::new().with_fallback(plan)),
        Arc::new(serials),
        Arc::new(DefaultFactory::new(airspy, bridge)),
        bus,
    );
    station.add_device(Device::new(&args.usb_path, args.port, args.kind.into()));

    let duration = args.duration;
    let stop = async move {
        if duration == 0 {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::time::sleep(Duration::from_secs(duration)).await;
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => eprintln!("missed {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    station.quit().await;
    Ok(())
}

fn print_event(event: &StationEvent) {
    match event {
        StationEvent::DeviceAdded { device } => println!("added {device}"),
        StationEvent::DeviceRemoved { device } => println!("removed {device}"),
        StationEvent::RestartRequested { device, reason } => {
            println!("restart {device}: {reason}")
        }
        StationEvent::DeviceError { port, message } => match port {
            Some(port) => println!("error port {port}: {message}"),
            None => println!("error: {message}"),
        },
        StationEvent::DeviceStalled { label, reason } => println!("stalled {label}: {reason}"),
        StationEvent::ParamSetError {
            port,
            driver,
            param,
            value,
            error,
        } => println!("param error {driver} port {port}: {param}={value}: {error}"),
        StationEvent::Settings { port, settings } => {
            let json = serde_json::to_string(settings).unwrap_or_default();
            println!("settings port {port}: {json}");
        }
        StationEvent::RawLine { source, line } => println!("{source}: {line}"),
        StationEvent::UpstreamDied { upstream } => println!("upstream {upstream} died"),
        StationEvent::BridgeStarted => println!("bridge started"),
        StationEvent::BridgeNotification { event, label, .. } => match label {
            Some(label) => println!("bridge {event} {label}"),
            None => println!("bridge {event}"),
        },
        StationEvent::FrameCount { label, frames } => println!("frames {label}: {frames}"),
        StationEvent::FrameRate { label, rate } => println!("rate {label}: {rate:.1}"),
        StationEvent::Quit => println!("quit"),
    }
}

fn cmd_encode(name: &str, value: f64) -> Result<()> {
    let frame = encode_param(&ParamTable::standard(), name, value)
        .with_context(|| format!("cannot encode {name}={value}"))?;
    let hex: Vec<String> = frame.iter().map(|b| format!("{b:02x}")).collect();
    println!("{}", hex.join(" "));
    Ok(())
}

fn cmd_params() -> Result<()> {
    println!("{:<18} {:>4}  UNIT", "NAME", "CODE");
    for spec in ParamTable::standard().specs() {
        println!("{:<18} {:>4}  {:?}", spec.name, spec.code, spec.unit);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Encode { name, value } => cmd_encode(&name, value),
        Command::Params => cmd_params(),
    }
}
