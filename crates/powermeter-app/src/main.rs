//! powermeter: poll a Modbus RTU power meter and publish its readings

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use powermeter_core::meter::{parse_register, register_group, register_name};
use powermeter_core::prelude::*;
use powermeter_core::protocol::preferred_port;

/// Poll a three-phase power meter over Modbus RTU
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, or `auto` for the likeliest RS-485 adapter (overrides the configuration file)
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (overrides the configuration file)
    #[arg(long)]
    baud: Option<u32>,

    /// Modbus device address (overrides the configuration file)
    #[arg(long)]
    address: Option<u8>,

    /// Read the 22-register basic block instead of the detailed one
    #[arg(long)]
    basic: bool,

    /// Talk to a simulated meter instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Read one register by name or logical address, print it and exit
    #[arg(long, value_name = "NAME|ADDRESS")]
    register: Option<String>,

    /// Read a register group (basic, energy, power, system, phase_1..phase_3), print it and exit
    #[arg(long)]
    group: Option<String>,

    /// Take a single reading, print it as JSON and exit
    #[arg(long)]
    once: bool,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<MeterConfig> {
    let mut config = match &args.config {
        Some(path) => MeterConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MeterConfig::default(),
    };

    if let Some(port) = &args.port {
        config.serial.port = if port == "auto" {
            let ports = list_ports();
            let found = preferred_port(&ports).ok_or_else(|| anyhow!("no serial adapter found"))?;
            info!("Using {}", found.description());
            found.name.clone()
        } else {
            port.clone()
        };
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(address) = args.address {
        config.device_address = address;
    }
    if args.basic {
        config.detailed = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        println!("{}", port.description());
    }
}

/// Registers named by `--register` or `--group`, if either was given
fn requested_registers(args: &Args) -> Result<Option<Vec<u16>>> {
    if let Some(text) = &args.register {
        let address = parse_register(text).ok_or_else(|| anyhow!("unknown register {}", text))?;
        return Ok(Some(vec![address]));
    }
    if let Some(name) = &args.group {
        let addresses = register_group(name);
        if addresses.is_empty() {
            bail!("unknown register group {}", name);
        }
        return Ok(Some(addresses));
    }
    Ok(None)
}

fn print_registers(master: &ModbusMaster, addresses: &[u16]) -> Result<()> {
    for &address in addresses {
        let value = master
            .read_register(address)
            .with_context(|| format!("failed to read register {}", address))?;
        println!("{:>5}  {:<26} {}", address, register_name(address), value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list_ports {
        print_ports();
        return Ok(());
    }

    let config = load_config(&args)?;
    let dump = requested_registers(&args)?;
    let transport = if args.simulate {
        SimulatedMeter::transport(config.device_address)
    } else {
        Transport::new(config.serial.clone())
    };
    let master = Arc::new(ModbusMaster::new(transport, config.device_address));
    let mut reader = config.reader(master.clone());
    let mode = config.mode();

    // Serial I/O blocks, so keep it off the runtime's worker threads
    let (mut reader, connected) = tokio::task::spawn_blocking(move || {
        let connected = master
            .connect()
            .map_err(MeterError::from)
            .and_then(|_| reader.test_connection());
        (reader, connected)
    })
    .await?;

    if let Some(addresses) = dump {
        connected.context("meter did not respond")?;
        let master = reader.master().clone();
        tokio::task::spawn_blocking(move || print_registers(&master, &addresses)).await??;
        return Ok(());
    }

    if args.once {
        connected.context("meter did not respond")?;
        let reading = tokio::task::spawn_blocking(move || reader.read(mode)).await??;
        println!("{}", serde_json::to_string_pretty(&reading)?);
        return Ok(());
    }

    if let Err(e) = connected {
        warn!("Connection test failed: {}; polling anyway", e);
    }

    let mut poller = Poller::new(reader, config.poller_config());
    if config.storage.enabled {
        let sink = JsonLinesSink::open(&config.storage.path).with_context(|| {
            format!("failed to open {}", config.storage.path.display())
        })?;
        info!("Storing readings in {}", sink.path().display());
        poller = poller.with_sink(Box::new(sink));
    }

    poller.start().context("failed to start poller")?;
    info!("Polling {} every {}s, press Ctrl-C to stop", config.serial.port, config.poll_interval_secs);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    tokio::task::spawn_blocking(move || poller.stop()).await?;
    Ok(())
}
