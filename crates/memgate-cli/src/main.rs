mod commands;
mod config;
mod shutdown;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use memgate::{Scanner, Signature};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::hex_utils::{parse_hex_address, parse_hex_bytes};
use config::Config;
use shutdown::ShutdownSignal;

#[derive(Parser)]
#[command(name = "memgate")]
#[command(about = "Inspect and modify process memory through the memgate service")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "memgate.toml", env = "MEMGATE_CONFIG")]
    config: PathBuf,

    /// Reload the service before connecting
    #[arg(long)]
    reload: bool,

    /// Run the service in this process instead of opening the control device
    #[arg(long)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show service and client versions
    Version,

    /// List committed regions of a process
    Regions {
        #[arg(long)]
        pid: u64,
        #[arg(long, value_parser = parse_hex_address, default_value = "0x400000")]
        min: u64,
        #[arg(long, value_parser = parse_hex_address, default_value = "0xF000000000000")]
        max: u64,
    },

    /// Hexdump process memory, optionally following a pointer chain
    Read {
        #[arg(long)]
        pid: u64,
        #[arg(long, value_parser = parse_hex_address)]
        address: u64,
        #[arg(long, default_value_t = 256)]
        size: usize,
        /// Pointer chain offsets, applied in order
        #[arg(long = "offset", value_parser = parse_hex_address)]
        offsets: Vec<u64>,
    },

    /// Write bytes into process memory
    Write {
        #[arg(long)]
        pid: u64,
        #[arg(long, value_parser = parse_hex_address)]
        address: u64,
        /// Hex bytes, e.g. "DE AD BE EF"
        #[arg(long)]
        bytes: String,
        #[arg(long = "offset", value_parser = parse_hex_address)]
        offsets: Vec<u64>,
    },

    /// Search a live process for a byte signature
    Scan {
        #[arg(long)]
        pid: u64,
        /// Signature, e.g. "48 8B ?? ?? 89"
        #[arg(long)]
        pattern: String,
        /// Maximum number of hits (0 = all)
        #[arg(long)]
        count: Option<usize>,
        #[arg(long, value_parser = parse_hex_address, default_value = "0x400000")]
        min: u64,
        #[arg(long, value_parser = parse_hex_address, default_value = "0xF000000000000")]
        max: u64,
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print process and image events until interrupted
    Events,

    /// Set the input injection delay
    Delay {
        #[arg(long, allow_negative_numbers = true)]
        value: i32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("memgate=info".parse()?))
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => {
            info!("Loaded config from {:?}", args.config);
            c
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    let device = commands::open_device(&config, args.reload, args.local || config.local)?;
    let mut out = io::stdout().lock();

    match args.command {
        Command::Version => commands::version::run(&device, &mut out),
        Command::Regions { pid, min, max } => commands::regions::run(&device, pid, min, max, &mut out),
        Command::Read {
            pid,
            address,
            size,
            offsets,
        } => commands::read::run(&device, pid, address, &offsets, size, &mut out),
        Command::Write {
            pid,
            address,
            bytes,
            offsets,
        } => {
            let bytes = parse_hex_bytes(&bytes)?;
            commands::write::run(&device, pid, address, &offsets, &bytes, &mut out)
        }
        Command::Scan {
            pid,
            pattern,
            count,
            min,
            max,
            workers,
        } => {
            let signature: Signature = pattern.parse()?;
            let mut scanner = Scanner::new().max_hits(count.unwrap_or(config.scan.max_hits));
            if let Some(workers) = workers.or(config.scan.workers) {
                scanner = scanner.workers(workers);
            }
            commands::scan::run(&device, &scanner, pid, &signature, min, max, &mut out)
        }
        Command::Events => {
            let shutdown = Arc::new(ShutdownSignal::new());
            let handler = Arc::clone(&shutdown);
            ctrlc::set_handler(move || {
                info!("Received shutdown signal, stopping...");
                handler.trigger();
            })?;
            let interval = Duration::from_millis(config.events.poll_interval_ms);
            commands::events::run(&device, &shutdown, interval, &mut out)
        }
        Command::Delay { value } => commands::delay::run(&device, value, &mut out),
    }
}
