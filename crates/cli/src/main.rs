//! bulk-usb
//!
//! Command-line front end for the bulk USB transport: lists allow-listed
//! devices, moves bytes over their bulk endpoints, and watches hot-plug
//! activity.

mod commands;
mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::CliConfig;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use transport::{BulkUsb, LibusbBackend};

#[derive(Parser, Debug)]
#[command(name = "bulk-usb")]
#[command(author, version, about = "Talk to vendor-specific USB devices over bulk endpoints")]
#[command(long_about = "
Discovers allow-listed USB devices that expose a vendor-specific interface
with one bulk IN and one bulk OUT endpoint, and reads or writes raw bytes.

EXAMPLES:
    # List matching devices
    bulk-usb --allow 0x8765:0x1234 list

    # Write four bytes to the first device
    bulk-usb --allow 0x8765:0x1234 write --index 0 --data deadbeef

    # Read up to 512 bytes, returning as soon as anything arrives
    bulk-usb read --index 0 --len 512 --short

    # Watch devices come and go
    bulk-usb monitor

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/bulk-usb/config.toml
    3. /etc/bulk-usb/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save the effective configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Allow a device, in addition to the configured list (repeatable)
    #[arg(long = "allow", value_name = "VID:PID")]
    allow: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List allowed devices (default)
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Read from a device's bulk IN endpoint
    Read {
        /// Device index, as shown by `list`
        #[arg(short, long, default_value_t = 0)]
        index: usize,

        /// Maximum number of bytes to read
        #[arg(short = 'n', long, default_value_t = 64)]
        len: usize,

        /// Overall timeout in milliseconds
        #[arg(short, long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Return as soon as any data arrives
        #[arg(long)]
        short: bool,

        /// Write raw bytes to stdout instead of a hex dump
        #[arg(long)]
        raw: bool,
    },

    /// Write to a device's bulk OUT endpoint
    Write {
        /// Device index, as shown by `list`
        #[arg(short, long, default_value_t = 0)]
        index: usize,

        /// Hex-encoded payload
        #[arg(short, long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the payload from a file ("-" for stdin)
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Per-chunk timeout in milliseconds
        #[arg(short, long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Print device arrivals and removals until Ctrl-C
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CliConfig::load(Some(config::expand_path(path)?))
            .context("Failed to load configuration")?,
        None => CliConfig::load_or_default(),
    };
    config
        .merge_allowed(&args.allow)
        .context("Invalid --allow entry")?;

    if args.save_config {
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("bulk-usb v{}", env!("CARGO_PKG_VERSION"));

    if config.usb.allowed_devices.is_empty() {
        bail!("No devices allowed; pass --allow VID:PID or set usb.allowed_devices");
    }

    let backend = LibusbBackend::new().context("Failed to initialize libusb")?;
    let usb = Arc::new(
        BulkUsb::init(Arc::new(backend), &config.usb).context("Failed to initialize transport")?,
    );
    let default_timeout = config.usb.default_timeout_duration();
    let timeout = |ms: Option<u64>| ms.map(Duration::from_millis).unwrap_or(default_timeout);

    let result = match args.command.unwrap_or(Command::List { json: false }) {
        Command::List { json } => {
            let usb = Arc::clone(&usb);
            tokio::task::spawn_blocking(move || commands::list(&usb, json)).await?
        }
        Command::Read {
            index,
            len,
            timeout_ms,
            short,
            raw,
        } => {
            let usb = Arc::clone(&usb);
            let timeout = timeout(timeout_ms);
            let data = tokio::task::spawn_blocking(move || {
                commands::read(&usb, index, len, timeout, short)
            })
            .await??;

            if raw {
                use std::io::Write as _;
                std::io::stdout()
                    .write_all(&data)
                    .context("Failed to write to stdout")?;
            } else {
                print!("{}", commands::hex_dump(&data));
            }
            Ok(())
        }
        Command::Write {
            index,
            data,
            file,
            timeout_ms,
        } => {
            let payload = match (data, file) {
                (Some(hex), None) => commands::parse_hex(&hex)?,
                (None, Some(path)) if path.as_os_str() == "-" => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("Failed to read stdin")?;
                    buf
                }
                (None, Some(path)) => {
                    let path = config::expand_path(&path)?;
                    std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?
                }
                _ => bail!("Specify the payload with --data or --file"),
            };

            let usb = Arc::clone(&usb);
            let timeout = timeout(timeout_ms);
            let total = payload.len();
            let written = tokio::task::spawn_blocking(move || {
                commands::write(&usb, index, &payload, timeout)
            })
            .await??;
            println!("Wrote {} of {} bytes", written, total);
            Ok(())
        }
        Command::Monitor => commands::monitor(Arc::clone(&usb)).await,
    };

    usb.exit();
    result
}
