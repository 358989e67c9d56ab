use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use bitalino_acq::{
    discovery, logging, row_labels, AcquisitionRequest, Arbiter, ArbiterConfig, ConnectionConfig,
};

#[derive(Parser, Debug)]
#[command(name = "bitalino-acq", about = "Acquire samples from BITalino devices")]
struct Args {
    /// Use the in-memory device instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record samples and print them as CSV, one row per sample
    Acquire {
        /// Bluetooth MAC address (e.g., 20:16:10:XX:XX:XX) or serial port
        address: String,
        /// Sampling rate in Hz: 1, 10, 100 or 1000
        #[arg(long, default_value_t = 1000)]
        rate: u16,
        /// Recording time in seconds
        #[arg(long, default_value_t = 1.0)]
        seconds: f64,
        /// Analog channels, e.g. 0,1,2 (default: all six)
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<u8>>,
        /// Read deadline in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Read the battery level
    Battery {
        address: String,
        /// Low-battery threshold, 0-63
        #[arg(long, default_value_t = 0)]
        threshold: u8,
    },
    /// List serial ports that look like a BITalino
    Ports,
    /// Scan for nearby Bluetooth devices
    #[cfg(feature = "bluez")]
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = ArbiterConfig::from_env();
    config.use_simulator |= args.simulate;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime init failed")?;

    match args.command {
        Command::Acquire {
            address,
            rate,
            seconds,
            channels,
            timeout,
        } => {
            if let Some(secs) = timeout {
                config.read_timeout = Duration::try_from_secs_f64(secs)
                    .context("timeout must be a positive number of seconds")?;
            }
            let mut request = AcquisitionRequest::for_duration(address, rate, seconds);
            if let Some(channels) = channels {
                request = request.with_channels(channels);
            }

            let arbiter = Arbiter::from_config(config, ConnectionConfig::default());
            let acquisition = runtime
                .block_on(arbiter.acquire(request))
                .context("acquisition failed")?;
            info!(
                "acquired {} samples in {} attempt(s)",
                acquisition.matrix.n_samples(),
                acquisition.attempts
            );

            println!("{}", row_labels(acquisition.channels.as_slice()).join(","));
            for column in acquisition.matrix.as_array().columns() {
                let row: Vec<String> = column.iter().map(|v| v.to_string()).collect();
                println!("{}", row.join(","));
            }
        }
        Command::Battery { address, threshold } => {
            let arbiter = Arbiter::from_config(config, ConnectionConfig::default());
            match runtime
                .block_on(arbiter.battery(&address, threshold))
                .context("battery query failed")?
            {
                Some(level) => println!("{level}%"),
                None => println!("no answer from {address}"),
            }
        }
        Command::Ports => {
            for port in discovery::serial_ports().context("listing serial ports failed")? {
                println!("{port}");
            }
        }
        #[cfg(feature = "bluez")]
        Command::Scan { seconds } => {
            let found = runtime
                .block_on(discovery::scan_bluetooth(Duration::from_secs(seconds)))
                .context("bluetooth scan failed")?;
            for mac in found {
                println!("{mac}");
            }
        }
    }
    Ok(())
}
