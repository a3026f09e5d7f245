//! `nrfdfu` CLI entry point: argument parsing, logging setup, and handing
//! off to [`nrfdfu::orchestrator::run`].

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use nrfdfu::config::{
    BleAddressType, BleConfig, Config, DfuEntryCommand, SerialConfig, TransportConfig,
    DEFAULT_SERIAL_BAUD, DEFAULT_TIMEOUT_TRIES,
};
use nrfdfu::util::{parse_hex_bytes, parse_mac};
use nrfdfu::Result;

/// Nordic Secure DFU host client: flash a signed DFU archive over serial
/// or BLE.
#[derive(Parser)]
#[command(name = "nrfdfu", author, version, about)]
struct Cli {
    /// Increase log verbosity (-v for per-request status, -vv for frame
    /// hex dumps).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    transport: TransportArgs,
}

#[derive(Subcommand)]
enum TransportArgs {
    /// Upgrade over a serial (UART) connection.
    Serial(SerialArgs),
    /// Upgrade over a Bluetooth LE connection.
    Ble(BleArgs),
}

#[derive(clap::Args)]
struct SerialArgs {
    /// Serial port device.
    #[arg(short = 'p', long = "port", default_value = "/dev/ttyUSB0")]
    port: String,
    /// Baud rate.
    #[arg(short = 'b', long = "baud", default_value_t = DEFAULT_SERIAL_BAUD)]
    baud: u32,
    /// Text command sent to enter DFU mode.
    #[arg(short = 'c', long = "cmd", conflicts_with = "hexcmd")]
    cmd: Option<String>,
    /// Hex-encoded raw bytes sent to enter DFU mode.
    #[arg(short = 'C', long = "hexcmd")]
    hexcmd: Option<String>,
    /// Give up after this many unanswered pings.
    #[arg(short = 't', long = "timeout", default_value_t = DEFAULT_TIMEOUT_TRIES)]
    timeout: u32,
    /// Path to the DFU package (.zip).
    archive: PathBuf,
}

#[derive(clap::Args)]
struct BleArgs {
    /// Peer MAC address (AA:BB:CC:DD:EE:FF).
    #[arg(short = 'a', long = "addr")]
    addr: String,
    /// Address type.
    #[arg(short = 't', long = "atype", value_enum, default_value_t = AddressTypeArg::Public)]
    atype: AddressTypeArg,
    /// Bluetooth interface/adapter name.
    #[arg(short = 'i', long = "intf", default_value = "hci0")]
    intf: String,
    /// Path to the DFU package (.zip).
    archive: PathBuf,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum AddressTypeArg {
    Public,
    Random,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match build_config(cli) {
        Ok(config) => {
            env_logger::Builder::new().filter_level(config.log_level).parse_default_env().init();
            match nrfdfu::orchestrator::run(&config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("ERR: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("ERR: {e}");
            ExitCode::FAILURE
        }
    }
}

fn log_level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn build_config(cli: Cli) -> Result<Config> {
    let log_level = log_level_for(cli.verbose);
    match cli.transport {
        TransportArgs::Serial(args) => {
            let dfu_entry_command = match (args.cmd, args.hexcmd) {
                (Some(text), None) => Some(DfuEntryCommand::Text(text)),
                (None, Some(hex)) => Some(DfuEntryCommand::Hex(parse_hex_bytes(&hex)?)),
                (None, None) => None,
                (Some(_), Some(_)) => unreachable!("clap enforces --cmd/--hexcmd are exclusive"),
            };
            Ok(Config {
                transport: TransportConfig::Serial(SerialConfig {
                    port: args.port,
                    baud: args.baud,
                    dfu_entry_command,
                }),
                timeout_tries: args.timeout,
                archive_path: args.archive.to_string_lossy().into_owned(),
                log_level,
            })
        }
        TransportArgs::Ble(args) => {
            let address = parse_mac(&args.addr)?;
            let address_type = match args.atype {
                AddressTypeArg::Public => BleAddressType::Public,
                AddressTypeArg::Random => BleAddressType::Random,
            };
            Ok(Config {
                transport: TransportConfig::Ble(BleConfig {
                    interface: args.intf,
                    address,
                    address_type,
                }),
                timeout_tries: DEFAULT_TIMEOUT_TRIES,
                archive_path: args.archive.to_string_lossy().into_owned(),
                log_level,
            })
        }
    }
}
