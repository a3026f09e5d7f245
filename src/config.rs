//! Run configuration, resolved once at startup from CLI arguments and
//! immutable for the rest of the run. The library never reads argv or
//! environment variables itself; the binary crate builds one of these and
//! hands it in.

use log::LevelFilter;
use std::time::Duration;

/// Default number of ping attempts before giving up waiting for the
/// bootloader to respond. Generous enough to ride out a bootloader that is
/// still finishing a prior erase cycle when the first ping lands.
pub const DEFAULT_TIMEOUT_TRIES: u32 = 10;

pub const DEFAULT_SERIAL_BAUD: u32 = 115200;

/// Per-read/write timeout on the serial port. Long enough that a slow USB
/// CDC stack doesn't spuriously trip it, short enough that a wedged
/// bootloader is noticed well before a human loses patience.
pub const SERIAL_IO_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleAddressType {
    Public,
    Random,
    Unknown,
}

/// The `-c/--cmd` and `-C/--hexcmd` CLI options are mutually exclusive
/// forms of the same "DFU-entry command": text typed at a CLI the device
/// exposes over the same UART, or a raw byte sequence given as hex digit
/// pairs, either of which coaxes the application firmware into resetting
/// into the bootloader before pinging starts.
#[derive(Debug, Clone)]
pub enum DfuEntryCommand {
    Text(String),
    Hex(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Sent to coax the device into bootloader mode before pinging. Absent
    /// when the device is already in the bootloader.
    pub dfu_entry_command: Option<DfuEntryCommand>,
}

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub interface: String,
    pub address: [u8; 6],
    pub address_type: BleAddressType,
}

#[derive(Debug, Clone)]
pub enum TransportConfig {
    Serial(SerialConfig),
    Ble(BleConfig),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub timeout_tries: u32,
    pub archive_path: String,
    /// Log verbosity the binary should configure its logger with. The
    /// library itself never touches a logging backend's init routine; it
    /// only emits `log` records and leaves this setting for the caller to
    /// act on.
    pub log_level: LevelFilter,
}
