//! Crate-wide error taxonomy, per the kinds the protocol/transfer/transport
//! layers need to distinguish (timeouts vs. framing vs. device-reported
//! failures vs. archive problems).

use crate::protocol::result::{ExtendedErrorCode, ResultCode};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("SLIP framing error: {0}")]
    Framing(&'static str),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(&'static str),

    #[error("device reported error: {code}{}", .ext.map(|e| format!(" ({e})")).unwrap_or_default())]
    Device {
        code: ResultCode,
        ext: Option<ExtendedErrorCode>,
    },

    #[error("CRC mismatch: device reported {device:#010x}, expected {expected:#010x}")]
    CrcMismatch { expected: u32, device: u32 },

    #[error("DFU archive error: {0}")]
    Archive(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("ZIP archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("malformed manifest.json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("BLE error: {0}")]
    Ble(String),
}

impl Error {
    /// True when the bootloader rejected a SoftDevice+Bootloader update
    /// because it already carries this (or a newer) version: not a fatal
    /// failure, just a no-op the orchestrator can fall through from.
    pub fn is_fw_version_failure(&self) -> bool {
        matches!(
            self,
            Error::Device {
                ext: Some(ExtendedErrorCode::FwVersionFailure),
                ..
            }
        )
    }
}
