//! Result codes and extended error codes the bootloader returns in a
//! `RESPONSE` packet, named for logging and for the orchestrator's
//! recoverable-error decisions.

use num_enum::TryFromPrimitive;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Invalid => "invalid opcode",
            ResultCode::Success => "operation successful",
            ResultCode::OpNotSupported => "opcode not supported",
            ResultCode::InvalidParameter => "missing or invalid parameter value",
            ResultCode::InsufficientResources => "not enough memory for the data object",
            ResultCode::InvalidObject => {
                "data object does not match the firmware/hardware requirements, \
                 the signature is wrong, or parsing the command failed"
            }
            ResultCode::UnsupportedType => "not a valid object type for a create request",
            ResultCode::OperationNotPermitted => {
                "the state of the DFU process does not allow this operation"
            }
            ResultCode::OperationFailed => "operation failed",
            ResultCode::ExtError => "extended error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtendedErrorCode {
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl fmt::Display for ExtendedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtendedErrorCode::NoError => "no extended error code has been set",
            ExtendedErrorCode::InvalidErrorCode => "invalid error code",
            ExtendedErrorCode::WrongCommandFormat => "the format of the command was incorrect",
            ExtendedErrorCode::UnknownCommand => {
                "the command was successfully parsed but is not supported or unknown"
            }
            ExtendedErrorCode::InitCommandInvalid => {
                "the init command is invalid or missing required fields for the update type"
            }
            ExtendedErrorCode::FwVersionFailure => {
                "the firmware version is too low to prevent a downgrade"
            }
            ExtendedErrorCode::HwVersionFailure => {
                "the hardware version of the device does not match the required version"
            }
            ExtendedErrorCode::SdVersionFailure => {
                "the supported SoftDevices for the update do not include the current one"
            }
            ExtendedErrorCode::SignatureMissing => "the init packet does not contain a signature",
            ExtendedErrorCode::WrongHashType => {
                "the hash type specified by the init packet is not supported"
            }
            ExtendedErrorCode::HashFailed => "the hash of the firmware image could not be calculated",
            ExtendedErrorCode::WrongSignatureType => {
                "the signature type is unknown or not supported by the bootloader"
            }
            ExtendedErrorCode::VerificationFailed => {
                "the hash of the received firmware image does not match the init packet"
            }
            ExtendedErrorCode::InsufficientSpace => {
                "the available space on the device is insufficient for the firmware"
            }
        };
        f.write_str(s)
    }
}
