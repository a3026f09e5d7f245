//! DFU opcodes and the per-opcode wire request-prefix size table.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
}

/// Opcode byte the bootloader prefixes every response with.
pub const RESPONSE: u8 = 0x60;
/// Sentinel for an opcode that doesn't map to anything known.
pub const INVALID: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Command = 1,
    Data = 2,
}

/// Exact byte count of the wire request for `op` (opcode byte + fixed
/// payload). `OBJECT_WRITE`'s payload is variable-length raw data, so its
/// "prefix" is just the opcode byte; unknown/response/invalid opcodes map
/// to 1.
pub fn request_size(op: u8) -> usize {
    match Opcode::try_from(op) {
        Ok(Opcode::ObjectCreate) => 1 + 1 + 4, // object_type + object_size(u32)
        Ok(Opcode::ReceiptNotifSet) => 1 + 2,  // target(u16)
        Ok(Opcode::ObjectSelect) => 1 + 1,     // object_type
        Ok(Opcode::MtuGet) => 1,               // NOT sizeof(mtu response)
        Ok(Opcode::ObjectWrite) => 1,          // variable payload follows
        Ok(Opcode::Ping) => 1 + 1,             // id
        Ok(Opcode::FirmwareVersion) => 1 + 1,  // image_id
        Ok(Opcode::ProtocolVersion)
        | Ok(Opcode::CrcGet)
        | Ok(Opcode::ObjectExecute)
        | Ok(Opcode::HardwareVersion)
        | Ok(Opcode::Abort) => 1,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_wire_prefix() {
        assert_eq!(request_size(Opcode::ObjectCreate.into()), 6);
        assert_eq!(request_size(Opcode::ReceiptNotifSet.into()), 3);
        assert_eq!(request_size(Opcode::ObjectSelect.into()), 2);
        assert_eq!(request_size(Opcode::MtuGet.into()), 1);
        assert_eq!(request_size(Opcode::ObjectWrite.into()), 1);
        assert_eq!(request_size(Opcode::Ping.into()), 2);
        assert_eq!(request_size(Opcode::CrcGet.into()), 1);
        assert_eq!(request_size(Opcode::ObjectExecute.into()), 1);
        assert_eq!(request_size(Opcode::Abort.into()), 1);
    }

    #[test]
    fn unknown_opcode_yields_one() {
        assert_eq!(request_size(RESPONSE), 1);
        assert_eq!(request_size(INVALID), 1);
        assert_eq!(request_size(0x42), 1);
    }
}
