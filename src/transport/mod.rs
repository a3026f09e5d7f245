//! Uniform transport boundary the protocol engine drives.
//!
//! A [`Transport`] exposes exactly the three operations the DFU control
//! protocol needs, and lets the two concrete transports (serial/SLIP, BLE
//! GATT) each encode "send a request and get a response" and "stream write
//! data with no response" in whatever way suits their wire format.

pub mod ble;
pub mod serial;

use crate::error::Result;

/// Abstraction chosen so the protocol engine and orchestrator never see
/// SLIP framing or GATT characteristics directly.
pub trait Transport {
    /// Send `bytes` (opcode + fixed payload) as a control-channel request
    /// that expects a `RESPONSE` back. Serial: SLIP-encode and write. BLE:
    /// write to the Control Point with response.
    fn send_request(&mut self, bytes: &[u8]) -> Result<()>;

    /// Send `bytes` (opcode + raw data) with no response expected. Serial:
    /// SLIP-encode and write. BLE: write to the Data Point without
    /// response.
    fn send_data(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block until a full response frame is available, returning its bytes
    /// starting with the `RESPONSE` opcode byte. Serial: read and
    /// SLIP-decode until a full frame. BLE: wait for the next Control
    /// Point notification.
    fn recv_response(&mut self) -> Result<Vec<u8>>;

    /// Maximum number of bytes this transport can carry per `OBJECT_WRITE`
    /// slice. Serial negotiates this via `MTU_GET`; BLE has no such
    /// negotiation and uses a fixed value instead.
    fn mtu(&mut self) -> Result<u16>;

    /// Release all resources (fds, connections). Idempotent; safe to call
    /// from a signal-handler context to unblock an in-progress wait.
    fn fini(&mut self);
}
