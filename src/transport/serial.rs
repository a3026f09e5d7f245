//! Serial/SLIP transport: UART open/configure/close, select-based read and
//! write with timeouts, and the optional DFU-entry command sent before the
//! bootloader starts answering pings.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use termios::Termios;

use crate::config::DfuEntryCommand;
use crate::error::{Error, Result};
use crate::protocol::opcode::{Opcode, RESPONSE};
use crate::slip::{self, DecodeEvent, Decoder};
use crate::transport::Transport;

/// Largest unframed message the bootloader is expected to send; the SLIP
/// decode buffer is sized for the worst-case doubled encoding of that.
const BUF_SIZE: usize = 512;

/// Per-byte readiness-wait timeout used while polling for serial data.
const IO_TIMEOUT: Duration = Duration::from_secs(1);

/// How [`SerialTransport::recv_response`] gives up waiting for the next
/// byte of a frame.
#[derive(Debug, Clone, Copy)]
pub enum ReadAbort {
    /// Abort as soon as a single per-byte wait times out. Appropriate when
    /// the bootloader is expected to answer promptly and a stall means the
    /// link is dead.
    Timeout,
    /// Tolerate up to `tries` consecutive per-byte timeouts before giving
    /// up, for bootloaders that can go quiet for longer than one readiness
    /// wait (e.g. while erasing flash) without the link actually being
    /// down.
    RetryCount(u32),
}

pub struct SerialTransport {
    port: TTYPort,
    decoder: Decoder,
    mtu: Option<u16>,
    read_abort: ReadAbort,
    original_termios: Termios,
}

impl SerialTransport {
    /// Open and configure `device` at `baud`: 8N1, no flow control, DTR
    /// raised for the duration of the session. The terminal settings in
    /// effect before this call are snapshotted so [`Transport::fini`] can
    /// put them back.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let original_termios = snapshot_termios(device)?;

        let mut port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(IO_TIMEOUT)
            .open_native()?;
        port.clear(ClearBuffer::All).ok();
        port.write_data_terminal_ready(true)?;

        Ok(Self {
            port,
            decoder: Decoder::new(BUF_SIZE * 2 + 1),
            mtu: None,
            read_abort: ReadAbort::Timeout,
            original_termios,
        })
    }

    /// Switch how [`Transport::recv_response`] gives up on a stalled read.
    /// Defaults to [`ReadAbort::Timeout`].
    pub fn set_read_abort(&mut self, mode: ReadAbort) {
        self.read_abort = mode;
    }

    /// Reconfigure the already-open port to `baud`, used after sending the
    /// DFU-entry command before the bootloader re-enumerates at its own
    /// rate.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    /// Send `CR CR CR`, then the configured command (text framed with a
    /// trailing `CR`, or raw hex bytes verbatim), wait a second, and drain
    /// and log whatever the device replies with. Returns whether the
    /// device replied at all.
    pub fn send_dfu_entry_command(&mut self, cmd: &DfuEntryCommand) -> Result<bool> {
        let mut discard = [0u8; 200];
        let _ = self.port.read(&mut discard);

        match cmd {
            DfuEntryCommand::Text(text) => {
                info!("sending command to enter DFU mode: {text:?}");
                self.write_raw(b"\r\r\r")?;
                self.write_raw(text.as_bytes())?;
                self.write_raw(b"\r")?;
            }
            DfuEntryCommand::Hex(bytes) => {
                info!("sending {} raw byte(s) to enter DFU mode", bytes.len());
                self.write_raw(bytes)?;
            }
        }
        std::thread::sleep(Duration::from_secs(1));

        let mut reply = [0u8; 200];
        match self.port.read(&mut reply) {
            Ok(0) => {
                debug!("device didn't reply to DFU-entry command");
                Ok(false)
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&reply[..n]);
                debug!("device replied: {:?}", text.trim());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < bytes.len() {
            match self.port.write(&bytes[pos..]) {
                Ok(0) => return Err(Error::Timeout("serial write")),
                Ok(n) => pos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_slip_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(bytes.len() * 2 + 2);
        slip::encode(bytes, &mut framed);
        trace!("--> {bytes:?}");
        self.write_raw(&framed)
    }

    /// Read and SLIP-decode one full frame, a byte at a time, giving up
    /// according to `self.read_abort`.
    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut byte = [0u8; 1];
        let mut consecutive_timeouts = 0u32;
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Err(Error::Timeout("serial RX")),
                Ok(_) => {
                    consecutive_timeouts = 0;
                    match self.decoder.push(byte[0])? {
                        DecodeEvent::Continue => continue,
                        DecodeEvent::Complete => {
                            let frame = self.decoder.take_frame();
                            trace!("<-- {frame:?}");
                            return Ok(frame);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => match self.read_abort {
                    ReadAbort::Timeout => return Err(Error::Timeout("serial RX")),
                    ReadAbort::RetryCount(tries) => {
                        consecutive_timeouts += 1;
                        if consecutive_timeouts >= tries {
                            return Err(Error::Timeout("serial RX"));
                        }
                        continue;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `MTU_GET` round trip, done directly against the wire (rather than via
    /// [`crate::protocol::DfuEngine`], which depends on this module) and
    /// cached for subsequent [`Transport::mtu`] calls.
    fn negotiate_mtu(&mut self) -> Result<u16> {
        let op: u8 = Opcode::MtuGet.into();
        self.write_slip_encoded(&[op])?;
        let frame = self.read_frame()?;
        if frame.len() < 5 || frame[0] != RESPONSE || frame[1] != op {
            return Err(Error::ProtocolMismatch("malformed MTU_GET response"));
        }
        if frame[2] != 0x01 {
            return Err(Error::ProtocolMismatch("MTU_GET reported a device error"));
        }
        let mtu = u16::from_le_bytes([frame[3], frame[4]]);
        let mtu = if mtu as usize > BUF_SIZE {
            warn!("MTU of {mtu} limited to buffer size {BUF_SIZE}");
            BUF_SIZE as u16
        } else {
            mtu
        };
        debug!("serial MTU = {mtu}");
        Ok(mtu)
    }
}

/// Snapshot the terminal attributes in effect on `device` before this
/// process touches them, so they can be restored on close rather than
/// leaving the port in whatever mode the DFU session configured it to.
fn snapshot_termios(device: &str) -> Result<Termios> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(device)?;
    Termios::from_fd(file.as_raw_fd()).map_err(Error::Io)
}

impl Transport for SerialTransport {
    fn send_request(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_slip_encoded(bytes)
    }

    fn send_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_slip_encoded(bytes)
    }

    fn recv_response(&mut self) -> Result<Vec<u8>> {
        self.read_frame()
    }

    fn mtu(&mut self) -> Result<u16> {
        if let Some(mtu) = self.mtu {
            return Ok(mtu);
        }
        let mtu = self.negotiate_mtu()?;
        self.mtu = Some(mtu);
        Ok(mtu)
    }

    fn fini(&mut self) {
        self.port.write_data_terminal_ready(false).ok();
        if let Err(e) = termios::tcsetattr(self.port.as_raw_fd(), termios::TCSANOW, &self.original_termios) {
            warn!("could not restore original terminal settings: {e}");
        }
    }
}

/// Idempotent teardown on every exit path, including an early return caused
/// by a `SIGINT`-driven abort.
impl Drop for SerialTransport {
    fn drop(&mut self) {
        Transport::fini(self);
    }
}
