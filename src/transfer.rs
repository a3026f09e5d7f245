//! Object-transfer procedure: select, full/partial resume, and the
//! chunked create/write/crc/execute loop.

use std::io::{Read, Seek, SeekFrom};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::opcode::ObjectType;
use crate::protocol::DfuEngine;
use crate::transport::Transport;

/// Read exactly `len` bytes from `stream` (advancing it) and fold them
/// into a running CRC-32 starting from `init`.
fn crc_over(stream: &mut impl Read, len: u64, init: u32) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    let mut remaining = len;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        stream.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(hasher.finalize())
}

/// Run the full write procedure for one object (init packet or firmware
/// image) over `stream`, which must support seek-to-start (for resume) and
/// sequential read. `total_size` is the exact number of bytes the object
/// contains.
pub fn write_procedure<T: Transport>(
    engine: &mut DfuEngine<T>,
    object_type: ObjectType,
    stream: &mut (impl Read + Seek),
    total_size: u64,
) -> Result<()> {
    let select = engine.select(object_type)?;
    let max_size = select.max_size as u64;
    let total = total_size;

    // Full resume: the object was already received and CRC-checked; only
    // the commit is missing.
    if select.offset as u64 == total {
        stream.seek(SeekFrom::Start(0))?;
        let crc = crc_over(stream, total, 0)?;
        if crc == select.crc {
            info!("object already received, committing");
            return engine.execute();
        }
        // Offset matches but CRC doesn't: the device's notion of "done" is
        // stale data from a previous, different image. Treat as if nothing
        // had been received and fall through to a from-scratch transfer.
    }

    let mut offset = select.offset as u64;
    let mut running_crc;

    if offset > 0 && offset < total {
        let remain = offset % max_size;
        warn!("object partially received (offset {offset}, remaining {remain} in chunk)");

        stream.seek(SeekFrom::Start(0))?;
        running_crc = crc_over(stream, offset, 0)?;

        if running_crc != select.crc {
            // Rewind to the start of the chunk the device is still
            // missing and recompute from there.
            let back = if remain > 0 { remain } else { max_size };
            offset -= back;
            warn!("CRC does not match device; restarting from offset {offset}");
            stream.seek(SeekFrom::Start(0))?;
            running_crc = crc_over(stream, offset, 0)?;
        } else if remain > 0 {
            // CRC matches: finish the in-progress chunk up to its
            // boundary, then commit it, before entering the main loop.
            let chunk_end = (offset - remain + max_size).min(total);
            let to_send = chunk_end - offset;
            write_slice(engine, stream, to_send, &mut running_crc)?;
            engine.execute()?;
            offset = chunk_end;
        }
    } else if offset == 0 {
        running_crc = 0;
    } else {
        // offset == total but CRC mismatched above; start over.
        stream.seek(SeekFrom::Start(0))?;
        running_crc = 0;
        offset = 0;
    }

    while offset < total {
        let chunk_size = (total - offset).min(max_size);
        engine.create(object_type, chunk_size as u32)?;
        write_slice(engine, stream, chunk_size, &mut running_crc)?;

        let crc_info = engine.crc_get()?;
        if crc_info.crc != running_crc {
            return Err(Error::CrcMismatch { expected: running_crc, device: crc_info.crc });
        }

        engine.execute()?;
        offset += chunk_size;
    }

    Ok(())
}

/// Write `len` bytes of `stream` to the device in MTU-sized slices,
/// updating `running_crc` as each slice is sent. No response is consumed
/// per slice; the device only ever answers `CRC_GET`.
fn write_slice<T: Transport>(
    engine: &mut DfuEngine<T>,
    stream: &mut impl Read,
    len: u64,
    running_crc: &mut u32,
) -> Result<()> {
    let mtu = engine.transport_mut().mtu()?;
    // Halved to leave headroom for SLIP's worst-case 2x escape expansion
    // plus the opcode byte, so an encoded slice never exceeds the MTU.
    let slice_size = ((mtu.saturating_sub(1)) / 2).max(1) as usize;

    let mut remaining = len;
    let mut buf = vec![0u8; slice_size];
    while remaining > 0 {
        let want = remaining.min(slice_size as u64) as usize;
        stream.read_exact(&mut buf[..want])?;
        engine.write(&buf[..want])?;
        let mut hasher = crc32fast::Hasher::new_with_initial(*running_crc);
        hasher.update(&buf[..want]);
        *running_crc = hasher.finalize();
        remaining -= want as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcode::{Opcode, RESPONSE};
    use crate::protocol::result::ResultCode;
    use std::collections::VecDeque;
    use std::io::Cursor;

    struct MockTransport {
        responses: VecDeque<Vec<u8>>,
        writes: Vec<Vec<u8>>,
        requests: Vec<Vec<u8>>,
        mtu: u16,
    }

    impl MockTransport {
        fn new(mtu: u16) -> Self {
            Self { responses: VecDeque::new(), writes: Vec::new(), requests: Vec::new(), mtu }
        }
        fn push(&mut self, opcode: u8, result: ResultCode, payload: &[u8]) {
            let mut frame = vec![RESPONSE, opcode, result as u8];
            frame.extend_from_slice(payload);
            self.responses.push_back(frame);
        }
    }

    impl Transport for MockTransport {
        fn send_request(&mut self, bytes: &[u8]) -> Result<()> {
            self.requests.push(bytes.to_vec());
            Ok(())
        }
        fn send_data(&mut self, bytes: &[u8]) -> Result<()> {
            self.writes.push(bytes[1..].to_vec());
            Ok(())
        }
        fn recv_response(&mut self) -> Result<Vec<u8>> {
            self.responses.pop_front().ok_or(Error::Timeout("no response queued"))
        }
        fn mtu(&mut self) -> Result<u16> {
            Ok(self.mtu)
        }
        fn fini(&mut self) {}
    }

    fn select_payload(max_size: u32, offset: u32, crc: u32) -> Vec<u8> {
        let mut v = vec![];
        v.extend_from_slice(&max_size.to_le_bytes());
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&crc.to_le_bytes());
        v
    }

    fn crc_payload(offset: u32, crc: u32) -> Vec<u8> {
        let mut v = vec![];
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&crc.to_le_bytes());
        v
    }

    /// Fresh 141-byte object, MTU 64 (slice 31): SELECT offset=0/max_size=256,
    /// five writes, one CRC_GET + EXECUTE.
    #[test]
    fn fresh_transfer_chunks_and_commits() {
        let data: Vec<u8> = (0..141u32).map(|i| (i % 256) as u8).collect();
        let crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&data);
            h.finalize()
        };

        let mut t = MockTransport::new(64);
        t.push(Opcode::ObjectSelect.into(), ResultCode::Success, &select_payload(256, 0, 0));
        t.push(Opcode::ObjectCreate.into(), ResultCode::Success, &[]);
        t.push(Opcode::CrcGet.into(), ResultCode::Success, &crc_payload(141, crc));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]);

        let mut engine = DfuEngine::new(t);
        let mut stream = Cursor::new(data.clone());
        write_procedure(&mut engine, ObjectType::Command, &mut stream, data.len() as u64).unwrap();

        let writes = &engine.transport_mut().writes;
        assert_eq!(writes.len(), 5);
        assert_eq!(writes.iter().map(|w| w.len()).collect::<Vec<_>>(), vec![31, 31, 31, 31, 17]);
    }

    /// Device already has the full object with matching CRC -> exactly one
    /// EXECUTE, no CREATE/WRITE/CRC_GET.
    #[test]
    fn full_resume_only_executes() {
        let data: Vec<u8> = (0..141u32).map(|i| (i % 256) as u8).collect();
        let crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&data);
            h.finalize()
        };

        let mut t = MockTransport::new(64);
        t.push(Opcode::ObjectSelect.into(), ResultCode::Success, &select_payload(256, 141, crc));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]);

        let mut engine = DfuEngine::new(t);
        let mut stream = Cursor::new(data.clone());
        write_procedure(&mut engine, ObjectType::Command, &mut stream, data.len() as u64).unwrap();

        assert!(engine.transport_mut().writes.is_empty());
        assert_eq!(engine.transport_mut().requests.len(), 2); // SELECT, EXECUTE
    }

    /// Partial resume with matching CRC finishes the current chunk then
    /// proceeds.
    #[test]
    fn partial_resume_matching_crc_finishes_chunk() {
        let data: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
        let crc_96 = {
            let mut h = crc32fast::Hasher::new();
            h.update(&data[..96]);
            h.finalize()
        };
        let crc_128 = {
            let mut h = crc32fast::Hasher::new_with_initial(crc_96);
            h.update(&data[96..128]);
            h.finalize()
        };

        let mut t = MockTransport::new(64);
        t.push(Opcode::ObjectSelect.into(), ResultCode::Success, &select_payload(64, 96, crc_96));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]); // finish chunk to 128
        t.push(Opcode::ObjectCreate.into(), ResultCode::Success, &[]);
        let crc_200 = {
            let mut h = crc32fast::Hasher::new_with_initial(crc_128);
            h.update(&data[128..200]);
            h.finalize()
        };
        t.push(Opcode::CrcGet.into(), ResultCode::Success, &crc_payload(200, crc_200));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]);

        let mut engine = DfuEngine::new(t);
        let mut stream = Cursor::new(data.clone());
        write_procedure(&mut engine, ObjectType::Data, &mut stream, data.len() as u64).unwrap();

        let writes = &engine.transport_mut().writes;
        // First write finishes the 96->128 chunk (32 bytes), remaining
        // writes cover 128->200 (72 bytes) sliced by (64-1)/2 = 31.
        assert_eq!(writes[0].len(), 32);
    }

    /// Partial resume with CRC mismatch rewinds to the previous chunk
    /// boundary (96 - 32 = 64) and restarts from there.
    #[test]
    fn partial_resume_mismatched_crc_rewinds_to_previous_boundary() {
        let data: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();

        let mut t = MockTransport::new(64);
        // Device reports offset=96 with a CRC that matches nothing real.
        t.push(Opcode::ObjectSelect.into(), ResultCode::Success, &select_payload(64, 96, 0xBAD_C0DE));
        t.push(Opcode::ObjectCreate.into(), ResultCode::Success, &[]);
        let crc_128 = {
            let mut h = crc32fast::Hasher::new();
            h.update(&data[64..128]);
            h.finalize()
        };
        t.push(Opcode::CrcGet.into(), ResultCode::Success, &crc_payload(128, crc_128));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]);
        let crc_200 = {
            let mut h = crc32fast::Hasher::new_with_initial(crc_128);
            h.update(&data[128..200]);
            h.finalize()
        };
        t.push(Opcode::ObjectCreate.into(), ResultCode::Success, &[]);
        t.push(Opcode::CrcGet.into(), ResultCode::Success, &crc_payload(200, crc_200));
        t.push(Opcode::ObjectExecute.into(), ResultCode::Success, &[]);

        let mut engine = DfuEngine::new(t);
        let mut stream = Cursor::new(data.clone());
        write_procedure(&mut engine, ObjectType::Data, &mut stream, data.len() as u64).unwrap();

        // First CREATE after rewind should be for a 64-byte chunk (64..128).
        let requests = &engine.transport_mut().requests;
        // requests[0] = SELECT, requests[1] = CREATE(64)
        let create = &requests[1];
        let size = u32::from_le_bytes([create[2], create[3], create[4], create[5]]);
        assert_eq!(size, 64);
    }

    /// A device error on SELECT surfaces as `Error::Device` with no
    /// further traffic attempted.
    #[test]
    fn device_error_on_select_aborts_immediately() {
        let mut t = MockTransport::new(64);
        t.push(Opcode::ObjectSelect.into(), ResultCode::InvalidObject, &[]);
        let mut engine = DfuEngine::new(t);
        let mut stream = Cursor::new(vec![0u8; 10]);
        let err = write_procedure(&mut engine, ObjectType::Command, &mut stream, 10).unwrap_err();
        assert!(matches!(err, Error::Device { code: ResultCode::InvalidObject, .. }));
        assert_eq!(engine.transport_mut().requests.len(), 1);
    }
}
