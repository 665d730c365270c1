//! Wire framing and the growable response chunk buffer.
//!
//! Every response chunk is one protocol frame: a fixed header
//! (`version`, `type`, big-endian payload size) followed by zero or more
//! messages. `ChunkBuffer` keeps a reserved header slot at the front so
//! record encoders can append payload bytes freely; the header is patched
//! in just before the chunk is handed to the sink.

use std::io::{self, Read};

use bytes::BytesMut;

pub const PROTO_VERSION: u8 = 3;
pub const PROTO_TYPE_MSG: u8 = 3;
pub const PROTO_HEADER_SZ: usize = 10;

/// Initial capacity of a per-slice response buffer.
pub const INIT_BUF_SIZE: usize = 2 * 1024 * 1024;
/// Payload size past which a chunk is flushed mid-partition.
pub const CHUNK_LIMIT: usize = 1024 * 1024;

/// Growable response buffer with a reserved frame-header slot.
pub struct ChunkBuffer {
    buf: BytesMut,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(INIT_BUF_SIZE);
        buf.resize(PROTO_HEADER_SZ, 0);
        Self { buf }
    }

    /// Payload bytes accumulated past the header slot.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - PROTO_HEADER_SZ
    }

    /// Append-side access for message encoders.
    pub fn out(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Drop accumulated payload and re-reserve the header slot.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.resize(PROTO_HEADER_SZ, 0);
    }

    /// Patch the frame header and expose the complete frame for sending.
    pub fn frame(&mut self) -> &[u8] {
        let payload = (self.buf.len() - PROTO_HEADER_SZ) as u64;
        self.buf[0] = PROTO_VERSION;
        self.buf[1] = PROTO_TYPE_MSG;
        self.buf[2..PROTO_HEADER_SZ].copy_from_slice(&payload.to_be_bytes());
        &self.buf
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a standalone payload in a frame (used for fin and error replies).
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROTO_HEADER_SZ + payload.len());
    out.push(PROTO_VERSION);
    out.push(PROTO_TYPE_MSG);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a received frame into its payload, validating the header.
pub fn unframe(frame: &[u8]) -> anyhow::Result<&[u8]> {
    anyhow::ensure!(frame.len() >= PROTO_HEADER_SZ, "short proto header");
    anyhow::ensure!(frame[0] == PROTO_VERSION, "bad proto version {}", frame[0]);
    anyhow::ensure!(frame[1] == PROTO_TYPE_MSG, "bad proto type {}", frame[1]);
    let mut sz = [0u8; 8];
    sz.copy_from_slice(&frame[2..PROTO_HEADER_SZ]);
    let sz = u64::from_be_bytes(sz) as usize;
    anyhow::ensure!(frame.len() == PROTO_HEADER_SZ + sz, "frame size mismatch");
    Ok(&frame[PROTO_HEADER_SZ..])
}

/// Read one frame's payload from a blocking stream. `Ok(None)` on clean EOF.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; PROTO_HEADER_SZ];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated proto header",
            ));
        }
        filled += n;
    }
    if header[0] != PROTO_VERSION || header[1] != PROTO_TYPE_MSG {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad proto header",
        ));
    }
    let mut sz = [0u8; 8];
    sz.copy_from_slice(&header[2..PROTO_HEADER_SZ]);
    let mut payload = vec![0u8; u64::from_be_bytes(sz) as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_buffer_frames_and_resets() {
        let mut bb = ChunkBuffer::new();
        assert_eq!(bb.payload_len(), 0);

        bb.out().extend_from_slice(b"abc");
        assert_eq!(bb.payload_len(), 3);

        let frame = bb.frame().to_vec();
        assert_eq!(frame.len(), PROTO_HEADER_SZ + 3);
        assert_eq!(unframe(&frame).unwrap(), b"abc");

        bb.reset();
        assert_eq!(bb.payload_len(), 0);
        let frame = bb.frame().to_vec();
        assert_eq!(unframe(&frame).unwrap(), b"");
    }

    #[test]
    fn read_frame_round_trip() {
        let frame = frame_payload(b"hello");
        let mut cursor = std::io::Cursor::new(frame);
        let payload = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn unframe_rejects_bad_header() {
        assert!(unframe(b"xx").is_err());
        let mut frame = frame_payload(b"abc");
        frame[0] = 9;
        assert!(unframe(&frame).is_err());
    }
}
