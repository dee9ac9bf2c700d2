//! Serial camera framing protocol.
//!
//! The serial camera streams JPEG images wrapped in a small little-endian header:
//!
//! | magic `FF A0` | type `FF A1` | length (u16, whole packet) | JPEG payload |
//!
//! `SerialFrameDecoder` accumulates raw bytes, resynchronizes on the header,
//! and yields one payload at a time. It never hands out a partial packet and
//! drains every consumed byte once a packet is extracted.

use std::io;
use thiserror::Error;

/// Fixed header magic.
pub const FRAME_MAGIC: [u8; 2] = [0xFF, 0xA0];
/// Frame-type marker for image packets.
pub const FRAME_TYPE_IMAGE: [u8; 2] = [0xFF, 0xA1];
/// Magic + type + length.
pub const HEADER_LEN: usize = 6;
/// Unread transport bytes above which the backlog is dropped.
pub const DEFAULT_BACKLOG_THRESHOLD: usize = 8192;
/// Bytes requested from the transport per read.
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

const FRAME_HEADER: [u8; 4] = [
    FRAME_MAGIC[0],
    FRAME_MAGIC[1],
    FRAME_TYPE_IMAGE[0],
    FRAME_TYPE_IMAGE[1],
];

/// Outcome of a failed decode attempt.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Header found but the packet cannot be valid.
    #[error("corrupt packet: {0}")]
    Corrupt(String),
    /// Packet extracted but the payload is not a decodable image.
    #[error("corrupt jpeg payload: {0}")]
    Image(String),
    /// Transport backlog exceeded the threshold; transport and accumulator were cleared.
    #[error("discarded {0} bytes of serial backlog")]
    BacklogDiscarded(usize),
    /// One attempt read more than a backlog plus a maximum packet without finding one.
    #[error("no complete packet in {scanned} bytes read")]
    NoPacket { scanned: usize },
    /// Transport read timed out before a complete packet arrived.
    #[error("timed out waiting for packet ({buffered} bytes buffered)")]
    Timeout { buffered: usize },
    /// The transport itself failed. Fatal for this connection.
    #[error("serial transport failure: {0}")]
    Transport(#[from] io::Error),
}

impl DecodeError {
    /// True when the connection must be torn down and reopened by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Transport(_))
    }
}

/// Byte-stream seam between the decoder and a serial port (or a test fake).
pub trait ByteTransport {
    /// Read whatever is available into `buf`. Returns `Ok(0)` when the transport's
    /// timeout elapsed with no data.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of received bytes not yet read.
    fn pending(&mut self) -> io::Result<usize>;

    /// Drop every received byte not yet read.
    fn discard_pending(&mut self) -> io::Result<()>;
}

/// Counters reported by the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets: u64,
    pub corrupt: u64,
    pub backlog_discards: u64,
    pub buffered: usize,
}

/// Incremental decoder for the serial framing protocol.
pub struct SerialFrameDecoder {
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    backlog_threshold: usize,
    packets: u64,
    corrupt: u64,
    backlog_discards: u64,
}

impl SerialFrameDecoder {
    pub fn new(backlog_threshold: usize, chunk_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; chunk_size.max(1)],
            backlog_threshold,
            packets: 0,
            corrupt: 0,
            backlog_discards: 0,
        }
    }

    /// Append `bytes` and try to extract one packet.
    ///
    /// `Ok(None)` means more data is needed. Further packets already buffered are
    /// returned by subsequent calls (with an empty slice if nothing new arrived).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
        self.buffer.extend_from_slice(bytes);
        self.next_packet()
    }

    /// Pull bytes from `transport` until one packet is complete.
    ///
    /// Checks the transport backlog first; over the threshold both the transport
    /// input and the accumulator are cleared and no payload is returned. The
    /// backlog is checked again between reads while no header is buffered, and an
    /// attempt gives up with `NoPacket` once it has read more than the threshold
    /// plus one maximum-size packet.
    pub fn next_payload<T: ByteTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Vec<u8>, DecodeError> {
        let pending = transport.pending()?;
        if pending > self.backlog_threshold {
            return Err(self.discard_backlog(transport, pending)?);
        }

        let mut scanned = 0usize;
        loop {
            if let Some(payload) = self.next_packet()? {
                return Ok(payload);
            }
            if scanned > self.read_budget() {
                return Err(DecodeError::NoPacket { scanned });
            }
            // Only headerless bytes are buffered, so dropping the backlog loses nothing.
            if find_header(&self.buffer).is_none() {
                let pending = transport.pending()?;
                if pending > self.backlog_threshold {
                    return Err(self.discard_backlog(transport, pending)?);
                }
            }
            let read = transport.read_chunk(&mut self.chunk)?;
            if read == 0 {
                return Err(DecodeError::Timeout {
                    buffered: self.buffer.len(),
                });
            }
            scanned += read;
            self.buffer.extend_from_slice(&self.chunk[..read]);
        }
    }

    /// Bytes one attempt may read without completing a packet: a full backlog
    /// plus the largest packet the length field can declare.
    fn read_budget(&self) -> usize {
        self.backlog_threshold.saturating_add(u16::MAX as usize)
    }

    fn discard_backlog<T: ByteTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        pending: usize,
    ) -> Result<DecodeError, DecodeError> {
        transport.discard_pending()?;
        self.reset();
        self.backlog_discards += 1;
        Ok(DecodeError::BacklogDiscarded(pending))
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            packets: self.packets,
            corrupt: self.corrupt,
            backlog_discards: self.backlog_discards,
            buffered: self.buffer.len(),
        }
    }

    fn next_packet(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let Some(start) = find_header(&self.buffer) else {
            // Keep a tail that could still be the beginning of a split header.
            let keep = (FRAME_HEADER.len() - 1).min(self.buffer.len());
            let garbage = self.buffer.len() - keep;
            self.buffer.drain(..garbage);
            return Ok(None);
        };
        if start > 0 {
            self.buffer.drain(..start);
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
        if declared <= HEADER_LEN {
            // Skip this header so the next scan resumes after it.
            self.buffer.drain(..FRAME_HEADER.len());
            self.corrupt += 1;
            return Err(DecodeError::Corrupt(format!(
                "declared packet length {} leaves no payload",
                declared
            )));
        }
        if self.buffer.len() < declared {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..declared].to_vec();
        self.buffer.drain(..declared);
        self.packets += 1;
        Ok(Some(payload))
    }
}

impl Default for SerialFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_THRESHOLD, DEFAULT_CHUNK_SIZE)
    }
}

/// Wrap `payload` in a serial frame header.
pub fn encode_packet(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let total = payload.len() + HEADER_LEN;
    let length = u16::try_from(total).map_err(|_| {
        DecodeError::Corrupt(format!("payload of {} bytes exceeds u16 length", payload.len()))
    })?;
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&FRAME_HEADER);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

fn find_header(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(FRAME_HEADER.len())
        .position(|window| window == FRAME_HEADER)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
