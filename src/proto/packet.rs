//! Wire packet framing: 3-byte little-endian length, sequence id, payload.
//! Payloads at the 16 MiB boundary continue in follow-up packets.

use std::io::{Read, Write};

use crate::consts::MAX_PAYLOAD_LEN;
use crate::error::{Error, Result};

pub struct PacketStream<T> {
    stream: T,
    seq: u8,
}

impl<T: Read + Write> PacketStream<T> {
    pub fn new(stream: T) -> PacketStream<T> {
        PacketStream { stream, seq: 0 }
    }

    /// Every client command starts a fresh sequence.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Splits the framer apart so the transport can be replaced mid-stream,
    /// keeping the sequence position.
    #[cfg(any(feature = "tls", test))]
    pub fn into_parts(self) -> (T, u8) {
        (self.stream, self.seq)
    }

    #[cfg(feature = "tls")]
    pub fn from_parts(stream: T, seq: u8) -> PacketStream<T> {
        PacketStream { stream, seq }
    }

    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).map_err(Error::lost)?;
            let len = usize::from(header[0])
                | usize::from(header[1]) << 8
                | usize::from(header[2]) << 16;
            if header[3] != self.seq {
                return Err(Error::malformed(&format!(
                    "packets out of order (expected {}, got {})",
                    self.seq, header[3]
                )));
            }
            self.seq = self.seq.wrapping_add(1);
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(Error::lost)?;
            if len < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_PAYLOAD_LEN);
            let (chunk, tail) = rest.split_at(chunk_len);
            let header = [
                chunk_len as u8,
                (chunk_len >> 8) as u8,
                (chunk_len >> 16) as u8,
                self.seq,
            ];
            self.seq = self.seq.wrapping_add(1);
            self.stream.write_all(&header).map_err(Error::lost)?;
            self.stream.write_all(chunk).map_err(Error::lost)?;
            rest = tail;
            // a payload landing exactly on the boundary needs the empty
            // continuation packet the next iteration produces
            if chunk_len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        self.stream.flush().map_err(Error::lost)
    }
}
