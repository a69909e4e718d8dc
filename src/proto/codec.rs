//! Length-encoded primitives shared by every packet parser and builder.

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::error::{Error, Result};

/// A front-consuming view over one packet payload.
#[derive(Debug)]
pub struct ParseBuf<'a>(pub &'a [u8]);

impl<'a> ParseBuf<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn eat_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(Error::malformed("truncated payload"));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.eat_bytes(n).map(|_| ())
    }

    pub fn eat_u8(&mut self) -> Result<u8> {
        Ok(self.eat_bytes(1)?[0])
    }

    pub fn eat_u16_le(&mut self) -> Result<u16> {
        Ok(LE::read_u16(self.eat_bytes(2)?))
    }

    pub fn eat_u24_le(&mut self) -> Result<u32> {
        Ok(LE::read_u24(self.eat_bytes(3)?))
    }

    pub fn eat_u32_le(&mut self) -> Result<u32> {
        Ok(LE::read_u32(self.eat_bytes(4)?))
    }

    pub fn eat_u64_le(&mut self) -> Result<u64> {
        Ok(LE::read_u64(self.eat_bytes(8)?))
    }

    pub fn eat_f32_le(&mut self) -> Result<f32> {
        Ok(LE::read_f32(self.eat_bytes(4)?))
    }

    pub fn eat_f64_le(&mut self) -> Result<f64> {
        Ok(LE::read_f64(self.eat_bytes(8)?))
    }

    /// Length-encoded integer. `0xfb` and `0xff` markers are invalid here;
    /// row parsers handle the NULL marker before calling.
    pub fn eat_lenenc_int(&mut self) -> Result<u64> {
        match self.eat_u8()? {
            v @ 0..=0xfa => Ok(u64::from(v)),
            0xfc => Ok(u64::from(self.eat_u16_le()?)),
            0xfd => Ok(u64::from(self.eat_u24_le()?)),
            0xfe => self.eat_u64_le(),
            v => Err(Error::malformed(&format!(
                "invalid length-encoded integer prefix {v:#04x}"
            ))),
        }
    }

    pub fn eat_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.eat_lenenc_int()?;
        self.eat_bytes(len as usize)
    }

    /// Bytes up to (and consuming) a NUL terminator; a missing terminator
    /// yields the remainder, which some servers send for trailing fields.
    pub fn eat_null_bytes(&mut self) -> Result<&'a [u8]> {
        match self.0.iter().position(|&c| c == 0) {
            Some(pos) => {
                let head = &self.0[..pos];
                self.0 = &self.0[pos + 1..];
                Ok(head)
            }
            None => {
                let head = self.0;
                self.0 = &[];
                Ok(head)
            }
        }
    }

    pub fn eat_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }
}

pub fn put_lenenc_int(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=250 => buf.push(v as u8),
        251..=0xffff => {
            buf.push(0xfc);
            buf.extend_from_slice(&(v as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.push(0xfe);
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

pub fn put_lenenc_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_lenenc_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn put_null_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenenc_int_encodings() {
        let enc = |v: u64| {
            let mut b = Vec::new();
            put_lenenc_int(&mut b, v);
            b
        };
        assert_eq!(enc(0), [0x00]);
        assert_eq!(enc(250), [0xfa]);
        assert_eq!(enc(251), [0xfc, 0xfb, 0x00]);
        assert_eq!(enc(0xffff), [0xfc, 0xff, 0xff]);
        assert_eq!(enc(0x1_0000), [0xfd, 0x00, 0x00, 0x01]);
        assert_eq!(enc(0xff_ffff), [0xfd, 0xff, 0xff, 0xff]);
        assert_eq!(
            enc(0x100_0000),
            [0xfe, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lenenc_int_round_trips() {
        for v in [0u64, 1, 250, 251, 0xffff, 0x1_0000, 0xff_ffff, 0x100_0000, u64::MAX] {
            let mut b = Vec::new();
            put_lenenc_int(&mut b, v);
            let mut p = ParseBuf(&b);
            assert_eq!(p.eat_lenenc_int().unwrap(), v);
            assert!(p.is_empty());
        }
    }

    #[test]
    fn lenenc_bytes_and_null_strings() {
        let mut b = Vec::new();
        put_lenenc_bytes(&mut b, b"hello");
        put_null_str(&mut b, "world");
        let mut p = ParseBuf(&b);
        assert_eq!(p.eat_lenenc_bytes().unwrap(), b"hello");
        assert_eq!(p.eat_null_bytes().unwrap(), b"world");
        assert!(p.is_empty());
    }

    #[test]
    fn null_bytes_without_terminator_takes_rest() {
        let mut p = ParseBuf(b"tail");
        assert_eq!(p.eat_null_bytes().unwrap(), b"tail");
        assert!(p.is_empty());
    }

    #[test]
    fn truncation_is_malformed_not_panic() {
        let mut p = ParseBuf(b"\xfc\x01");
        assert!(p.eat_lenenc_int().is_err());
        let mut p = ParseBuf(b"ab");
        assert!(p.eat_u32_le().is_err());
    }
}
