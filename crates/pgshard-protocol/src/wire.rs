use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};

/// Messages larger than this are treated as a broken stream.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

pub fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Prefix `payload` with its type code and length.
pub fn frame(buf: &mut BytesMut, code: u8, payload: &[u8]) {
    buf.put_u8(code);
    buf.put_i32((payload.len() + 4) as i32);
    buf.extend_from_slice(payload);
}

/// Bounds-checked reader over a message body.
pub struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(anyhow!(
                "message truncated: wanted {} bytes, {} left",
                len,
                self.remaining()
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i16(&mut self) -> Result<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow!("unterminated string"))?;
        let value = String::from_utf8_lossy(&rest[..end]).to_string();
        self.pos += end + 1;
        Ok(value)
    }

    /// A length-prefixed value; -1 is NULL.
    pub fn value(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            Ok(None)
        } else {
            Ok(Some(self.take(len as usize)?.to_vec()))
        }
    }
}

pub fn put_value(buf: &mut BytesMut, value: &Option<Vec<u8>>) {
    match value {
        Some(v) => {
            buf.put_i32(v.len() as i32);
            buf.extend_from_slice(v);
        }
        None => buf.put_i32(-1),
    }
}
