//! Unsigned LEB128 varint helpers shared by the on-disk format and the wire
//! frame codec, mirroring the `readVarUInt`/length-prefixed-string style used
//! throughout the original `BinaryMessageReader`.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub fn put_varuint(buf: &mut impl BufMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            break;
        } else {
            buf.put_u8(byte | 0x80);
        }
    }
}

pub fn get_varuint(buf: &mut impl Buf) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Protocol("truncated varuint".into()));
        }
        if shift >= 64 {
            return Err(Error::Protocol("varuint too long".into()));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

pub fn put_lenenc_string(buf: &mut impl BufMut, s: &str) {
    put_varuint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

pub fn get_lenenc_string(buf: &mut impl Buf) -> Result<String> {
    let len = get_varuint(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol("truncated length-prefixed string".into()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("invalid utf8: {e}")))
}
