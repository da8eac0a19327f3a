use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::varint::{get_varuint, put_varuint};

/// Maximum payload length accepted by `read_from`; guards against a peer
/// claiming an absurd length and forcing an unbounded allocation.
pub const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

/// `opcode:u16 | flags:u16 | varuint length | bytes`. Stateless per frame:
/// nothing here depends on prior frames on the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub flags: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: u16, flags: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            flags,
            payload: payload.into(),
        }
    }

    /// Encodes this frame to a standalone buffer, e.g. for an outbox.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + 10 + self.payload.len());
        buf.extend_from_slice(&self.opcode.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        put_varuint(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Synchronous-with-respect-to-the-socket send: writes and flushes
    /// immediately. Used outside the async client's cooperative outbox (the
    /// query op handler sends this way, since it owns a dedicated blocking
    /// worker thread per connection).
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let bytes = self.encode();
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let opcode = r.read_u16().await?;
        let flags = r.read_u16().await?;
        let len = read_varuint_async(r).await?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame payload too large: {len} bytes (max {MAX_FRAME_PAYLOAD})"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).await?;
        Ok(Frame {
            opcode,
            flags,
            payload: Bytes::from(payload),
        })
    }
}

impl Frame {
    /// Blocking write, used by the query op handler's dedicated
    /// per-connection worker thread rather than the async client's
    /// cooperative loop.
    pub fn write_to_sync<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        let bytes = self.encode();
        w.write_all(&bytes)?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from_sync<R: std::io::Read>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        r.read_exact(&mut header)?;
        let opcode = u16::from_be_bytes([header[0], header[1]]);
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let len = read_varuint_sync(r)?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame payload too large: {len} bytes (max {MAX_FRAME_PAYLOAD})"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)?;
        Ok(Frame {
            opcode,
            flags,
            payload: Bytes::from(payload),
        })
    }
}

fn read_varuint_sync<R: std::io::Read>(r: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(Error::Protocol("varuint too long".into()));
        }
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        result |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

async fn read_varuint_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(Error::Protocol("varuint too long".into()));
        }
        let byte = r.read_u8().await?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

/// Decodes a frame already fully buffered in memory (used by the async
/// client, which reads into a per-Connection `read_buf` and decodes once a
/// full frame is available rather than awaiting directly on the socket).
pub fn try_decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let mut cursor = buf;
    if cursor.len() < 4 {
        return Ok(None);
    }
    let opcode = u16::from_be_bytes([cursor[0], cursor[1]]);
    let flags = u16::from_be_bytes([cursor[2], cursor[3]]);
    cursor = &cursor[4..];

    let mut probe = cursor;
    let len_start_remaining = probe.len();
    let len = match get_varuint(&mut probe) {
        Ok(v) => v,
        Err(_) => return Ok(None), // not enough bytes yet for the varuint
    };
    if len > MAX_FRAME_PAYLOAD {
        return Err(Error::Protocol(format!(
            "frame payload too large: {len} bytes (max {MAX_FRAME_PAYLOAD})"
        )));
    }
    let varuint_len = len_start_remaining - probe.len();
    let total = 4 + varuint_len + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[4 + varuint_len..total]);
    Ok(Some((Frame { opcode, flags, payload }, total)))
}
