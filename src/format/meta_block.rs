use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;

use crate::error::{Error, Result};
use crate::format::header::HEADER_REGION_SIZE;

/// Fixed byte offset where the two MetaBlock slots begin; immediately after
/// the reserved header region.
pub const META_BLOCK_POSITION: u64 = HEADER_REGION_SIZE;

/// Fixed size of a single MetaBlock slot on disk: 4 `u64` fields (32 bytes)
/// plus a trailing `u32` CRC-32 (4 bytes), rounded up to 64 bytes to leave
/// headroom for future fields without reformatting existing files.
pub const META_BLOCK_SIZE: u64 = 64;

const ENCODED_LEN: usize = 8 * 4 + 4; // four u64 fields + trailing crc32

/// Fixed-size on-disk record for one committed transaction's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlock {
    pub transaction_id: u64,
    pub num_rows: u64,
    pub index_offset: u64,
    pub index_size: u64,
}

impl MetaBlock {
    /// Serializes to exactly `META_BLOCK_SIZE` bytes: the encoded fields,
    /// a trailing CRC-32 over them, then zero padding.
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(ENCODED_LEN);
        body.put_u64(self.transaction_id);
        body.put_u64(self.num_rows);
        body.put_u64(self.index_offset);
        body.put_u64(self.index_size);

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = BytesMut::with_capacity(META_BLOCK_SIZE as usize);
        out.put_slice(&body);
        out.put_u32(crc);
        out.resize(META_BLOCK_SIZE as usize, 0);
        debug_assert_eq!(out.len() as u64, META_BLOCK_SIZE);
        out
    }

    /// Decodes a slot, validating its trailing CRC. Returns `Ok(None)` for a
    /// slot whose checksum doesn't match (an unwritten or torn slot), and an
    /// error only for a structurally malformed (too-short) buffer.
    pub fn decode_checked(mut buf: impl Buf) -> Result<Option<Self>> {
        if buf.remaining() < ENCODED_LEN {
            return Err(Error::Protocol("meta block slot too short".into()));
        }
        let transaction_id = buf.get_u64();
        let num_rows = buf.get_u64();
        let index_offset = buf.get_u64();
        let index_size = buf.get_u64();
        let stored_crc = buf.get_u32();

        let mut body = BytesMut::with_capacity(ENCODED_LEN);
        body.put_u64(transaction_id);
        body.put_u64(num_rows);
        body.put_u64(index_offset);
        body.put_u64(index_size);
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Ok(None);
        }

        Ok(Some(MetaBlock {
            transaction_id,
            num_rows,
            index_offset,
            index_size,
        }))
    }

    pub fn slot_offset(transaction_id: u64) -> u64 {
        META_BLOCK_POSITION + (transaction_id % 2) * META_BLOCK_SIZE
    }

    /// Picks the winning slot between the two decoded candidates: the valid
    /// slot with the higher transaction_id wins; a lone valid slot wins
    /// outright; no valid slot is a corrupt file.
    pub fn select_winner(slot0: Option<MetaBlock>, slot1: Option<MetaBlock>) -> Result<MetaBlock> {
        match (slot0, slot1) {
            (Some(a), Some(b)) => Ok(if a.transaction_id >= b.transaction_id { a } else { b }),
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (None, None) => Err(Error::InvalidArgument("no valid meta block slot".into())),
        }
    }
}
