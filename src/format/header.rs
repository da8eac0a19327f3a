use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::format::schema::{Column, Schema};
use crate::varint::put_varuint;

/// On-disk format version. v0_1_0 is explicitly unsupported: the arena
/// rejects it at construction, and this crate carries no migration path for
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormatVersion {
    V0_1_0,
    V0_2_0,
}

/// The fixed region, starting at file offset 0, reserved for the serialized
/// header. The two MetaBlock slots begin immediately after this region
/// (see `format::meta_block::META_BLOCK_POSITION`), so the header is capped
/// at `HEADER_REGION_SIZE` bytes regardless of how many columns a schema
/// declares.
pub const HEADER_REGION_SIZE: u64 = 4096;

/// Serialized file header: format version, the owning schema, and the
/// flattened column list computed once at construction (mirrors
/// `header.columns = header.schema->flatColumns()` in the original, which is
/// computed in the constructor and never recomputed).
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: BinaryFormatVersion,
    pub schema: Arc<Schema>,
    pub flat_columns: Vec<Column>,
}

impl FileHeader {
    pub fn new(version: BinaryFormatVersion, schema: Arc<Schema>) -> Self {
        let flat_columns = schema.flatten();
        Self {
            version,
            schema,
            flat_columns,
        }
    }

    /// Serializes the header. Returns an error if the result would not fit
    /// in `HEADER_REGION_SIZE` bytes.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u8(match self.version {
            BinaryFormatVersion::V0_1_0 => 1,
            BinaryFormatVersion::V0_2_0 => 2,
        });
        self.schema.encode(&mut buf);
        put_varuint(&mut buf, self.flat_columns.len() as u64);
        for col in &self.flat_columns {
            put_varuint(&mut buf, col.name.len() as u64);
            buf.put_slice(col.name.as_bytes());
        }
        if buf.len() as u64 > HEADER_REGION_SIZE {
            return Err(Error::InvalidArgument(format!(
                "serialized header ({} bytes) exceeds reserved header region ({} bytes)",
                buf.len(),
                HEADER_REGION_SIZE
            )));
        }
        Ok(buf)
    }
}
