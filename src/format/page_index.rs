use bytes::{Buf, BufMut};

use crate::error::Result;
use crate::varint::{get_varuint, put_varuint};

/// One entry in the on-disk page index: which column a page belongs to,
/// the page's id, its byte range in the file, and how many rows it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndexEntry {
    pub column_id: u32,
    pub page_id: u64,
    pub offset: u64,
    pub size: u64,
    pub row_count: u64,
}

impl PageIndexEntry {
    fn encode(&self, buf: &mut impl BufMut) {
        put_varuint(buf, self.column_id as u64);
        put_varuint(buf, self.page_id);
        put_varuint(buf, self.offset);
        put_varuint(buf, self.size);
        put_varuint(buf, self.row_count);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            column_id: get_varuint(buf)? as u32,
            page_id: get_varuint(buf)?,
            offset: get_varuint(buf)?,
            size: get_varuint(buf)?,
            row_count: get_varuint(buf)?,
        })
    }
}

/// An immutable snapshot of the page index, written to disk at commit time
/// (`Arena::write_index`) and read back by `Arena::open_reader`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageIndex {
    pub entries: Vec<PageIndexEntry>,
}

impl PageIndex {
    pub fn encode(&self) -> bytes::BytesMut {
        let mut buf = bytes::BytesMut::new();
        put_varuint(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        let num_entries = get_varuint(&mut buf)?;
        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            entries.push(PageIndexEntry::decode(&mut buf)?);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let index = PageIndex {
            entries: vec![
                PageIndexEntry { column_id: 0, page_id: 1, offset: 4096, size: 8192, row_count: 100 },
                PageIndexEntry { column_id: 1, page_id: 2, offset: 12288, size: 4096, row_count: 100 },
            ],
        };
        let bytes = index.encode();
        let decoded = PageIndex::decode(bytes.freeze()).unwrap();
        assert_eq!(index, decoded);
    }
}
