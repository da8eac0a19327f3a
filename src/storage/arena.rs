use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio_uring::fs::File;

use crate::error::{Error, Result};
use crate::format::{BinaryFormatVersion, FileHeader, MetaBlock, Schema, META_BLOCK_SIZE};
use crate::storage::page_manager::{PageBacking, PageManager};

#[derive(Debug, Clone, Copy, Default)]
struct ArenaState {
    transaction_id: u64,
    num_rows: u64,
}

/// The in-memory write buffer bound to one schema and file descriptor.
/// Serializes the file header once at construction, stages commits under a
/// mutex, and writes header/index/meta-block to disk on the caller's
/// explicit commit protocol (see module docs).
pub struct CstArena {
    version: BinaryFormatVersion,
    schema: Arc<Schema>,
    header_bytes: Bytes,
    page_mgr: PageManager,
    state: Mutex<ArenaState>,
}

impl CstArena {
    /// Fails with `InvalidArgument` if `version` is `v0_1_0` — the legacy
    /// format is rejected outright, not migrated.
    pub fn new(version: BinaryFormatVersion, schema: Schema, backing: PageBacking) -> Result<Self> {
        if matches!(version, BinaryFormatVersion::V0_1_0) {
            return Err(Error::InvalidArgument(
                "cstable arenas do not support v0.1.0 files".into(),
            ));
        }

        let schema = Arc::new(schema);
        let header = FileHeader::new(version, Arc::clone(&schema));
        let header_bytes = header.encode()?.freeze();

        let page_mgr = PageManager::new(
            backing,
            crate::format::META_BLOCK_POSITION + 2 * META_BLOCK_SIZE,
            Vec::new(),
        );

        Ok(Self {
            version,
            schema,
            header_bytes,
            page_mgr,
            state: Mutex::new(ArenaState::default()),
        })
    }

    pub fn version(&self) -> BinaryFormatVersion {
        self.version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.page_mgr
    }

    /// Updates arena state under the mutex. Not yet persisted — a caller
    /// must still drive the commit protocol (`write_index` +
    /// `write_transaction` + fsync) to make this durable.
    pub fn commit(&self, transaction_id: u64, num_rows: u64) {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        state.transaction_id = transaction_id;
        state.num_rows = num_rows;
    }

    /// Reads the current committed `(transaction_id, num_rows)` under the
    /// same mutex as `commit`, so concurrent readers never observe a torn
    /// pair.
    pub fn snapshot(&self) -> (u64, u64) {
        let state = self.state.lock().expect("arena mutex poisoned");
        (state.transaction_id, state.num_rows)
    }

    /// Writes the serialized header at offset 0. Called once per file
    /// lifetime; header bytes are never mutated afterward.
    pub async fn write_header(&self, fd: &File) -> Result<u64> {
        let buf = self.header_bytes.to_vec();
        let want = buf.len();
        let (res, _buf) = fd.write_at(buf, 0).submit().await;
        let n = res?;
        if n != want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short header write: {n} of {want} bytes"),
            )));
        }
        Ok(n as u64)
    }

    /// Appends the serialized page index at the page manager's current
    /// tail. Returns `(index_offset, index_size)` for `write_transaction`.
    pub async fn write_index(&self, fd: &File) -> Result<(u64, u64)> {
        let index = self.page_mgr.get_page_index();
        let bytes = index.encode();
        let offset = self.page_mgr.current_tail();
        let want = bytes.len();
        let (res, _buf) = fd.write_at(bytes.to_vec(), offset).submit().await;
        let n = res?;
        if n != want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short index write: {n} of {want} bytes"),
            )));
        }
        Ok((offset, n as u64))
    }

    /// Serializes the MetaBlock for the current committed state and writes
    /// it to slot `transaction_id mod 2`.
    pub async fn write_transaction(&self, fd: &File, index_offset: u64, index_size: u64) -> Result<()> {
        let (transaction_id, num_rows) = self.snapshot();
        let mb = MetaBlock {
            transaction_id,
            num_rows,
            index_offset,
            index_size,
        };
        let bytes = mb.encode();
        assert_eq!(bytes.len() as u64, META_BLOCK_SIZE, "invalid meta block size");

        let offset = MetaBlock::slot_offset(transaction_id);
        let want = bytes.len();
        let (res, _buf) = fd.write_at(bytes.to_vec(), offset).submit().await;
        let n = res?;
        if n != want {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short meta block write: {n} of {want} bytes"),
            )));
        }
        Ok(())
    }

    /// Reads both meta-block slots and the header from `fd`, returning the
    /// winning slot's decoded state. This is the minimal reader implied by
    /// the atomic multi-version commit scheme; it does not decode column
    /// data.
    pub async fn open_reader(fd: &File) -> Result<(MetaBlock, Bytes)> {
        let header_buf = vec![0u8; crate::format::HEADER_REGION_SIZE as usize];
        let (res, header_buf) = fd.read_at(header_buf, 0).submit().await;
        res?;

        // Both slots live at fixed, non-overlapping offsets, so there's no
        // ordering dependency between reading them — fire both reads and
        // wait on whichever settles last rather than awaiting them in turn.
        let (slot0, slot1) = futures::try_join!(
            read_slot(fd, MetaBlock::slot_offset(0)),
            read_slot(fd, MetaBlock::slot_offset(1)),
        )?;
        let winner = MetaBlock::select_winner(slot0, slot1)?;

        Ok((winner, Bytes::from(header_buf)))
    }
}

async fn read_slot(fd: &File, offset: u64) -> Result<Option<MetaBlock>> {
    let buf = vec![0u8; META_BLOCK_SIZE as usize];
    let (res, buf) = fd.read_at(buf, offset).submit().await;
    res?;
    MetaBlock::decode_checked(Bytes::from(buf))
}

trait SubmitCompat: std::future::Future + Sized {
    fn submit(self) -> Self {
        self
    }
}
impl<F: std::future::Future> SubmitCompat for F {}
