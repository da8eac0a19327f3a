use std::cell::RefCell;

use tokio_uring::fs::File;

use crate::error::{Error, Result};
use crate::format::{PageIndex, PageIndexEntry};

/// Identifies a page allocated by a [`PageManager`]. Distinct from the page's
/// byte offset: the id is a monotonically increasing sequence number used to
/// look the page back up in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub u64);

/// Where a [`PageManager`]'s pages physically live. Only `FileBacked`
/// participates in durable commits; `MemoryBacked` exists so the arena can be
/// exercised without a filesystem (unit tests, ephemeral map-reduce scratch
/// tables).
pub enum PageBacking {
    FileBacked(File),
    MemoryBacked(RefCell<Vec<u8>>),
}

/// Allocates page-aligned-by-convention regions inside a file (or an
/// in-memory buffer) and tracks the index mapping logical column pages to
/// their `(offset, size)`. Single-threaded coordinator use only: like the
/// teacher's `CoreStorage`, the internal bookkeeping is a `RefCell`, not a
/// `Mutex` — callers are expected to drive one `PageManager` from one task.
pub struct PageManager {
    backing: PageBacking,
    tail: RefCell<u64>,
    next_page_id: RefCell<u64>,
    index: RefCell<Vec<PageIndexEntry>>,
}

impl PageManager {
    pub fn new(backing: PageBacking, start_offset: u64, initial_index: Vec<PageIndexEntry>) -> Self {
        Self {
            backing,
            tail: RefCell::new(start_offset),
            next_page_id: RefCell::new(initial_index.iter().map(|e| e.page_id + 1).max().unwrap_or(0)),
            index: RefCell::new(initial_index),
        }
    }

    /// Reserves a new page of `size` bytes for `column_id` holding
    /// `row_count` rows. Offsets are strictly increasing: the returned page's
    /// offset is the manager's running tail, which is then bumped by `size`.
    pub fn allocate_page(&self, column_id: u32, row_count: u64, size: u64) -> PageId {
        let offset = {
            let mut tail = self.tail.borrow_mut();
            let offset = *tail;
            *tail += size;
            offset
        };
        let page_id = {
            let mut next = self.next_page_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.index.borrow_mut().push(PageIndexEntry {
            column_id,
            page_id,
            offset,
            size,
            row_count,
        });
        PageId(page_id)
    }

    /// Writes `data` to the offset reserved for `page_id`. `data.len()` must
    /// equal the size the page was allocated with.
    pub async fn flush_page(&self, page_id: PageId, data: Vec<u8>) -> Result<Vec<u8>> {
        let entry = {
            let index = self.index.borrow();
            *index
                .iter()
                .find(|e| e.page_id == page_id.0)
                .ok_or_else(|| Error::NotFound(format!("page {} not allocated", page_id.0)))?
        };
        if data.len() as u64 != entry.size {
            return Err(Error::InvalidArgument(format!(
                "page {} allocated with size {} but flushed with {} bytes",
                page_id.0,
                entry.size,
                data.len()
            )));
        }

        match &self.backing {
            PageBacking::FileBacked(file) => {
                let (res, buf) = file.write_at(data, entry.offset).submit().await;
                let n = res?;
                if n as u64 != entry.size {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("short page write: {n} of {} bytes", entry.size),
                    )));
                }
                Ok(buf)
            }
            PageBacking::MemoryBacked(buf) => {
                let mut mem = buf.borrow_mut();
                let end = (entry.offset + entry.size) as usize;
                if mem.len() < end {
                    mem.resize(end, 0);
                }
                mem[entry.offset as usize..end].copy_from_slice(&data);
                Ok(data)
            }
        }
    }

    /// Reads back a previously flushed page. Only meaningful after the
    /// containing transaction has committed.
    pub async fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let entry = {
            let index = self.index.borrow();
            *index
                .iter()
                .find(|e| e.page_id == page_id.0)
                .ok_or_else(|| Error::NotFound(format!("page {} not allocated", page_id.0)))?
        };

        match &self.backing {
            PageBacking::FileBacked(file) => {
                let buf = vec![0u8; entry.size as usize];
                let (res, buf) = file.read_at(buf, entry.offset).submit().await;
                let n = res?;
                if n as u64 != entry.size {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("short page read: {n} of {} bytes", entry.size),
                    )));
                }
                Ok(buf)
            }
            PageBacking::MemoryBacked(buf) => {
                let mem = buf.borrow();
                let end = (entry.offset + entry.size) as usize;
                if mem.len() < end {
                    return Err(Error::NotFound(format!("page {} not yet flushed", page_id.0)));
                }
                Ok(mem[entry.offset as usize..end].to_vec())
            }
        }
    }

    /// An immutable snapshot of the current index, for writing to disk at
    /// commit.
    pub fn get_page_index(&self) -> PageIndex {
        PageIndex {
            entries: self.index.borrow().clone(),
        }
    }

    /// The current end of the allocated page region; `Arena::write_index`
    /// appends the serialized index starting here.
    pub fn current_tail(&self) -> u64 {
        *self.tail.borrow()
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, PageBacking::FileBacked(_))
    }
}

trait SubmitCompat: std::future::Future + Sized {
    fn submit(self) -> Self {
        self
    }
}
impl<F: std::future::Future> SubmitCompat for F {}
