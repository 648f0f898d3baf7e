//! The binary file engine: header, B+tree area, and an append-allocated
//! document region.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use super::header::{DEFAULT_BTREE_RESERVATION, HEADER_SIZE, Header};
use crate::btree::{BTree, MAX_KEYS, NODE_SIZE, NodeIo, Payload};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::fsutil;

const PAGE_SIZE: usize = 256 * 1024;
const MIN_GROWTH: u64 = 4 * 1024 * 1024;
const PAGE_CACHE_PAGES: usize = 64;

/// Drives the B+tree's page I/O against the shared file handle.
#[derive(Clone)]
struct FileNodeIo {
    file: Arc<Mutex<File>>,
}

impl NodeIo for FileNodeIo {
    fn read_bytes(&mut self, offset: u32) -> Result<[u8; NODE_SIZE]> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = [0u8; NODE_SIZE];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_bytes(&mut self, offset: u32, bytes: &[u8; NODE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(bytes)?;
        Ok(())
    }
}

pub struct FileEngine {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    header: Header,
    header_dirty: bool,
    tree: BTree<FileNodeIo>,
    pending_writes: HashMap<u32, Vec<u8>>,
    last_flush: Instant,
    page_cache: Option<LruCache<u64, Vec<u8>>>,
    config: Config,
}

impl FileEngine {
    /// # Errors
    /// Returns an error if the file cannot be opened/created, or its header
    /// is malformed.
    pub fn open(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        let has_header = path.exists() && std::fs::metadata(&path)?.len() >= HEADER_SIZE as u64;
        let file = fsutil::open_rw_no_trunc(&path)?;
        let file = Arc::new(Mutex::new(file));

        let header = if has_header {
            let mut buf = [0u8; HEADER_SIZE];
            {
                let mut f = file.lock();
                f.seek(SeekFrom::Start(0))?;
                f.read_exact(&mut buf)?;
            }
            Header::decode(&buf)?
        } else {
            let header = Header::fresh(DEFAULT_BTREE_RESERVATION);
            let mut f = file.lock();
            f.set_len(u64::from(header.free_space_offset))?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&header.encode())?;
            drop(f);
            header
        };

        let root_offset = (header.root_node_offset >= 0).then_some(header.root_node_offset as u32);
        let tree = BTree::new(
            FileNodeIo { file: file.clone() },
            root_offset,
            header.next_node_offset,
            config.cache_size,
        );
        let page_cache = config
            .mmap_enabled
            .then(|| LruCache::new(NonZeroUsize::new(PAGE_CACHE_PAGES).expect("nonzero constant")));

        Ok(Self {
            file,
            path,
            header,
            header_dirty: false,
            tree,
            pending_writes: HashMap::new(),
            last_flush: Instant::now(),
            page_cache,
            config,
        })
    }

    #[must_use]
    pub fn document_count(&self) -> u32 {
        self.header.document_count
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    /// Returns an error on I/O failure or a structurally corrupt tree node.
    pub fn write_document(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::InvalidFormat("payload exceeds 4 GiB".to_string()))?;
        let offset = self.allocate_region(len)?;
        let existed = self.tree.find(key)?.is_some();
        self.tree.insert(key, (offset, len))?;
        self.pending_writes.insert(offset, payload.to_vec());
        if !existed {
            self.header.document_count += 1;
        }
        self.header_dirty = true;
        self.maybe_flush()?;
        Ok(())
    }

    /// # Errors
    /// Returns an error on I/O failure or a structurally corrupt tree node.
    pub fn read_document(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some((offset, len)) = self.tree.find(key)? else { return Ok(None) };
        if let Some(bytes) = self.pending_writes.get(&offset) {
            return Ok(Some(bytes.clone()));
        }
        self.read_region(offset, len).map(Some)
    }

    /// # Errors
    /// Returns an error on I/O failure or a structurally corrupt tree node.
    pub fn remove_document(&mut self, key: &str) -> Result<bool> {
        let removed = self.tree.remove(key)?;
        if removed {
            self.header.document_count = self.header.document_count.saturating_sub(1);
            self.header_dirty = true;
        }
        Ok(removed)
    }

    /// # Errors
    /// Returns an error on I/O failure or a structurally corrupt tree node.
    pub fn get_all_entries(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.tree.get_all_entries()?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, (offset, len)) in entries {
            let bytes = if let Some(pending) = self.pending_writes.get(&offset) {
                pending.clone()
            } else {
                self.read_region(offset, len)?
            };
            out.push((key, bytes));
        }
        Ok(out)
    }

    fn allocate_region(&mut self, len: u32) -> Result<u32> {
        let offset = self.header.free_space_offset;
        let needed_end = u64::from(offset) + u64::from(len);
        let mut file = self.file.lock();
        let cur_len = file.metadata()?.len();
        if needed_end > cur_len {
            let growth = (4 * u64::from(len)).max(MIN_GROWTH);
            file.set_len(needed_end + growth)?;
        }
        drop(file);
        self.header.free_space_offset = self
            .header
            .free_space_offset
            .checked_add(len)
            .ok_or_else(|| Error::InvalidFormat("document region overflowed u32 offsets".to_string()))?;
        Ok(offset)
    }

    fn read_region(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        if self.page_cache.is_none() {
            return self.read_region_direct(offset, len);
        }
        let start = u64::from(offset);
        let end = start + u64::from(len);
        let mut out = Vec::with_capacity(len as usize);
        let mut cur = start;
        while cur < end {
            let page_idx = cur / PAGE_SIZE as u64;
            let page_start = page_idx * PAGE_SIZE as u64;
            let page = self.load_page(page_idx)?;
            let local_start = (cur - page_start) as usize;
            let local_end = (end.min(page_start + PAGE_SIZE as u64) - page_start) as usize;
            if local_end > page.len() {
                return Err(Error::StructuralCorruption {
                    offset: cur,
                    reason: "document region read past end of file".to_string(),
                });
            }
            out.extend_from_slice(&page[local_start..local_end]);
            cur = page_start + local_end as u64;
        }
        Ok(out)
    }

    fn read_region_direct(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn load_page(&mut self, page_idx: u64) -> Result<Vec<u8>> {
        if let Some(cache) = &mut self.page_cache
            && let Some(p) = cache.get(&page_idx)
        {
            return Ok(p.clone());
        }
        let page_offset = page_idx * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        let to_read = PAGE_SIZE.min(file_len.saturating_sub(page_offset) as usize);
        let mut buf = vec![0u8; to_read];
        file.seek(SeekFrom::Start(page_offset))?;
        file.read_exact(&mut buf)?;
        drop(file);
        if let Some(cache) = &mut self.page_cache {
            cache.put(page_idx, buf.clone());
        }
        Ok(buf)
    }

    fn maybe_flush(&mut self) -> Result<()> {
        let over_batch = self.pending_writes.len() >= self.config.file_batch_size;
        let over_time = self.last_flush.elapsed() >= Duration::from_millis(self.config.auto_flush_ms);
        if over_batch || over_time {
            self.flush()?;
        }
        Ok(())
    }

    /// Force all buffered document writes and a dirty header to disk.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending_writes.is_empty() {
            let mut entries: Vec<(u32, Vec<u8>)> = self.pending_writes.drain().collect();
            entries.sort_by_key(|(offset, _)| *offset);
            let mut file = self.file.lock();
            for (offset, bytes) in &entries {
                file.seek(SeekFrom::Start(u64::from(*offset)))?;
                file.write_all(bytes)?;
            }
            drop(file);
            if let Some(cache) = &mut self.page_cache {
                cache.clear();
            }
        }
        if self.header_dirty {
            self.write_header()?;
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flush and fsync; used at commit-critical points.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.root_node_offset = self.tree.root_offset().map_or(-1, |o| o as i32);
        self.header.next_node_offset = self.tree.next_node_offset();
        let bytes = self.header.encode();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Rebuild the file with a right-sized B+tree area and no dead document
    /// bytes. On failure, the pre-compaction file is restored.
    ///
    /// # Errors
    /// Returns `CompactionFailed` if rebuilding fails; the engine remains
    /// usable against the restored original file in that case.
    pub fn compact(&mut self) -> Result<()> {
        self.flush()?;
        let backup = fsutil::backup_path(&self.path);
        std::fs::copy(&self.path, &backup)?;
        match self.compact_inner() {
            Ok(()) => {
                let _ = std::fs::remove_file(&backup);
                Ok(())
            }
            Err(e) => {
                let restore = std::fs::copy(&backup, &self.path).and_then(|_| self.reopen());
                let _ = std::fs::remove_file(&backup);
                restore?;
                Err(Error::CompactionFailed(e.to_string()))
            }
        }
    }

    fn compact_inner(&mut self) -> Result<()> {
        let entries = self.tree.get_all_entries()?;
        let mut payloads = Vec::with_capacity(entries.len());
        for (key, (offset, len)) in entries {
            let bytes = if let Some(pending) = self.pending_writes.get(&offset) {
                pending.clone()
            } else {
                self.read_region_direct(offset, len)?
            };
            payloads.push((key, bytes));
        }

        let fill = ((MAX_KEYS as f64) * 0.7).floor().max(1.0) as usize;
        let leaves = payloads.len().div_ceil(fill).max(1);
        let mut internals = 0usize;
        let mut level = leaves;
        while level > 1 {
            level = level.div_ceil(MAX_KEYS + 1);
            internals += level;
        }
        let required = ((1.5 * (leaves + internals) as f64 * NODE_SIZE as f64).ceil() as u64)
            .max(u64::from(DEFAULT_BTREE_RESERVATION));
        let new_reserved1 = u32::try_from(required).unwrap_or(u32::MAX);

        let doc_region_start = HEADER_SIZE as u32 + new_reserved1;
        self.tree =
            BTree::new(FileNodeIo { file: self.file.clone() }, None, HEADER_SIZE as u32, self.config.cache_size);

        let mut new_entries = Vec::with_capacity(payloads.len());
        let mut writes = Vec::with_capacity(payloads.len());
        let mut write_offset = doc_region_start;
        for (key, bytes) in payloads {
            let len = u32::try_from(bytes.len())
                .map_err(|_| Error::InvalidFormat("payload exceeds 4 GiB".to_string()))?;
            new_entries.push((key, (write_offset, len)));
            writes.push((write_offset, bytes));
            write_offset += len;
        }
        let document_count = u32::try_from(new_entries.len()).unwrap_or(u32::MAX);
        self.tree.bulk_insert(new_entries)?;

        {
            let mut file = self.file.lock();
            for (offset, bytes) in &writes {
                file.seek(SeekFrom::Start(u64::from(*offset)))?;
                file.write_all(bytes)?;
            }
            file.set_len(u64::from(write_offset))?;
        }

        self.header.reserved1 = new_reserved1;
        self.header.free_space_offset = write_offset;
        self.header.document_count = document_count;
        self.pending_writes.clear();
        if let Some(cache) = &mut self.page_cache {
            cache.clear();
        }
        self.tree.clear_cache();
        self.write_header()?;
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut f = self.file.lock();
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut buf)?;
        }
        self.header = Header::decode(&buf)?;
        let root_offset = (self.header.root_node_offset >= 0).then_some(self.header.root_node_offset as u32);
        self.tree = BTree::new(
            FileNodeIo { file: self.file.clone() },
            root_offset,
            self.header.next_node_offset,
            self.config.cache_size,
        );
        self.pending_writes.clear();
        if let Some(cache) = &mut self.page_cache {
            cache.clear();
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_payload_shape(_: Payload) {}
