//! Chunk I/O: descriptor lifecycle (begin/end) and the read/write paths.
//!
//! All file I/O here runs with the chunk in the `Locked` registry state and
//! with none of the engine locks held. Errors from syscalls are recorded into
//! the owning folder's error ring at the site where the `io::Error` is still
//! available; callers only add damage reports on top.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use rimfs_types::status_code::{ChunkCode, StatusCode};
use rimfs_types::{make_error, make_error_msg, usec_now, ChunkId, Result, Status};
use rimfs_utils::crc32;

use crate::chunk::{Chunk, ChunkFormat, ChunkPartType};
use crate::engine::HddEngine;
use crate::folder::Folder;
use crate::open_pool::OpenChunk;
use crate::registry::ChunkGuard;
use crate::signature::{ChunkSignature, CRC_OFFSET, HEADER_SIZE};
use crate::stats::FolderIoTimer;
use crate::tester::ChunkTestRequest;
use crate::{
    empty_block_crc, BLOCKS_IN_CHUNK, BLOCK_SIZE, CRC_SIZE, DISK_BLOCK_SIZE, OPEN_RETRY_COUNT,
    OPEN_RETRY_MS,
};

thread_local! {
    static BLOCK_BUFFER: RefCell<Vec<u8>> =
        RefCell::new(vec![0u8; DISK_BLOCK_SIZE as usize]);
    static HEADER_BUFFER: RefCell<Vec<u8>> = RefCell::new(vec![0u8; HEADER_SIZE]);
}

/// Run `f` with this thread's scratch buffer of `CRC + block` size.
pub(crate) fn with_block_buffer<R>(f: impl FnOnce(&mut [u8]) -> R) -> R {
    BLOCK_BUFFER.with(|b| f(&mut b.borrow_mut()))
}

/// Run `f` with this thread's header-sized scratch buffer.
pub(crate) fn with_header_buffer<R>(f: impl FnOnce(&mut [u8]) -> R) -> R {
    HEADER_BUFFER.with(|b| f(&mut b.borrow_mut()))
}

#[allow(unused_variables)]
pub(crate) fn fadvise(file: &File, offset: u64, len: u64, advice: libc::c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        use std::os::unix::io::AsRawFd;
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        );
    }
}

impl HddEngine {
    pub(crate) fn owner_of(&self, c: &Chunk) -> Result<Arc<Folder>> {
        c.owner().ok_or_else(|| {
            Status::with_message(StatusCode::IO_ERROR, "chunk has no owning folder")
        })
    }

    /// The pooled resource backing an open chunk.
    pub(crate) fn resource_of(&self, c: &Chunk) -> Option<Arc<OpenChunk>> {
        let fd = c.inner.lock().fd;
        fd.and_then(|handle| self.pool.get(handle))
    }

    /// Record an I/O failure against the chunk's folder and the process-wide
    /// error counter.
    pub(crate) fn error_occurred(&self, c: &Chunk, err: Option<&std::io::Error>) {
        let errno = err.and_then(|e| e.raw_os_error()).unwrap_or(0);
        if let Some(folder) = c.owner() {
            folder.record_error(*c.id, errno, rimfs_types::wall_time_secs());
        }
        self.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prepare a chunk for I/O: open (or revive) its descriptor and, for
    /// split chunks, load and validate the signature and CRC table.
    pub(crate) fn io_begin(
        &self,
        c: &ChunkGuard<'_>,
        newflag: bool,
        expected_version: Option<u32>,
    ) -> Result<()> {
        // Rotate this chunk to the recently-tested end of its folder's list.
        if let Some(folder) = c.owner() {
            folder.chunks.lock().mark_as_tested(c.key());
        }

        let refcount = c.chunk().inner.lock().refcount;
        if refcount == 0 {
            let cached = c.chunk().inner.lock().fd;
            debug_assert!(!(newflag && cached.is_some()));

            let mut freshly_opened = false;
            let resource = match cached.and_then(|h| self.pool.acquire(h)) {
                Some(res) => res,
                None => {
                    freshly_opened = true;
                    // Age out long-unused descriptors before opening more.
                    self.free_unused_fds(usize::MAX);
                    let file = self.open_chunk_file(c, newflag)?;
                    let resource = OpenChunk::new(file, c.chunk());
                    let handle = self.pool.insert(resource);
                    c.chunk().inner.lock().fd = Some(handle);
                    self.pool
                        .get(handle)
                        .expect("freshly inserted pool resource")
                }
            };

            if c.format == ChunkFormat::Split {
                if newflag {
                    resource
                        .crc_table
                        .as_ref()
                        .expect("split chunk has a crc table")
                        .lock()
                        .fill(0);
                } else if freshly_opened {
                    fadvise(&resource.file, 0, HEADER_SIZE as u64, POSIX_FADV_WILLNEED);
                    if let Err(status) = self.read_crc_table(c, &resource, expected_version) {
                        let handle = c.chunk().inner.lock().fd;
                        if let Some(h) = handle {
                            self.pool.release(h, usec_now());
                        }
                        warn!(file = %c.filename().display(), "io begin: cannot load crc header");
                        return Err(status);
                    }
                }
            }
        }
        c.chunk().inner.lock().refcount += 1;
        Ok(())
    }

    /// Finish I/O on a chunk: flush the CRC table if dirty, optionally
    /// fsync, and hand the descriptor back to the pool.
    ///
    /// The descriptor is released on every path, including a failed CRC
    /// write-back; the dirty flag stays set in that case so the table is
    /// retried later (and at engine shutdown).
    pub(crate) fn io_end(&self, c: &ChunkGuard<'_>) -> Result<()> {
        let mut result = Ok(());

        if c.chunk().inner.lock().was_changed {
            if c.format == ChunkFormat::Split {
                result = self.write_crc_table(c);
            }
            if result.is_ok() && self.perform_fsync.load(Ordering::Relaxed) {
                result = self.fsync_chunk(c);
            }
            if result.is_ok() {
                c.chunk().inner.lock().was_changed = false;
            }
        }

        let release = {
            let mut inner = c.chunk().inner.lock();
            if inner.refcount == 0 {
                warn!(chunk_id = %c.id, "io end called with zero refcount");
                return result;
            }
            inner.refcount -= 1;
            if inner.refcount == 0 {
                inner.fd
            } else {
                None
            }
        };
        if let Some(handle) = release {
            if self.advise_no_cache.load(Ordering::Relaxed) {
                if let Some(res) = self.pool.get(handle) {
                    fadvise(&res.file, 0, 0, POSIX_FADV_DONTNEED);
                }
            }
            self.pool.release(handle, usec_now());
        }
        result
    }

    fn fsync_chunk(&self, c: &ChunkGuard<'_>) -> Result<()> {
        let Some(res) = self.resource_of(c) else {
            return Ok(());
        };
        let start = usec_now();
        if let Err(e) = res.file.sync_data() {
            self.error_occurred(c, Some(&e));
            warn!(file = %c.filename().display(), error = %e, "io end: fsync error");
            return Err(Status::io(c.filename().display(), &e));
        }
        let elapsed = usec_now().saturating_sub(start);
        self.stats.fsync_time(elapsed);
        if let Some(folder) = c.owner() {
            folder.current_stat.record_fsync(elapsed);
        }
        Ok(())
    }

    fn open_chunk_file(&self, c: &ChunkGuard<'_>, newflag: bool) -> Result<File> {
        let filename = c.filename();
        let read_only = c.owner().map(|f| f.is_read_only()).unwrap_or(false);

        for attempt in 0..OPEN_RETRY_COUNT {
            let result = if newflag {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o666)
                    .open(&filename)
            } else if read_only {
                OpenOptions::new().read(true).open(&filename)
            } else {
                OpenOptions::new().read(true).write(true).open(&filename)
            };
            match result {
                Ok(file) => return Ok(file),
                Err(e) if e.raw_os_error() == Some(libc::ENFILE)
                    && attempt + 1 < OPEN_RETRY_COUNT =>
                {
                    // Out of descriptors: back off and force-evict a few.
                    std::thread::sleep(std::time::Duration::from_millis(
                        OPEN_RETRY_MS << attempt,
                    ));
                    self.free_unused_fds_forced(4);
                }
                Err(e) => {
                    self.error_occurred(c, Some(&e));
                    warn!(file = %filename.display(), error = %e, "io begin: open error");
                    return Err(Status::io(filename.display(), &e));
                }
            }
        }
        make_error_msg(
            StatusCode::IO_ERROR,
            format!("{}: descriptor limit", filename.display()),
        )
    }

    /// Read and validate the split-format signature and load the CRC table.
    fn read_crc_table(
        &self,
        c: &ChunkGuard<'_>,
        res: &OpenChunk,
        expected_version: Option<u32>,
    ) -> Result<()> {
        let filename = c.filename();
        let sig = match ChunkSignature::read_from(&res.file) {
            Ok(Some(sig)) => sig,
            Ok(None) => {
                warn!(file = %filename.display(), "chunk header has wrong magic");
                return make_error(StatusCode::IO_ERROR);
            }
            Err(e) => {
                self.error_occurred(c, Some(&e));
                warn!(file = %filename.display(), error = %e, "chunk header read error");
                return Err(Status::io(filename.display(), &e));
            }
        };
        let expected = expected_version.unwrap_or_else(|| c.version());
        if sig.chunk_id != c.id || sig.version != expected || sig.type_id != c.part_type.type_id()
        {
            warn!(
                file = %filename.display(),
                header_id = %sig.chunk_id,
                header_version = sig.version,
                header_type = sig.type_id,
                "wrong id/version/type in chunk header"
            );
            return make_error(StatusCode::IO_ERROR);
        }

        let folder = self.owner_of(c)?;
        let table_mutex = res.crc_table.as_ref().expect("split chunk has a crc table");
        let mut table = table_mutex.lock();
        let len = table.len() as u64;
        let mut timer = FolderIoTimer::read(&folder, &self.stats, len);
        if let Err(e) = res.file.read_exact_at(&mut table, CRC_OFFSET) {
            timer.fail();
            drop(timer);
            self.error_occurred(c, Some(&e));
            warn!(file = %filename.display(), error = %e, "crc table read error");
            return Err(Status::io(filename.display(), &e));
        }
        drop(timer);
        self.stats.overhead_read(len);
        Ok(())
    }

    /// Write back the in-memory CRC table of a split chunk.
    pub(crate) fn write_crc_table(&self, c: &Chunk) -> Result<()> {
        let folder = self.owner_of(c)?;
        folder.need_refresh.store(true, Ordering::Relaxed);
        let res = self.resource_of(c).ok_or_else(|| {
            Status::with_message(StatusCode::IO_ERROR, "chunk is not open")
        })?;
        let table_mutex = res.crc_table.as_ref().expect("split chunk has a crc table");
        let table = table_mutex.lock();
        let len = table.len() as u64;
        let mut timer = FolderIoTimer::write(&folder, &self.stats, len);
        if let Err(e) = res.file.write_all_at(&table, CRC_OFFSET) {
            timer.fail();
            drop(timer);
            self.error_occurred(c, Some(&e));
            warn!(file = %c.filename().display(), error = %e, "crc table write error");
            return Err(Status::io(c.filename().display(), &e));
        }
        drop(timer);
        self.stats.overhead_write(len);
        Ok(())
    }

    /// Open a chunk for a read/write session.
    pub fn open_chunk(&self, id: ChunkId, part_type: ChunkPartType) -> Result<()> {
        let c = self
            .chunk_find(id, part_type)
            .ok_or_else(|| Status::new(ChunkCode::NO_CHUNK))?;
        self.open_locked(&c)
    }

    pub(crate) fn open_locked(&self, c: &ChunkGuard<'_>) -> Result<()> {
        let result = self.io_begin(c, false, None);
        if result.is_err() {
            self.report_damaged_chunk(c.id, c.part_type);
        }
        result
    }

    /// Close a chunk previously opened with [`open_chunk`](Self::open_chunk).
    pub fn close_chunk(&self, id: ChunkId, part_type: ChunkPartType) -> Result<()> {
        let c = self
            .chunk_find(id, part_type)
            .ok_or_else(|| Status::new(ChunkCode::NO_CHUNK))?;
        self.close_locked(&c)
    }

    pub(crate) fn close_locked(&self, c: &ChunkGuard<'_>) -> Result<()> {
        let result = self.io_end(c);
        if result.is_err() {
            self.report_damaged_chunk(c.id, c.part_type);
        }
        result
    }

    /// Hint the OS to read ahead `block_count` blocks starting at
    /// `first_block`.
    pub(crate) fn prefetch(&self, c: &Chunk, first_block: u16, block_count: u32) {
        if block_count == 0 {
            return;
        }
        let Some(res) = self.resource_of(c) else {
            return;
        };
        let len = block_count as u64 * c.format.disk_block_size() as u64;
        fadvise(
            &res.file,
            c.format.block_offset(first_block),
            len,
            POSIX_FADV_WILLNEED,
        );
    }

    /// Open a chunk, issue a read-ahead hint for the given range, and close
    /// it again.
    pub fn prefetch_blocks(
        &self,
        id: ChunkId,
        part_type: ChunkPartType,
        first_block: u16,
        block_count: u32,
    ) -> Result<()> {
        let Some(c) = self.chunk_find(id, part_type) else {
            warn!(chunk_id = %id, "cannot find chunk for prefetching");
            return make_error(ChunkCode::NO_CHUNK);
        };
        self.open_locked(&c)?;
        self.prefetch(&c, first_block, block_count);
        debug!(chunk_id = %id, first_block, block_count, "prefetched blocks");
        self.close_locked(&c)
    }

    /// Append `(crc, data)` of one block to `out`, verifying the stored CRC.
    ///
    /// Reads past the chunk's block count return the empty-block CRC and
    /// zeros. An interleaved block whose stored CRC bytes are zero and whose
    /// payload is all zero is a sparse hole; the empty-block CRC is
    /// substituted.
    pub(crate) fn read_crc_and_block(
        &self,
        c: &Chunk,
        res: &OpenChunk,
        block: u16,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if block >= BLOCKS_IN_CHUNK {
            return make_error(ChunkCode::BNUM_TOO_BIG);
        }
        if block >= c.blocks() {
            out.extend_from_slice(&empty_block_crc().to_be_bytes());
            out.resize(out.len() + BLOCK_SIZE as usize, 0);
            return Ok(());
        }

        let folder = self.owner_of(c)?;
        let start = out.len();

        match c.format {
            ChunkFormat::Split => {
                {
                    let table = res
                        .crc_table
                        .as_ref()
                        .expect("split chunk has a crc table")
                        .lock();
                    let i = block as usize * CRC_SIZE as usize;
                    out.extend_from_slice(&table[i..i + CRC_SIZE as usize]);
                }
                let data_pos = out.len();
                out.resize(data_pos + BLOCK_SIZE as usize, 0);
                let mut timer = FolderIoTimer::read(&folder, &self.stats, BLOCK_SIZE as u64);
                if let Err(e) = res
                    .file
                    .read_exact_at(&mut out[data_pos..], c.format.block_offset(block))
                {
                    timer.fail();
                    drop(timer);
                    out.truncate(start);
                    return Err(self.block_read_failed(c, block, &e));
                }
                drop(timer);

                let stored = u32::from_be_bytes(out[start..start + 4].try_into().unwrap());
                if stored != crc32(0, &out[data_pos..]) {
                    out.truncate(start);
                    return Err(self.block_crc_mismatch(c));
                }
            }
            ChunkFormat::Interleaved => {
                let off = c.format.block_offset(block);
                let mut crc_buf = [0u8; 4];
                {
                    let mut timer = FolderIoTimer::read(&folder, &self.stats, CRC_SIZE as u64);
                    if let Err(e) = res.file.read_exact_at(&mut crc_buf, off) {
                        timer.fail();
                        drop(timer);
                        return Err(self.block_read_failed(c, block, &e));
                    }
                }
                out.extend_from_slice(&crc_buf);
                let data_pos = out.len();
                out.resize(data_pos + BLOCK_SIZE as usize, 0);
                {
                    let mut timer = FolderIoTimer::read(&folder, &self.stats, BLOCK_SIZE as u64);
                    if let Err(e) = res
                        .file
                        .read_exact_at(&mut out[data_pos..], off + CRC_SIZE as u64)
                    {
                        timer.fail();
                        drop(timer);
                        out.truncate(start);
                        return Err(self.block_read_failed(c, block, &e));
                    }
                }

                if crc_buf == [0u8; 4] {
                    // Possible sparse hole; confirm and substitute the CRC.
                    if out[data_pos..].iter().all(|&b| b == 0) {
                        out[start..start + 4].copy_from_slice(&empty_block_crc().to_be_bytes());
                    }
                } else if u32::from_be_bytes(crc_buf) != crc32(0, &out[data_pos..]) {
                    out.truncate(start);
                    return Err(self.block_crc_mismatch(c));
                }
            }
        }
        Ok(())
    }

    fn block_read_failed(&self, c: &Chunk, block: u16, e: &std::io::Error) -> Status {
        self.error_occurred(c, Some(e));
        warn!(file = %c.filename().display(), block, error = %e, "block read error");
        self.report_damaged_chunk(c.id, c.part_type);
        Status::io(c.filename().display(), e)
    }

    fn block_crc_mismatch(&self, c: &Chunk) -> Status {
        // Queue a full scrub; the tester confirms or clears the alarm.
        self.enqueue_chunk_test(ChunkTestRequest {
            id: c.id,
            version: c.version(),
            part_type: c.part_type,
        });
        Status::new(ChunkCode::CRC_MISMATCH)
    }

    /// Read one block with its stored CRC into `buf` (layout: 4 CRC bytes,
    /// then the payload). Used by the rewrite paths that need the raw block.
    pub(crate) fn read_block_and_crc_raw(
        &self,
        c: &Chunk,
        folder: &Folder,
        res: &OpenChunk,
        block: u16,
        buf: &mut [u8],
    ) -> Result<()> {
        let crc_len = CRC_SIZE as usize;
        let block_len = BLOCK_SIZE as usize;
        match c.format {
            ChunkFormat::Split => {
                {
                    let table = res
                        .crc_table
                        .as_ref()
                        .expect("split chunk has a crc table")
                        .lock();
                    let i = block as usize * crc_len;
                    buf[..crc_len].copy_from_slice(&table[i..i + crc_len]);
                }
                let mut timer = FolderIoTimer::read(folder, &self.stats, BLOCK_SIZE as u64);
                if let Err(e) = res.file.read_exact_at(
                    &mut buf[crc_len..crc_len + block_len],
                    c.format.block_offset(block),
                ) {
                    timer.fail();
                    drop(timer);
                    return Err(self.block_read_failed(c, block, &e));
                }
            }
            ChunkFormat::Interleaved => {
                let mut timer = FolderIoTimer::read(folder, &self.stats, DISK_BLOCK_SIZE as u64);
                if let Err(e) = res.file.read_exact_at(
                    &mut buf[..crc_len + block_len],
                    c.format.block_offset(block),
                ) {
                    timer.fail();
                    drop(timer);
                    return Err(self.block_read_failed(c, block, &e));
                }
                drop(timer);
                // Sparse hole: zero CRC over an all-zero payload.
                if buf[..crc_len] == [0u8; 4]
                    && buf[crc_len..crc_len + block_len].iter().all(|&b| b == 0)
                {
                    buf[..crc_len].copy_from_slice(&empty_block_crc().to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Persist `buffer` into block `block` at `offset`, storing `stored_crc`
    /// as the block's CRC (table entry for split, leading bytes for
    /// interleaved). Punches holes over zero regions when enabled.
    pub(crate) fn write_partial_block_and_crc(
        &self,
        c: &Chunk,
        folder: &Folder,
        res: &OpenChunk,
        buffer: &[u8],
        offset: u32,
        stored_crc: u32,
        block: u16,
    ) -> Result<()> {
        match c.format {
            ChunkFormat::Split => {
                let file_off = c.format.block_offset(block) + offset as u64;
                {
                    let mut timer =
                        FolderIoTimer::write(folder, &self.stats, buffer.len() as u64);
                    if let Err(e) = res.file.write_all_at(buffer, file_off) {
                        timer.fail();
                        drop(timer);
                        return Err(self.block_write_failed(c, block, &e));
                    }
                }
                self.punch_holes(res, buffer, file_off);
                let mut table = res
                    .crc_table
                    .as_ref()
                    .expect("split chunk has a crc table")
                    .lock();
                let i = block as usize * CRC_SIZE as usize;
                table[i..i + CRC_SIZE as usize].copy_from_slice(&stored_crc.to_be_bytes());
            }
            ChunkFormat::Interleaved => {
                let block_off = c.format.block_offset(block);
                {
                    let mut timer = FolderIoTimer::write(folder, &self.stats, CRC_SIZE as u64);
                    if let Err(e) = res
                        .file
                        .write_all_at(&stored_crc.to_be_bytes(), block_off)
                    {
                        timer.fail();
                        drop(timer);
                        return Err(self.block_write_failed(c, block, &e));
                    }
                }
                let file_off = block_off + CRC_SIZE as u64 + offset as u64;
                {
                    let mut timer =
                        FolderIoTimer::write(folder, &self.stats, buffer.len() as u64);
                    if let Err(e) = res.file.write_all_at(buffer, file_off) {
                        timer.fail();
                        drop(timer);
                        return Err(self.block_write_failed(c, block, &e));
                    }
                }
                self.punch_holes(res, buffer, file_off);
            }
        }
        Ok(())
    }

    fn block_write_failed(&self, c: &Chunk, block: u16, e: &std::io::Error) -> Status {
        self.error_occurred(c, Some(e));
        warn!(file = %c.filename().display(), block, error = %e, "block write error");
        self.report_damaged_chunk(c.id, c.part_type);
        Status::io(c.filename().display(), e)
    }

    /// Request hole punching for 4 KiB-aligned zero regions of `buffer`,
    /// which was just written at `file_offset`. Best effort, Linux only.
    #[allow(unused_variables)]
    pub(crate) fn punch_holes(&self, res: &OpenChunk, buffer: &[u8], file_offset: u64) {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;

            if !self.punch_holes.load(Ordering::Relaxed) {
                return;
            }
            const HOLE_BLOCK: usize = 4096;

            let misalign = (file_offset as usize) % HOLE_BLOCK;
            let mut p = if misalign == 0 { 0 } else { HOLE_BLOCK - misalign };
            let mut hole_start = 0u64;
            let mut hole_size = 0u64;

            let punch = |start: u64, size: u64| unsafe {
                libc::fallocate(
                    res.file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    start as libc::off_t,
                    size as libc::off_t,
                );
            };

            while p + HOLE_BLOCK <= buffer.len() {
                let is_zero = buffer[p..p + HOLE_BLOCK].iter().all(|&b| b == 0);
                if is_zero {
                    if hole_size == 0 {
                        hole_start = file_offset + p as u64;
                    }
                    hole_size += HOLE_BLOCK as u64;
                } else {
                    if hole_size > 0 {
                        punch(hole_start, hole_size);
                    }
                    hole_size = 0;
                }
                p += HOLE_BLOCK;
            }
            if hole_size > 0 {
                punch(hole_start, hole_size);
            }
        }
    }

    /// Read `size` bytes at `offset` within the chunk, appending a 4-byte
    /// CRC of the returned range followed by the data to `out`.
    ///
    /// `offset` and `size` must stay within one block. When the read lags
    /// behind the sequentially-expected position, up to `max_read_behind`
    /// skipped blocks are pre-read, and an OS read-ahead hint covers
    /// `read_ahead` blocks past the requested one.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        id: ChunkId,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        max_read_behind: u32,
        read_ahead: u32,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let offset_in_block = offset % BLOCK_SIZE;
        if size == 0 || offset_in_block + size > BLOCK_SIZE {
            return make_error(ChunkCode::WRONG_SIZE);
        }

        let c = self
            .chunk_find(id, part_type)
            .ok_or_else(|| Status::new(ChunkCode::NO_CHUNK))?;
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        let res = self.resource_of(&c).ok_or_else(|| {
            Status::with_message(StatusCode::IO_ERROR, "chunk is not open")
        })?;

        let block = (offset / BLOCK_SIZE) as u16;
        if block >= BLOCKS_IN_CHUNK {
            return make_error(ChunkCode::BNUM_TOO_BIG);
        }

        // Catch up on possibly-skipped blocks of a sequential reader and ask
        // the OS for read-ahead.
        let expected = c.chunk().inner.lock().next_expected_block;
        if expected < block && max_read_behind > 0 {
            let mut first = expected;
            if (first as u32 + max_read_behind) < block as u32 {
                first = block - max_read_behind as u16;
            }
            self.prefetch(&c, first, read_ahead + (block - first) as u32);
            let mut scratch = Vec::with_capacity(DISK_BLOCK_SIZE as usize);
            for b in first..block {
                let _ = self.read_crc_and_block(&c, &res, b, &mut scratch);
                scratch.clear();
            }
        } else {
            self.prefetch(&c, block, read_ahead);
        }
        {
            let mut inner = c.chunk().inner.lock();
            inner.next_expected_block = inner.next_expected_block.max(block + 1);
        }

        if size == BLOCK_SIZE {
            self.read_crc_and_block(&c, &res, block, out)
        } else {
            // Sub-block read: fetch the whole block, then re-checksum the
            // requested range.
            let mut tmp = Vec::with_capacity(DISK_BLOCK_SIZE as usize);
            self.read_crc_and_block(&c, &res, block, &mut tmp)?;
            let from = CRC_SIZE as usize + offset_in_block as usize;
            let range = &tmp[from..from + size as usize];
            out.extend_from_slice(&crc32(0, range).to_be_bytes());
            out.extend_from_slice(range);
            Ok(())
        }
    }

    /// Write `size` bytes at `offset` within block `block`; `crc` must be
    /// the CRC32 of `buffer`.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        id: ChunkId,
        version: u32,
        part_type: ChunkPartType,
        block: u16,
        offset: u32,
        size: u32,
        crc: u32,
        buffer: &[u8],
    ) -> Result<()> {
        let c = self
            .chunk_find(id, part_type)
            .ok_or_else(|| Status::new(ChunkCode::NO_CHUNK))?;
        self.write_locked(&c, version, block, offset, size, crc, buffer)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_locked(
        &self,
        c: &ChunkGuard<'_>,
        version: u32,
        block: u16,
        offset: u32,
        size: u32,
        crc: u32,
        buffer: &[u8],
    ) -> Result<()> {
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        if block >= c.max_blocks_in_file() {
            return make_error(ChunkCode::BNUM_TOO_BIG);
        }
        if size > BLOCK_SIZE || buffer.len() != size as usize {
            return make_error(ChunkCode::WRONG_SIZE);
        }
        if offset >= BLOCK_SIZE || offset + size > BLOCK_SIZE {
            return make_error(ChunkCode::WRONG_OFFSET);
        }
        if crc != crc32(0, buffer) {
            return make_error(ChunkCode::CRC_MISMATCH);
        }

        c.chunk().inner.lock().was_changed = true;
        let folder = self.owner_of(c)?;
        let res = self.resource_of(c).ok_or_else(|| {
            Status::with_message(StatusCode::IO_ERROR, "chunk is not open")
        })?;

        if offset == 0 && size == BLOCK_SIZE {
            // Full-block write.
            let prev_blocks = {
                let mut inner = c.chunk().inner.lock();
                let prev = inner.blocks;
                if block >= inner.blocks {
                    inner.blocks = block + 1;
                }
                prev
            };
            if block >= prev_blocks {
                self.fill_crc_gap(c, &res, prev_blocks, block);
            }
            return self.write_partial_block_and_crc(c, &folder, &res, buffer, 0, crc, block);
        }

        // Partial-block write: verify the stored CRC against the existing
        // content, then recombine with the incoming range's CRC.
        let blocks = c.blocks();
        let post_len = BLOCK_SIZE - (offset + size);
        let (pre_crc, post_crc) = if block < blocks {
            with_block_buffer(|buf| -> Result<(u32, u32)> {
                self.read_block_and_crc_raw(c, &folder, &res, block, buf)?;
                let data = &buf[CRC_SIZE as usize..CRC_SIZE as usize + BLOCK_SIZE as usize];
                let pre = crc32(0, &data[..offset as usize]);
                let ch = crc32(0, &data[offset as usize..(offset + size) as usize]);
                let post = crc32(0, &data[(offset + size) as usize..]);
                let stored = u32::from_be_bytes(buf[..4].try_into().unwrap());
                if stored != combine_block_crc(offset, size, pre, ch, post) {
                    return make_error(ChunkCode::CRC_MISMATCH);
                }
                Ok((pre, post))
            })
            .map_err(|status| {
                if status.code() == ChunkCode::CRC_MISMATCH {
                    self.error_occurred(c, None);
                    warn!(file = %c.filename().display(), block, "crc mismatch before partial write");
                    self.report_damaged_chunk(c.id, c.part_type);
                }
                status
            })?
        } else {
            // Writing past the end: grow the file and treat the rest of the
            // block as zeros.
            if let Err(e) = res
                .file
                .set_len(c.format.file_size_from_blocks(block as u32 + 1))
            {
                self.error_occurred(c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "ftruncate error before write");
                self.report_damaged_chunk(c.id, c.part_type);
                return Err(Status::io(c.filename().display(), &e));
            }
            let prev_blocks = {
                let mut inner = c.chunk().inner.lock();
                let prev = inner.blocks;
                inner.blocks = block + 1;
                prev
            };
            self.fill_crc_gap(c, &res, prev_blocks, block);
            (
                rimfs_utils::crc32_zero_block(0, offset as usize),
                rimfs_utils::crc32_zero_block(0, post_len as usize),
            )
        };

        let combined = combine_block_crc(offset, size, pre_crc, crc, post_crc);
        self.write_partial_block_and_crc(c, &folder, &res, buffer, offset, combined, block)
    }

    /// Fill split-format CRC slots `[from, to)` with the empty-block CRC
    /// (blocks that came into existence as implicit zeros).
    pub(crate) fn fill_crc_gap(&self, c: &Chunk, res: &OpenChunk, from: u16, to: u16) {
        if c.format != ChunkFormat::Split || from >= to {
            return;
        }
        let mut table = res
            .crc_table
            .as_ref()
            .expect("split chunk has a crc table")
            .lock();
        let empty = empty_block_crc().to_be_bytes();
        for b in from..to {
            let i = b as usize * CRC_SIZE as usize;
            table[i..i + CRC_SIZE as usize].copy_from_slice(&empty);
        }
    }
}

/// Combine per-range CRCs into the full-block CRC: `pre` covers
/// `[0, offset)`, `mid` covers `[offset, offset+size)`, `post` covers the
/// rest of the block.
pub(crate) fn combine_block_crc(offset: u32, size: u32, pre: u32, mid: u32, post: u32) -> u32 {
    use rimfs_utils::crc32_combine;

    let post_len = (BLOCK_SIZE - (offset + size)) as u64;
    if offset == 0 {
        crc32_combine(mid, post, post_len)
    } else {
        let mut combined = crc32_combine(pre, mid, size as u64);
        if post_len > 0 {
            combined = crc32_combine(combined, post, post_len);
        }
        combined
    }
}

#[cfg(target_os = "linux")]
pub(crate) const POSIX_FADV_WILLNEED: libc::c_int = libc::POSIX_FADV_WILLNEED;
#[cfg(not(target_os = "linux"))]
pub(crate) const POSIX_FADV_WILLNEED: libc::c_int = 0;

#[cfg(target_os = "linux")]
pub(crate) const POSIX_FADV_DONTNEED: libc::c_int = libc::POSIX_FADV_DONTNEED;
#[cfg(not(target_os = "linux"))]
pub(crate) const POSIX_FADV_DONTNEED: libc::c_int = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use rimfs_utils::crc32_zero_block;

    #[test]
    fn test_combine_block_crc_matches_whole_block() {
        // Build a block out of three ranges and check the combined CRC
        // equals a straight CRC of the whole thing.
        let offset = 1000u32;
        let size = 2000u32;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let pre = crc32(0, &block[..offset as usize]);
        let mid = crc32(0, &block[offset as usize..(offset + size) as usize]);
        let post = crc32(0, &block[(offset + size) as usize..]);
        assert_eq!(
            combine_block_crc(offset, size, pre, mid, post),
            crc32(0, &block)
        );
    }

    #[test]
    fn test_combine_block_crc_offset_zero() {
        let size = 4096u32;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        block[..size as usize].fill(0xAA);
        let mid = crc32(0, &block[..size as usize]);
        let post = crc32_zero_block(0, (BLOCK_SIZE - size) as usize);
        assert_eq!(combine_block_crc(0, size, 0, mid, post), crc32(0, &block));
    }

    #[test]
    fn test_combine_block_crc_full_block() {
        let block = vec![0x5Au8; BLOCK_SIZE as usize];
        let mid = crc32(0, &block);
        assert_eq!(combine_block_crc(0, BLOCK_SIZE, 0, mid, 0), mid);
    }
}
