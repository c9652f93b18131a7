//! Chunk operations: create, delete, set-version, duplicate, truncate,
//! duplicate-and-truncate, test, and the combined dispatcher used by the
//! protocol layer.

use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;

use tracing::warn;

use rimfs_types::status_code::{ChunkCode, StatusCode};
use rimfs_types::{make_error, ChunkId, Result, Status};
use rimfs_utils::{crc32, crc32_zero_expanded};

use crate::chunk::{ChunkFormat, ChunkPartType};
use crate::engine::HddEngine;
use crate::io::{fadvise, with_block_buffer, with_header_buffer, POSIX_FADV_DONTNEED};
use crate::registry::ChunkGuard;
use crate::signature::{ChunkSignature, CRC_OFFSET, HEADER_SIZE, VERSION_OFFSET};
use crate::stats::{FolderIoTimer, OpKind};
use crate::{BLOCK_SIZE, CHUNK_SIZE, CRC_SIZE};

impl HddEngine {
    /// Create a new, empty chunk on the least-loaded selectable folder.
    pub fn create_chunk(&self, id: ChunkId, version: u32, part_type: ChunkPartType) -> Result<()> {
        self.stats.count_op(OpKind::Create);

        let Some(folder) = self.pick_folder() else {
            return make_error(ChunkCode::NO_SPACE);
        };
        let Some(c) = self.chunk_create(&folder, id, part_type, version, None) else {
            return make_error(ChunkCode::CHUNK_EXISTS);
        };

        if let Err(status) = self.io_begin(&c, true, None) {
            self.chunk_delete_guard(c);
            return Err(status);
        }

        if c.format == ChunkFormat::Split {
            if let Err(status) = self.write_new_header(&c, id, version, part_type) {
                let _ = self.io_end(&c);
                let _ = std::fs::remove_file(c.filename());
                self.chunk_delete_guard(c);
                return Err(status);
            }
        }

        if let Err(status) = self.io_end(&c) {
            let _ = std::fs::remove_file(c.filename());
            self.chunk_delete_guard(c);
            return Err(status);
        }
        Ok(())
    }

    /// Write a fresh split-format header (signature + zeroed CRC table).
    fn write_new_header(
        &self,
        c: &ChunkGuard<'_>,
        id: ChunkId,
        version: u32,
        part_type: ChunkPartType,
    ) -> Result<()> {
        let folder = self.owner_of(c)?;
        let res = self
            .resource_of(c)
            .ok_or_else(|| Status::with_message(StatusCode::IO_ERROR, "chunk is not open"))?;
        with_header_buffer(|hdr| {
            hdr.fill(0);
            ChunkSignature::new(id, version, part_type).serialize(hdr);
            let mut timer = FolderIoTimer::write(&folder, &self.stats, HEADER_SIZE as u64);
            if let Err(e) = res.file.write_all_at(hdr, 0) {
                timer.fail();
                drop(timer);
                self.error_occurred(c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "create: header write error");
                return Err(Status::io(c.filename().display(), &e));
            }
            Ok(())
        })?;
        self.stats.overhead_write(HEADER_SIZE as u64);
        Ok(())
    }

    /// Delete a chunk: unlink the file and erase the registry entry. A
    /// missing file still erases the entry.
    pub fn delete_chunk(&self, id: ChunkId, version: u32, part_type: ChunkPartType) -> Result<()> {
        self.stats.count_op(OpKind::Delete);
        let Some(c) = self.chunk_find(id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        self.delete_locked(c, version)
    }

    pub(crate) fn delete_locked(&self, c: ChunkGuard<'_>, version: u32) -> Result<()> {
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        match std::fs::remove_file(c.filename()) {
            Ok(()) => {
                self.chunk_delete_guard(c);
                Ok(())
            }
            Err(e) => {
                let not_found = e.kind() == std::io::ErrorKind::NotFound;
                self.error_occurred(&c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "delete: unlink error");
                let status = Status::io(c.filename().display(), &e);
                if not_found {
                    self.chunk_delete_guard(c);
                }
                Err(status)
            }
        }
    }

    /// Rewrite the version field of the split-format header (interleaved
    /// chunks have no header) and update the in-memory version.
    pub(crate) fn chunk_overwrite_version(&self, c: &ChunkGuard<'_>, new_version: u32) -> Result<()> {
        if c.format == ChunkFormat::Split {
            let folder = self.owner_of(c)?;
            let res = self
                .resource_of(c)
                .ok_or_else(|| Status::with_message(StatusCode::IO_ERROR, "chunk is not open"))?;
            let buf = new_version.to_be_bytes();
            let mut timer = FolderIoTimer::write(&folder, &self.stats, buf.len() as u64);
            if let Err(e) = res.file.write_all_at(&buf, VERSION_OFFSET) {
                timer.fail();
                drop(timer);
                self.error_occurred(c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "version overwrite error");
                return Err(Status::io(c.filename().display(), &e));
            }
            drop(timer);
            self.stats.overhead_write(buf.len() as u64);
        }
        c.chunk().inner.lock().version = new_version;
        Ok(())
    }

    /// Change a chunk's version: rename the file, then rewrite the header's
    /// version bytes in place.
    pub fn set_chunk_version(
        &self,
        id: ChunkId,
        version: u32,
        new_version: u32,
        part_type: ChunkPartType,
    ) -> Result<()> {
        self.stats.count_op(OpKind::SetVersion);
        let Some(c) = self.chunk_find(id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        self.version_locked(&c, version, new_version)
    }

    pub(crate) fn version_locked(
        &self,
        c: &ChunkGuard<'_>,
        version: u32,
        new_version: u32,
    ) -> Result<()> {
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        let expected = if version > 0 { version } else { c.version() };
        if let Err(e) = c.rename_file(new_version) {
            self.error_occurred(c, Some(&e));
            warn!(file = %c.filename().display(), error = %e, "set version: rename error");
            return Err(Status::io(c.filename().display(), &e));
        }
        self.io_begin(c, false, Some(expected))?;
        if let Err(status) = self.chunk_overwrite_version(c, new_version) {
            let _ = self.io_end(c);
            return Err(status);
        }
        self.io_end(c)
    }

    /// Verify that a standard chunk exists at the given version.
    pub fn check_version(&self, id: ChunkId, version: u32) -> Result<()> {
        let Some(c) = self.chunk_find(id, ChunkPartType::Standard) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        Ok(())
    }

    /// Number of used blocks in a chunk.
    pub fn get_blocks(&self, id: ChunkId, part_type: ChunkPartType, version: u32) -> Result<u16> {
        let Some(c) = self.chunk_find(id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        Ok(c.blocks())
    }

    /// Verify every block's CRC. Returns `CRC_MISMATCH` or an I/O error on
    /// the first bad block.
    pub fn test_chunk_now(&self, id: ChunkId, version: u32, part_type: ChunkPartType) -> Result<()> {
        self.stats.count_op(OpKind::Test);

        let Some(c) = self.chunk_find(id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        if version > 0 && c.version() != version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        self.io_begin(&c, false, None)?;

        let folder = self.owner_of(&c)?;
        let res = self
            .resource_of(&c)
            .ok_or_else(|| Status::with_message(StatusCode::IO_ERROR, "chunk is not open"))?;

        let mut status = Ok(());
        for block in 0..c.blocks() {
            let r = with_block_buffer(|buf| -> Result<()> {
                self.read_block_and_crc_raw(&c, &folder, &res, block, buf)?;
                let stored = u32::from_be_bytes(buf[..4].try_into().unwrap());
                let data = &buf[CRC_SIZE as usize..CRC_SIZE as usize + BLOCK_SIZE as usize];
                if stored != crc32(0, data) {
                    self.error_occurred(&c, None);
                    warn!(file = %c.filename().display(), block, "test: crc error");
                    return make_error(ChunkCode::CRC_MISMATCH);
                }
                self.stats.overhead_read(c.format.disk_block_size() as u64);
                Ok(())
            });
            if r.is_err() {
                status = r;
                break;
            }
        }

        // Tested data should not displace hot cache.
        fadvise(&res.file, 0, 0, POSIX_FADV_DONTNEED);

        if status.is_err() {
            let _ = self.io_end(&c);
            return status;
        }
        self.io_end(&c)
    }

    /// Duplicate `src` into a new chunk `copy_id`, optionally bumping the
    /// source's version first.
    pub fn duplicate_chunk(
        &self,
        src_id: ChunkId,
        src_version: u32,
        new_src_version: u32,
        part_type: ChunkPartType,
        copy_id: ChunkId,
        copy_version: u32,
    ) -> Result<()> {
        self.stats.count_op(OpKind::Duplicate);
        self.dup_impl(
            src_id,
            src_version,
            new_src_version,
            part_type,
            copy_id,
            copy_version,
            None,
        )
    }

    /// Duplicate `src` into `copy_id` truncated (or extended) to `length`
    /// bytes, in a single pass.
    #[allow(clippy::too_many_arguments)]
    pub fn duptrunc_chunk(
        &self,
        src_id: ChunkId,
        src_version: u32,
        new_src_version: u32,
        part_type: ChunkPartType,
        copy_id: ChunkId,
        copy_version: u32,
        length: u32,
    ) -> Result<()> {
        self.stats.count_op(OpKind::Duptrunc);
        if length > CHUNK_SIZE {
            return make_error(ChunkCode::WRONG_SIZE);
        }
        self.dup_impl(
            src_id,
            src_version,
            new_src_version,
            part_type,
            copy_id,
            copy_version,
            Some(length),
        )
    }

    /// Shared duplicate / duptrunc body. `length: None` copies everything.
    #[allow(clippy::too_many_arguments)]
    fn dup_impl(
        &self,
        src_id: ChunkId,
        src_version: u32,
        new_src_version: u32,
        part_type: ChunkPartType,
        copy_id: ChunkId,
        mut copy_version: u32,
        length: Option<u32>,
    ) -> Result<()> {
        let Some(oc) = self.chunk_find(src_id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        if src_version > 0 && oc.version() != src_version {
            return make_error(ChunkCode::WRONG_VERSION);
        }
        if copy_version == 0 {
            copy_version = new_src_version;
        }

        let Some(folder) = self.pick_folder() else {
            return make_error(ChunkCode::NO_SPACE);
        };
        let Some(c) = self.chunk_create(&folder, copy_id, part_type, copy_version, Some(oc.format))
        else {
            return make_error(ChunkCode::CHUNK_EXISTS);
        };
        debug_assert_eq!(c.format, oc.format);

        // Bump the source version first, so a crash mid-copy leaves the
        // source already renamed.
        if new_src_version != src_version {
            if let Err(e) = oc.rename_file(new_src_version) {
                self.error_occurred(&oc, Some(&e));
                warn!(file = %oc.filename().display(), error = %e, "duplicate: rename error");
                self.chunk_delete_guard(c);
                return Err(Status::io(oc.filename().display(), &e));
            }
            let expected = if src_version > 0 { src_version } else { oc.version() };
            if let Err(status) = self.io_begin(&oc, false, Some(expected)) {
                self.chunk_delete_guard(c);
                return Err(status);
            }
            if let Err(status) = self.chunk_overwrite_version(&oc, new_src_version) {
                self.chunk_delete_guard(c);
                let _ = self.io_end(&oc);
                return Err(status);
            }
        } else if let Err(status) = self.io_begin(&oc, false, None) {
            self.chunk_delete_guard(c);
            self.report_damaged_chunk(src_id, part_type);
            return Err(status);
        }

        if let Err(status) = self.io_begin(&c, true, None) {
            self.chunk_delete_guard(c);
            let _ = self.io_end(&oc);
            return Err(status);
        }

        // Both chunks open; run the copy and unwind both on failure.
        let blocks = match self.dup_copy(&oc, &c, copy_id, copy_version, part_type, length) {
            Ok(blocks) => blocks,
            Err((status, src_damaged)) => {
                let _ = self.io_end(&c);
                let _ = std::fs::remove_file(c.filename());
                self.chunk_delete_guard(c);
                let _ = self.io_end(&oc);
                if src_damaged {
                    self.report_damaged_chunk(src_id, part_type);
                }
                return Err(status);
            }
        };

        if let Err(status) = self.io_end(&oc) {
            let _ = self.io_end(&c);
            let _ = std::fs::remove_file(c.filename());
            self.chunk_delete_guard(c);
            self.report_damaged_chunk(src_id, part_type);
            return Err(status);
        }
        if let Err(status) = self.io_end(&c) {
            let _ = std::fs::remove_file(c.filename());
            self.chunk_delete_guard(c);
            return Err(status);
        }

        c.chunk().inner.lock().blocks = blocks;
        if let Ok(f) = self.owner_of(&c) {
            f.need_refresh.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy the data (and CRC metadata) from `oc` to `c`. Returns the
    /// destination's block count; errors carry a flag marking whether the
    /// source should be reported damaged.
    fn dup_copy(
        &self,
        oc: &ChunkGuard<'_>,
        c: &ChunkGuard<'_>,
        copy_id: ChunkId,
        copy_version: u32,
        part_type: ChunkPartType,
        length: Option<u32>,
    ) -> std::result::Result<u16, (Status, bool)> {
        let src_folder = self.owner_of(oc).map_err(|s| (s, false))?;
        let dst_folder = self.owner_of(c).map_err(|s| (s, false))?;
        let src_res = self
            .resource_of(oc)
            .ok_or_else(|| (Status::with_message(StatusCode::IO_ERROR, "source not open"), false))?;
        let dst_res = self
            .resource_of(c)
            .ok_or_else(|| (Status::with_message(StatusCode::IO_ERROR, "copy not open"), false))?;

        let src_blocks = oc.blocks();
        let dst_blocks = match length {
            None => src_blocks,
            Some(len) => len.div_ceil(BLOCK_SIZE) as u16,
        };
        let raw = c.format.disk_block_size() as usize;

        // For split chunks the whole header (signature + CRC table) is
        // staged in scratch and written once.
        let is_split = c.format == ChunkFormat::Split;
        if is_split {
            with_header_buffer(|hdr| {
                hdr.fill(0);
                ChunkSignature::new(copy_id, copy_version, part_type).serialize(hdr);
                let src_table = src_res
                    .crc_table
                    .as_ref()
                    .expect("split chunk has a crc table")
                    .lock();
                hdr[CRC_OFFSET as usize..CRC_OFFSET as usize + src_table.len()]
                    .copy_from_slice(&src_table);
            });
        }

        let copy_block = |b: u16| -> std::result::Result<(), (Status, bool)> {
            with_block_buffer(|buf| {
                {
                    let mut timer = FolderIoTimer::read(&src_folder, &self.stats, raw as u64);
                    if let Err(e) = src_res
                        .file
                        .read_exact_at(&mut buf[..raw], oc.format.block_offset(b))
                    {
                        timer.fail();
                        drop(timer);
                        self.error_occurred(oc, Some(&e));
                        warn!(file = %oc.filename().display(), error = %e, "duplicate: data read error");
                        return Err((Status::io(oc.filename().display(), &e), true));
                    }
                }
                self.stats.overhead_read(raw as u64);
                {
                    let mut timer = FolderIoTimer::write(&dst_folder, &self.stats, raw as u64);
                    if let Err(e) = dst_res
                        .file
                        .write_all_at(&buf[..raw], c.format.block_offset(b))
                    {
                        timer.fail();
                        drop(timer);
                        self.error_occurred(c, Some(&e));
                        warn!(file = %c.filename().display(), error = %e, "duplicate: data write error");
                        return Err((Status::io(c.filename().display(), &e), false));
                    }
                }
                self.stats.overhead_write(raw as u64);
                Ok(())
            })
        };

        match length {
            None => {
                // Plain duplicate: copy every block verbatim.
                for b in 0..src_blocks {
                    copy_block(b)?;
                }
            }
            Some(_) if dst_blocks > src_blocks => {
                // Expanding: copy everything, then extend with implicit zero
                // blocks.
                for b in 0..src_blocks {
                    copy_block(b)?;
                }
                if is_split {
                    with_header_buffer(|hdr| {
                        let empty = crate::empty_block_crc().to_be_bytes();
                        for b in src_blocks..dst_blocks {
                            let i = CRC_OFFSET as usize + b as usize * CRC_SIZE as usize;
                            hdr[i..i + CRC_SIZE as usize].copy_from_slice(&empty);
                        }
                    });
                }
                if let Err(e) = dst_res
                    .file
                    .set_len(c.format.file_size_from_blocks(dst_blocks as u32))
                {
                    self.error_occurred(c, Some(&e));
                    warn!(file = %c.filename().display(), error = %e, "duplicate: ftruncate error");
                    return Err((Status::io(c.filename().display(), &e), false));
                }
            }
            Some(length) => {
                // Shrinking (or equal-size) copy; a misaligned length turns
                // the final block into its zero-padded prefix.
                let last_partial = length % BLOCK_SIZE;
                let full_copies = if last_partial == 0 {
                    dst_blocks
                } else {
                    dst_blocks - 1
                };
                for b in 0..full_copies {
                    copy_block(b)?;
                }
                if last_partial > 0 {
                    self.dup_copy_partial_block(
                        oc,
                        c,
                        &src_folder,
                        &dst_folder,
                        &src_res,
                        &dst_res,
                        dst_blocks - 1,
                        last_partial,
                    )?;
                }
            }
        }

        if is_split {
            // Flush the staged header: refresh the destination's in-memory
            // table from it and write the whole header to disk.
            with_header_buffer(|hdr| -> std::result::Result<(), (Status, bool)> {
                {
                    let mut dst_table = dst_res
                        .crc_table
                        .as_ref()
                        .expect("split chunk has a crc table")
                        .lock();
                    let n = dst_table.len();
                    dst_table.copy_from_slice(&hdr[CRC_OFFSET as usize..CRC_OFFSET as usize + n]);
                }
                let mut timer = FolderIoTimer::write(&dst_folder, &self.stats, HEADER_SIZE as u64);
                if let Err(e) = dst_res.file.write_all_at(hdr, 0) {
                    timer.fail();
                    drop(timer);
                    self.error_occurred(c, Some(&e));
                    warn!(file = %c.filename().display(), error = %e, "duplicate: header write error");
                    return Err((Status::io(c.filename().display(), &e), false));
                }
                drop(timer);
                self.stats.overhead_write(HEADER_SIZE as u64);
                Ok(())
            })?;
        }

        Ok(dst_blocks)
    }

    /// Copy the final, partially-used block of a shrinking duplicate: its
    /// CRC becomes the zero-extended CRC of the surviving bytes.
    #[allow(clippy::too_many_arguments)]
    fn dup_copy_partial_block(
        &self,
        oc: &ChunkGuard<'_>,
        c: &ChunkGuard<'_>,
        src_folder: &std::sync::Arc<crate::folder::Folder>,
        dst_folder: &std::sync::Arc<crate::folder::Folder>,
        src_res: &crate::open_pool::OpenChunk,
        dst_res: &crate::open_pool::OpenChunk,
        block: u16,
        last_partial: u32,
    ) -> std::result::Result<(), (Status, bool)> {
        let crc_len = CRC_SIZE as usize;
        let is_split = c.format == ChunkFormat::Split;
        let to_read = if is_split {
            last_partial as usize
        } else {
            last_partial as usize + crc_len
        };

        with_block_buffer(|buf| {
            {
                let mut timer = FolderIoTimer::read(src_folder, &self.stats, to_read as u64);
                if let Err(e) = src_res
                    .file
                    .read_exact_at(&mut buf[..to_read], oc.format.block_offset(block))
                {
                    timer.fail();
                    drop(timer);
                    self.error_occurred(oc, Some(&e));
                    warn!(file = %oc.filename().display(), error = %e, "duptrunc: data read error");
                    return Err((Status::io(oc.filename().display(), &e), true));
                }
            }
            self.stats.overhead_read(to_read as u64);

            let raw = c.format.disk_block_size() as usize;
            if is_split {
                let crc = crc32_zero_expanded(
                    0,
                    &buf[..last_partial as usize],
                    (BLOCK_SIZE - last_partial) as usize,
                );
                with_header_buffer(|hdr| {
                    let i = CRC_OFFSET as usize + block as usize * crc_len;
                    hdr[i..i + crc_len].copy_from_slice(&crc.to_be_bytes());
                });
                buf[last_partial as usize..BLOCK_SIZE as usize].fill(0);
            } else {
                let crc = crc32_zero_expanded(
                    0,
                    &buf[crc_len..crc_len + last_partial as usize],
                    (BLOCK_SIZE - last_partial) as usize,
                );
                buf[..crc_len].copy_from_slice(&crc.to_be_bytes());
                buf[crc_len + last_partial as usize..raw].fill(0);
            }

            let mut timer = FolderIoTimer::write(dst_folder, &self.stats, raw as u64);
            if let Err(e) = dst_res
                .file
                .write_all_at(&buf[..raw], c.format.block_offset(block))
            {
                timer.fail();
                drop(timer);
                self.error_occurred(c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "duptrunc: data write error");
                return Err((Status::io(c.filename().display(), &e), false));
            }
            drop(timer);
            self.stats.overhead_write(raw as u64);
            Ok(())
        })
    }

    /// Truncate (or extend) a chunk to `length` bytes, bumping its version.
    pub fn truncate_chunk(
        &self,
        id: ChunkId,
        part_type: ChunkPartType,
        old_version: u32,
        new_version: u32,
        length: u32,
    ) -> Result<()> {
        self.stats.count_op(OpKind::Truncate);
        if length > CHUNK_SIZE {
            return make_error(ChunkCode::WRONG_SIZE);
        }
        let Some(c) = self.chunk_find(id, part_type) else {
            return make_error(ChunkCode::NO_CHUNK);
        };
        if old_version > 0 && c.version() != old_version {
            return make_error(ChunkCode::WRONG_VERSION);
        }

        // Step 1: version change.
        let expected = if old_version > 0 { old_version } else { c.version() };
        if let Err(e) = c.rename_file(new_version) {
            self.error_occurred(&c, Some(&e));
            warn!(file = %c.filename().display(), error = %e, "truncate: rename error");
            return Err(Status::io(c.filename().display(), &e));
        }
        self.io_begin(&c, false, Some(expected))?;
        if let Err(status) = self.chunk_overwrite_version(&c, new_version) {
            let _ = self.io_end(&c);
            return Err(status);
        }
        c.chunk().inner.lock().was_changed = true;

        // Step 2: resize.
        if let Err(status) = self.truncate_body(&c, length) {
            let _ = self.io_end(&c);
            return Err(status);
        }

        let blocks = length.div_ceil(BLOCK_SIZE) as u16;
        if c.blocks() != blocks {
            if let Ok(folder) = self.owner_of(&c) {
                folder.need_refresh.store(true, Ordering::Relaxed);
            }
        }
        c.chunk().inner.lock().blocks = blocks;
        self.io_end(&c)
    }

    fn truncate_body(&self, c: &ChunkGuard<'_>, length: u32) -> Result<()> {
        let folder = self.owner_of(c)?;
        let res = self
            .resource_of(c)
            .ok_or_else(|| Status::with_message(StatusCode::IO_ERROR, "chunk is not open"))?;

        let blocks = length.div_ceil(BLOCK_SIZE) as u16;
        let old_blocks = c.blocks();

        let truncate_to = |size: u64| -> Result<()> {
            res.file.set_len(size).map_err(|e| {
                self.error_occurred(c, Some(&e));
                warn!(file = %c.filename().display(), error = %e, "truncate: ftruncate error");
                Status::io(c.filename().display(), &e)
            })
        };

        if blocks > old_blocks {
            // Growing: new blocks are implicit zeros.
            self.fill_crc_gap(c, &res, old_blocks, blocks);
            truncate_to(c.format.file_size_from_blocks(blocks as u32))?;
            return Ok(());
        }

        let full_blocks = (length / BLOCK_SIZE) as u16;
        let last_partial = length - full_blocks as u32 * BLOCK_SIZE;

        if last_partial > 0 {
            // Cut the file at the exact byte length first so the dropped
            // tail of the final block reads back as zeros.
            let mut exact = c.format.file_size_from_blocks(full_blocks as u32) + last_partial as u64;
            if c.format == ChunkFormat::Interleaved {
                exact += CRC_SIZE as u64;
            }
            truncate_to(exact)?;
        }
        truncate_to(c.format.file_size_from_blocks(blocks as u32))?;

        if last_partial > 0 {
            let mut offset = c.format.block_offset(full_blocks);
            if c.format == ChunkFormat::Interleaved {
                offset += CRC_SIZE as u64;
            }
            let crc = with_block_buffer(|buf| -> Result<u32> {
                let mut timer = FolderIoTimer::read(&folder, &self.stats, last_partial as u64);
                if let Err(e) = res
                    .file
                    .read_exact_at(&mut buf[..last_partial as usize], offset)
                {
                    timer.fail();
                    drop(timer);
                    self.error_occurred(c, Some(&e));
                    warn!(file = %c.filename().display(), error = %e, "truncate: read error");
                    return Err(Status::io(c.filename().display(), &e));
                }
                drop(timer);
                self.stats.overhead_read(last_partial as u64);
                Ok(crc32_zero_expanded(
                    0,
                    &buf[..last_partial as usize],
                    (BLOCK_SIZE - last_partial) as usize,
                ))
            })?;

            match c.format {
                ChunkFormat::Split => {
                    let table_mutex = res.crc_table.as_ref().expect("split chunk has a crc table");
                    let mut table = table_mutex.lock();
                    let i = full_blocks as usize * CRC_SIZE as usize;
                    table[i..i + CRC_SIZE as usize].copy_from_slice(&crc.to_be_bytes());
                    let empty = crate::empty_block_crc().to_be_bytes();
                    for b in (full_blocks + 1)..old_blocks {
                        let i = b as usize * CRC_SIZE as usize;
                        table[i..i + CRC_SIZE as usize].copy_from_slice(&empty);
                    }
                }
                ChunkFormat::Interleaved => {
                    let mut timer = FolderIoTimer::write(&folder, &self.stats, CRC_SIZE as u64);
                    if let Err(e) = res
                        .file
                        .write_all_at(&crc.to_be_bytes(), c.format.block_offset(full_blocks))
                    {
                        timer.fail();
                        drop(timer);
                        self.error_occurred(c, Some(&e));
                        warn!(file = %c.filename().display(), error = %e, "truncate: crc write error");
                        self.report_damaged_chunk(c.id, c.part_type);
                        return Err(Status::io(c.filename().display(), &e));
                    }
                }
            }
        }
        Ok(())
    }

    /// All chunk operations in one call, as multiplexed by the master:
    ///
    /// - `new_version > 0, length == 0xFFFFFFFF, copy_id == 0` — set version
    /// - `new_version > 0, length == 0xFFFFFFFF, copy_id > 0` — duplicate
    /// - `new_version > 0, length <= CHUNK_SIZE, copy_id == 0` — truncate
    /// - `new_version > 0, length <= CHUNK_SIZE, copy_id > 0` — duptrunc
    /// - `new_version == 0, length == 0` — delete
    /// - `new_version == 0, length == 1` — create
    /// - `new_version == 0, length == 2` — test
    #[allow(clippy::too_many_arguments)]
    pub fn chunk_op(
        &self,
        id: ChunkId,
        version: u32,
        part_type: ChunkPartType,
        new_version: u32,
        copy_id: ChunkId,
        copy_version: u32,
        length: u32,
    ) -> Result<()> {
        if new_version > 0 {
            if length == 0xFFFF_FFFF {
                if *copy_id == 0 {
                    self.set_chunk_version(id, version, new_version, part_type)
                } else {
                    self.duplicate_chunk(id, version, new_version, part_type, copy_id, copy_version)
                }
            } else if length <= CHUNK_SIZE {
                if *copy_id == 0 {
                    self.truncate_chunk(id, part_type, version, new_version, length)
                } else {
                    self.duptrunc_chunk(
                        id,
                        version,
                        new_version,
                        part_type,
                        copy_id,
                        copy_version,
                        length,
                    )
                }
            } else {
                make_error(StatusCode::INVALID_ARG)
            }
        } else {
            match length {
                0 => self.delete_chunk(id, version, part_type),
                1 => self.create_chunk(id, version, part_type),
                2 => self.test_chunk_now(id, version, part_type),
                _ => make_error(StatusCode::INVALID_ARG),
            }
        }
    }
}
