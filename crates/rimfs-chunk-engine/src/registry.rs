//! Process-wide chunk registry and per-chunk state machine.
//!
//! One mutex guards the whole `(id, type) -> chunk` map together with every
//! entry's state. Threads that need a busy chunk sleep on a condvar slot
//! attached to the entry on demand; slots are recycled through a free list so
//! the number of live condvars is bounded by the number of contended chunks,
//! not by the number of chunks. Slow I/O never runs under the registry lock:
//! locking a chunk (state `Locked`) gives its holder exclusive ownership of
//! the chunk's mutable half until release.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use rimfs_types::ChunkId;

use crate::chunk::{
    chunk_file_path, Chunk, ChunkFormat, ChunkKey, ChunkPartType, ChunkState, DirectoryLayout,
};
use crate::engine::HddEngine;
use crate::folder::Folder;
use crate::reports::{combine_version_with_todel, ChunkWithType, ChunkWithVersionAndType};

/// How `chunk_get` treats a missing or busy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireMode {
    /// Plain lookup; missing chunks stay missing.
    None,
    /// Create the entry if absent (scanner registration).
    Auto,
    /// Create the entry, failing if a live chunk already occupies the key.
    Exclusive,
}

#[derive(Default, Debug)]
pub(crate) struct CondSlot {
    pub cond: Condvar,
    pub waiters: AtomicU32,
}

#[derive(Debug)]
pub(crate) struct ChunkEntry {
    pub chunk: Arc<Chunk>,
    pub state: ChunkState,
    pub cond: Option<Arc<CondSlot>>,
}

/// Registry payload behind the engine's registry mutex.
#[derive(Default, Debug)]
pub(crate) struct Registry {
    pub map: std::collections::HashMap<ChunkKey, ChunkEntry>,
    pub free_conds: Vec<Arc<CondSlot>>,
}

/// RAII handle to a chunk in the `Locked` state. Dropping it releases the
/// chunk (waking one waiter); consuming operations dismiss it instead.
pub struct ChunkGuard<'e> {
    engine: &'e HddEngine,
    chunk: Arc<Chunk>,
    armed: bool,
}

impl<'e> ChunkGuard<'e> {
    pub(crate) fn new(engine: &'e HddEngine, chunk: Arc<Chunk>) -> Self {
        Self {
            engine,
            chunk,
            armed: true,
        }
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Give up the guard without releasing the chunk.
    pub(crate) fn dismiss(mut self) -> Arc<Chunk> {
        self.armed = false;
        Arc::clone(&self.chunk)
    }
}

impl std::ops::Deref for ChunkGuard<'_> {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.chunk_release(&self.chunk);
        }
    }
}

impl HddEngine {
    /// Look up a chunk without creating it; `None` means not found.
    pub(crate) fn chunk_find(&self, id: ChunkId, part_type: ChunkPartType) -> Option<ChunkGuard<'_>> {
        self.chunk_get(id, part_type, AcquireMode::None, None)
    }

    /// The acquire operation of the chunk state machine.
    pub(crate) fn chunk_get(
        &self,
        id: ChunkId,
        part_type: ChunkPartType,
        mode: AcquireMode,
        format: Option<ChunkFormat>,
    ) -> Option<ChunkGuard<'_>> {
        let key = ChunkKey::new(id, part_type);
        let mut reg = self.registry.lock();

        if !reg.map.contains_key(&key) {
            if mode == AcquireMode::None {
                return None;
            }
            let chunk = self.chunk_recreate_locked(&mut reg, None, key, self.resolve_format(format));
            return Some(ChunkGuard::new(self, chunk));
        }

        if mode == AcquireMode::Exclusive {
            let state = reg.map.get(&key).unwrap().state;
            if state == ChunkState::Avail || state == ChunkState::Locked {
                return None;
            }
        }

        loop {
            let Some(state) = reg.map.get(&key).map(|e| e.state) else {
                // The entry vanished while we were waiting.
                if mode == AcquireMode::None {
                    return None;
                }
                let chunk =
                    self.chunk_recreate_locked(&mut reg, None, key, self.resolve_format(format));
                return Some(ChunkGuard::new(self, chunk));
            };
            match state {
                ChunkState::Avail => {
                    let chunk = {
                        let entry = reg.map.get_mut(&key).unwrap();
                        entry.state = ChunkState::Locked;
                        Arc::clone(&entry.chunk)
                    };
                    drop(reg);

                    let guard = ChunkGuard::new(self, chunk);
                    if !guard.chunk().inner.lock().validattr && !self.chunk_getattr(&guard) {
                        // File missing or size-invalid.
                        let filename = guard.filename();
                        if mode != AcquireMode::None {
                            let _ = std::fs::remove_file(&filename);
                            let mut reg = self.registry.lock();
                            let old = guard.dismiss();
                            let chunk = self.chunk_recreate_locked(
                                &mut reg,
                                Some(old),
                                key,
                                self.resolve_format(format),
                            );
                            return Some(ChunkGuard::new(self, chunk));
                        }
                        self.report_damaged_chunk(id, part_type);
                        let _ = std::fs::remove_file(&filename);
                        self.chunk_delete_guard(guard);
                        return None;
                    }
                    return Some(guard);
                }
                ChunkState::Deleted => {
                    if mode != AcquireMode::None {
                        let old = Arc::clone(&reg.map.get(&key).unwrap().chunk);
                        let chunk = self.chunk_recreate_locked(
                            &mut reg,
                            Some(old),
                            key,
                            self.resolve_format(format),
                        );
                        return Some(ChunkGuard::new(self, chunk));
                    }
                    let has_waiters = reg.map.get(&key).unwrap().cond.is_some();
                    if has_waiters {
                        // Hand the deleted entry to one of the waiters.
                        if let Some(cond) = &reg.map.get(&key).unwrap().cond {
                            cond.cond.notify_one();
                        }
                    } else {
                        self.chunk_remove_locked(&mut reg, key);
                    }
                    return None;
                }
                ChunkState::Locked | ChunkState::ToBeDeleted => {
                    let slot = {
                        let existing = reg.map.get(&key).unwrap().cond.clone();
                        match existing {
                            Some(s) => s,
                            None => {
                                let s = reg
                                    .free_conds
                                    .pop()
                                    .unwrap_or_else(|| Arc::new(CondSlot::default()));
                                reg.map.get_mut(&key).unwrap().cond = Some(Arc::clone(&s));
                                s
                            }
                        }
                    };
                    slot.waiters.fetch_add(1, Ordering::Relaxed);
                    slot.cond.wait(&mut reg);
                    let remaining = slot.waiters.fetch_sub(1, Ordering::Relaxed) - 1;
                    if remaining == 0 {
                        // Last waiter detaches the slot for reuse.
                        if let Some(entry) = reg.map.get_mut(&key) {
                            if entry.cond.as_ref().is_some_and(|c| Arc::ptr_eq(c, &slot)) {
                                entry.cond = None;
                            }
                        }
                        reg.free_conds.push(slot);
                    }
                }
            }
        }
    }

    /// Release a locked chunk, waking one waiter. `ToBeDeleted` chunks move
    /// to `Deleted` (if anyone waits) or are erased.
    pub(crate) fn chunk_release(&self, chunk: &Arc<Chunk>) {
        let key = chunk.key();
        let mut reg = self.registry.lock();
        let state = match reg.map.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.chunk, chunk) => entry.state,
            _ => return,
        };
        match state {
            ChunkState::Locked => {
                let entry = reg.map.get_mut(&key).unwrap();
                entry.state = ChunkState::Avail;
                if let Some(cond) = &entry.cond {
                    cond.cond.notify_one();
                }
            }
            ChunkState::ToBeDeleted => {
                let has_waiters = {
                    let entry = reg.map.get_mut(&key).unwrap();
                    if let Some(cond) = &entry.cond {
                        entry.state = ChunkState::Deleted;
                        cond.cond.notify_one();
                        true
                    } else {
                        false
                    }
                };
                if !has_waiters {
                    self.chunk_remove_locked(&mut reg, key);
                }
            }
            _ => {}
        }
    }

    /// Force a locked chunk out of the registry: waiters (if any) observe
    /// `Deleted`, otherwise the entry is erased at once.
    pub(crate) fn chunk_delete_guard(&self, guard: ChunkGuard<'_>) {
        let chunk = guard.dismiss();
        let key = chunk.key();
        let folder = chunk.owner();
        {
            let mut reg = self.registry.lock();
            let matches = reg
                .map
                .get(&key)
                .is_some_and(|entry| Arc::ptr_eq(&entry.chunk, &chunk));
            if matches {
                let has_waiters = {
                    let entry = reg.map.get_mut(&key).unwrap();
                    if let Some(cond) = &entry.cond {
                        entry.state = ChunkState::Deleted;
                        cond.cond.notify_one();
                        true
                    } else {
                        false
                    }
                };
                if !has_waiters {
                    self.chunk_remove_locked(&mut reg, key);
                }
            }
        }
        if let Some(folder) = folder {
            folder.need_refresh.store(true, Ordering::Relaxed);
        }
    }

    /// Erase an entry: purge its descriptor and drop it from its folder's
    /// test set. Caller holds the registry lock.
    pub(crate) fn chunk_remove_locked(&self, reg: &mut Registry, key: ChunkKey) {
        let Some(entry) = reg.map.remove(&key) else {
            warn!(chunk_id = %key.id, part_type = %key.part_type,
                  "chunk to be removed was not found in the registry");
            return;
        };
        let fd = entry.chunk.inner.lock().fd;
        if let Some(handle) = fd {
            self.pool.purge(handle);
        }
        if let Some(folder) = entry.chunk.owner() {
            folder.chunks.lock().remove(&key);
        }
    }

    /// Replace (or create) the entry under `key` with a fresh `Locked` chunk
    /// of the requested format, preserving any waiter slot. Caller holds the
    /// registry lock.
    pub(crate) fn chunk_recreate_locked(
        &self,
        reg: &mut Registry,
        old: Option<Arc<Chunk>>,
        key: ChunkKey,
        format: ChunkFormat,
    ) -> Arc<Chunk> {
        let mut preserved_cond = None;
        if let Some(old) = old {
            let state = reg.map.get(&key).map(|e| e.state);
            if state != Some(ChunkState::Deleted) {
                if let Some(folder) = old.owner() {
                    folder.chunks.lock().remove(&key);
                    folder.need_refresh.store(true, Ordering::Relaxed);
                }
            }
            if let Some(entry) = reg.map.get_mut(&key) {
                preserved_cond = entry.cond.take();
            }
            self.chunk_remove_locked(reg, key);
        }

        let chunk = Arc::new(Chunk::new(key.id, key.part_type, format));
        reg.map.insert(
            key,
            ChunkEntry {
                chunk: Arc::clone(&chunk),
                state: ChunkState::Locked,
                cond: preserved_cond,
            },
        );
        chunk
    }

    /// Create a new chunk on `folder`. Returns `None` when a live chunk
    /// already occupies the key.
    pub(crate) fn chunk_create(
        &self,
        folder: &Arc<Folder>,
        id: ChunkId,
        part_type: ChunkPartType,
        version: u32,
        format: Option<ChunkFormat>,
    ) -> Option<ChunkGuard<'_>> {
        let guard = self.chunk_get(id, part_type, AcquireMode::Exclusive, format)?;
        {
            let mut inner = guard.chunk().inner.lock();
            inner.version = version;
            inner.owner = Arc::downgrade(folder);
            inner.layout = DirectoryLayout::Current;
            inner.filename = chunk_file_path(
                &folder.path,
                DirectoryLayout::Current,
                id,
                version,
                part_type,
                guard.format,
            );
        }
        folder.need_refresh.store(true, Ordering::Relaxed);
        folder.chunks.lock().insert(guard.key());
        Some(guard)
    }

    /// Lazily validate a chunk's on-disk attributes (regular file, size
    /// consistent with the format), filling in the block count.
    pub(crate) fn chunk_getattr(&self, guard: &ChunkGuard<'_>) -> bool {
        let filename = guard.filename();
        let Ok(md) = std::fs::metadata(&filename) else {
            return false;
        };
        if !md.is_file() {
            return false;
        }
        let Some(blocks) = guard.format.block_count_from_file_size(md.len()) else {
            return false;
        };
        let mut inner = guard.chunk().inner.lock();
        inner.blocks = blocks;
        inner.validattr = true;
        true
    }

    pub(crate) fn resolve_format(&self, format: Option<ChunkFormat>) -> ChunkFormat {
        format.unwrap_or_else(|| {
            if self.split_format.load(Ordering::Relaxed) {
                ChunkFormat::Split
            } else {
                ChunkFormat::Interleaved
            }
        })
    }

    /// Feed every registered chunk to `callback` in bulks of `bulk_size`.
    ///
    /// Available chunks are collected in one pass under the registry lock;
    /// busy ones are deferred and acquired individually afterwards, so the
    /// enumeration never blocks on in-flight I/O while holding the lock.
    pub fn for_each_chunk_in_bulks<F>(&self, mut callback: F, bulk_size: usize)
    where
        F: FnMut(&mut Vec<ChunkWithVersionAndType>),
    {
        let mut bulk: Vec<ChunkWithVersionAndType> = Vec::with_capacity(bulk_size);
        let mut recheck: Vec<ChunkWithType> = Vec::new();

        let describe = |chunk: &Arc<Chunk>| {
            let todel = chunk
                .owner()
                .map(|f| f.is_marked_for_deletion())
                .unwrap_or(false);
            ChunkWithVersionAndType {
                id: chunk.id,
                version: combine_version_with_todel(chunk.version(), todel),
                part_type: chunk.part_type,
            }
        };

        {
            let reg = self.registry.lock();
            for (key, entry) in reg.map.iter() {
                if entry.state != ChunkState::Avail {
                    recheck.push(ChunkWithType {
                        id: key.id,
                        part_type: key.part_type,
                    });
                    continue;
                }
                if bulk.len() >= bulk_size {
                    callback(&mut bulk);
                    bulk.clear();
                }
                bulk.push(describe(&entry.chunk));
            }
        }
        if !bulk.is_empty() {
            callback(&mut bulk);
            bulk.clear();
        }

        for item in recheck {
            if bulk.len() >= bulk_size {
                callback(&mut bulk);
                bulk.clear();
            }
            if let Some(guard) = self.chunk_find(item.id, item.part_type) {
                bulk.push(describe(guard.chunk()));
            }
        }
        if !bulk.is_empty() {
            callback(&mut bulk);
        }
    }

    /// Number of chunks currently registered.
    pub fn chunk_count(&self) -> usize {
        self.registry.lock().map.len()
    }
}
