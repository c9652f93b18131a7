//! Bounded cache of open chunk descriptors.
//!
//! Every open chunk file is owned by the pool; the chunk itself only stores a
//! [`PoolHandle`]. When the last I/O on a chunk ends the resource goes onto
//! an idle list stamped with the release time, where it survives until aged
//! out by `free_unused` (or purged when the chunk is erased). Handles carry a
//! generation counter so a stale handle can never resurrect a reused slot.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::chunk::{Chunk, ChunkFormat};

/// Idle descriptors older than this are eligible for normal eviction.
pub(crate) const IDLE_AGE_USEC: u64 = 4_000_000;

/// Key of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHandle {
    slot: usize,
    gen: u64,
}

/// An open chunk file plus, for split chunks, the in-memory CRC table
/// (raw big-endian bytes, one 4-byte entry per block).
#[derive(Debug)]
pub struct OpenChunk {
    pub file: File,
    pub crc_table: Option<Mutex<Vec<u8>>>,
    pub(crate) chunk: Weak<Chunk>,
}

impl OpenChunk {
    pub(crate) fn new(file: File, chunk: &Arc<Chunk>) -> Self {
        let crc_table = match chunk.format {
            ChunkFormat::Split => Some(Mutex::new(vec![0u8; chunk.format.crc_table_size()])),
            ChunkFormat::Interleaved => None,
        };
        Self {
            file,
            crc_table,
            chunk: Arc::downgrade(chunk),
        }
    }
}

#[derive(Debug)]
struct Slot {
    gen: u64,
    entry: Option<Entry>,
}

#[derive(Debug)]
struct Entry {
    resource: Arc<OpenChunk>,
    in_use: bool,
}

#[derive(Debug)]
struct IdleRef {
    slot: usize,
    gen: u64,
    since_usec: u64,
}

#[derive(Default, Debug)]
struct PoolInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    idle: VecDeque<IdleRef>,
}

/// Process-wide pool of open chunk descriptors.
#[derive(Default, Debug)]
pub struct OpenChunkPool {
    inner: Mutex<PoolInner>,
}

impl OpenChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened resource; it starts in-use.
    pub fn insert(&self, resource: OpenChunk) -> PoolHandle {
        let mut inner = self.inner.lock();
        let entry = Entry {
            resource: Arc::new(resource),
            in_use: true,
        };
        match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot].gen += 1;
                let gen = inner.slots[slot].gen;
                inner.slots[slot].entry = Some(entry);
                PoolHandle { slot, gen }
            }
            None => {
                let slot = inner.slots.len();
                inner.slots.push(Slot {
                    gen: 0,
                    entry: Some(entry),
                });
                PoolHandle { slot, gen: 0 }
            }
        }
    }

    /// Pin a cached resource for use. Returns `None` when the handle is
    /// stale (the resource was evicted or purged in the meantime).
    pub fn acquire(&self, handle: PoolHandle) -> Option<Arc<OpenChunk>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(handle.slot)?;
        if slot.gen != handle.gen {
            return None;
        }
        let entry = slot.entry.as_mut()?;
        entry.in_use = true;
        Some(Arc::clone(&entry.resource))
    }

    /// Borrow a resource without changing its in-use state.
    pub fn get(&self, handle: PoolHandle) -> Option<Arc<OpenChunk>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle.slot)?;
        if slot.gen != handle.gen {
            return None;
        }
        slot.entry.as_ref().map(|e| Arc::clone(&e.resource))
    }

    /// Return a resource to the idle list, stamped with `now_usec`.
    pub fn release(&self, handle: PoolHandle, now_usec: u64) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(handle.slot) else {
            return;
        };
        if slot.gen != handle.gen {
            return;
        }
        if let Some(entry) = slot.entry.as_mut() {
            entry.in_use = false;
            inner.idle.push_back(IdleRef {
                slot: handle.slot,
                gen: handle.gen,
                since_usec: now_usec,
            });
        }
    }

    /// Drop a resource immediately (chunk erase). Clears the owning chunk's
    /// handle.
    pub fn purge(&self, handle: PoolHandle) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.slots.get_mut(handle.slot) {
                Some(slot) if slot.gen == handle.gen => {
                    let entry = slot.entry.take();
                    if entry.is_some() {
                        inner.free.push(handle.slot);
                    }
                    entry
                }
                _ => None,
            }
        };
        if let Some(entry) = removed {
            clear_chunk_handle(&entry.resource, handle);
        }
    }

    /// Evict idle resources. Entries released before `older_than_usec -
    /// IDLE_AGE_USEC` qualify (pass `u64::MAX` to force), at most `max` of
    /// them. Returns the number evicted.
    pub fn free_unused(&self, older_than_usec: u64, max: usize) -> usize {
        let mut evicted: Vec<(Arc<OpenChunk>, PoolHandle)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            while evicted.len() < max {
                let qualifies = match inner.idle.front() {
                    Some(idle) => idle.since_usec.saturating_add(IDLE_AGE_USEC) <= older_than_usec,
                    None => false,
                };
                if !qualifies {
                    break;
                }
                let idle = inner.idle.pop_front().unwrap();
                let slot = &mut inner.slots[idle.slot];
                // Skip stale idle refs: slot reused or resource re-pinned.
                if slot.gen != idle.gen {
                    continue;
                }
                let still_idle = slot.entry.as_ref().is_some_and(|e| !e.in_use);
                if !still_idle {
                    continue;
                }
                let entry = slot.entry.take().unwrap();
                inner.free.push(idle.slot);
                evicted.push((
                    entry.resource,
                    PoolHandle {
                        slot: idle.slot,
                        gen: idle.gen,
                    },
                ));
            }
        }
        let count = evicted.len();
        for (resource, handle) in evicted {
            clear_chunk_handle(&resource, handle);
        }
        count
    }

    /// Number of live resources (in use or idle).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Detach the evicted resource from its chunk, unless the chunk has already
/// been reopened under a fresh handle.
fn clear_chunk_handle(resource: &Arc<OpenChunk>, handle: PoolHandle) {
    if let Some(chunk) = resource.chunk.upgrade() {
        let mut inner = chunk.inner.lock();
        if inner.fd == Some(handle) {
            inner.fd = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPartType;
    use rimfs_types::ChunkId;

    fn test_chunk(format: ChunkFormat) -> Arc<Chunk> {
        Arc::new(Chunk::new(ChunkId(1), ChunkPartType::Standard, format))
    }

    fn open_tmp() -> File {
        tempfile::tempfile().unwrap()
    }

    #[test]
    fn test_insert_acquire_release() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        chunk.inner.lock().fd = Some(h);

        assert!(pool.acquire(h).is_some());
        pool.release(h, 100);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_split_chunks_get_crc_table() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Split);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        let res = pool.get(h).unwrap();
        let table = res.crc_table.as_ref().unwrap().lock();
        assert_eq!(table.len(), 4096);
    }

    #[test]
    fn test_free_unused_respects_age() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        chunk.inner.lock().fd = Some(h);
        pool.release(h, 0);

        // Too young at t=0.
        assert_eq!(pool.free_unused(0, usize::MAX), 0);
        // Old enough once the idle age has passed.
        assert_eq!(pool.free_unused(IDLE_AGE_USEC, usize::MAX), 1);
        assert!(pool.is_empty());
        assert_eq!(chunk.inner.lock().fd, None);
    }

    #[test]
    fn test_forced_free_unused() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        pool.release(h, 1_000_000);
        assert_eq!(pool.free_unused(u64::MAX, usize::MAX), 1);
    }

    #[test]
    fn test_reacquired_resource_not_evicted() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        pool.release(h, 0);
        // Pin it again; the stale idle ref must be skipped.
        assert!(pool.acquire(h).is_some());
        assert_eq!(pool.free_unused(u64::MAX, usize::MAX), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_purge_invalidates_handle() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        chunk.inner.lock().fd = Some(h);
        pool.purge(h);
        assert!(pool.acquire(h).is_none());
        assert_eq!(chunk.inner.lock().fd, None);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let pool = OpenChunkPool::new();
        let chunk = test_chunk(ChunkFormat::Interleaved);
        let h1 = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        pool.purge(h1);
        // Slot gets reused with a bumped generation.
        let h2 = pool.insert(OpenChunk::new(open_tmp(), &chunk));
        assert!(pool.acquire(h1).is_none());
        assert!(pool.acquire(h2).is_some());
    }
}
