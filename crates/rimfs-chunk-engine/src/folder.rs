//! Data folders: mounted directory trees holding chunks.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::chunk::ChunkKey;
use crate::stats::{CurrentFolderStat, HddStatistics};
use crate::{LAST_ERROR_SIZE, STATS_HISTORY};

/// Scan lifecycle of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanState {
    /// Scan thread should be started.
    Needed,
    InProgress,
    /// Scan thread should terminate as soon as possible.
    Terminate,
    ThreadFinished,
    /// Folder already scanned; chunk inventory must be resent to the master.
    SendNeeded,
    Working,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MigrateState {
    Done,
    InProgress,
    Terminate,
    ThreadFinished,
}

/// One entry of the last-errors ring.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChunkError {
    pub chunk_id: u64,
    pub errno: i32,
    pub timestamp: u64,
}

/// The advisory-locked `.lock` file kept open for the folder's lifetime.
#[derive(Debug)]
pub(crate) struct FolderLockFile {
    #[allow(dead_code)]
    pub file: File,
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug)]
pub(crate) struct FolderInner {
    pub scan_state: ScanState,
    pub migrate_state: MigrateState,
    pub scan_thread: Option<JoinHandle<()>>,
    pub migrate_thread: Option<JoinHandle<()>>,
    pub total_space: u64,
    pub available_space: u64,
    pub leave_free_space: u64,
    /// Placement weight; see the carry algorithm in the engine.
    pub carry: f64,
    pub last_refresh: u64,
    pub stats: Box<[HddStatistics]>,
    pub stats_pos: usize,
    pub last_errors: [ChunkError; LAST_ERROR_SIZE],
    pub last_error_index: usize,
    pub lock: Option<FolderLockFile>,
}

/// A data folder.
#[derive(Debug)]
pub struct Folder {
    pub path: PathBuf,
    pub(crate) is_damaged: AtomicBool,
    pub(crate) is_read_only: AtomicBool,
    pub(crate) is_marked_for_removal: AtomicBool,
    pub(crate) was_removed_from_config: AtomicBool,
    pub(crate) need_refresh: AtomicBool,
    pub(crate) scan_progress: AtomicU8,
    pub(crate) current_stat: CurrentFolderStat,
    pub(crate) inner: Mutex<FolderInner>,
    pub(crate) chunks: Mutex<FolderChunkSet>,
}

impl Folder {
    pub(crate) fn new(path: PathBuf, marked_for_removal: bool) -> Self {
        Self {
            path,
            is_damaged: AtomicBool::new(false),
            is_read_only: AtomicBool::new(false),
            is_marked_for_removal: AtomicBool::new(marked_for_removal),
            was_removed_from_config: AtomicBool::new(false),
            need_refresh: AtomicBool::new(true),
            scan_progress: AtomicU8::new(0),
            current_stat: CurrentFolderStat::default(),
            inner: Mutex::new(FolderInner {
                scan_state: ScanState::Needed,
                migrate_state: MigrateState::Done,
                scan_thread: None,
                migrate_thread: None,
                total_space: 0,
                available_space: 0,
                leave_free_space: 0,
                carry: rand::random::<f64>(),
                last_refresh: 0,
                stats: vec![HddStatistics::default(); STATS_HISTORY].into_boxed_slice(),
                stats_pos: 0,
                last_errors: [ChunkError::default(); LAST_ERROR_SIZE],
                last_error_index: 0,
                lock: None,
            }),
            chunks: Mutex::new(FolderChunkSet::default()),
        }
    }

    pub fn is_damaged(&self) -> bool {
        self.is_damaged.load(Ordering::Relaxed)
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only.load(Ordering::Relaxed)
    }

    /// Chunks on this folder are on their way out: the folder is being
    /// drained or cannot accept writes.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.is_marked_for_removal.load(Ordering::Relaxed) || self.is_read_only()
    }

    pub(crate) fn is_selectable_for_new_chunk(&self, inner: &FolderInner) -> bool {
        !self.is_damaged()
            && !self.is_marked_for_deletion()
            && !self.was_removed_from_config.load(Ordering::Relaxed)
            && inner.scan_state == ScanState::Working
            && inner.total_space > 0
            && inner.available_space > 0
    }

    /// Re-read filesystem usage. `available_space` is clamped by the
    /// reserved `leave_free_space`.
    pub(crate) fn refresh_usage(&self, inner: &mut FolderInner) {
        use std::os::unix::ffi::OsStrExt;

        let cpath = match std::ffi::CString::new(self.path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => {
                inner.available_space = 0;
                inner.total_space = 0;
                return;
            }
        };
        let mut fsinfo: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut fsinfo) };
        if rc < 0 {
            inner.available_space = 0;
            inner.total_space = 0;
            return;
        }
        let frsize = fsinfo.f_frsize as u64;
        inner.available_space = frsize * fsinfo.f_bavail as u64;
        inner.total_space = frsize * (fsinfo.f_blocks as u64
            - (fsinfo.f_bfree as u64 - fsinfo.f_bavail as u64));
        if inner.available_space < inner.leave_free_space {
            inner.available_space = 0;
        } else {
            inner.available_space -= inner.leave_free_space;
        }
    }

    /// Record an I/O error against this folder's error ring.
    pub(crate) fn record_error(&self, chunk_id: u64, errno: i32, timestamp: u64) {
        let mut inner = self.inner.lock();
        let i = inner.last_error_index;
        inner.last_errors[i] = ChunkError {
            chunk_id,
            errno,
            timestamp,
        };
        inner.last_error_index = (i + 1) % LAST_ERROR_SIZE;
    }
}

/// A folder's chunk membership, ordered by last-tested time.
///
/// The order queue may contain stale entries; each member's current sequence
/// number in `members` identifies the live one. This keeps mark-as-tested
/// O(1) at the cost of lazy cleanup in `next_to_test`.
#[derive(Default, Debug)]
pub(crate) struct FolderChunkSet {
    seq: u64,
    order: VecDeque<(u64, ChunkKey)>,
    members: HashMap<ChunkKey, u64>,
}

impl FolderChunkSet {
    pub fn insert(&mut self, key: ChunkKey) {
        self.seq += 1;
        let seq = self.seq;
        self.members.insert(key, seq);
        self.order.push_back((seq, key));
    }

    pub fn remove(&mut self, key: &ChunkKey) {
        self.members.remove(key);
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.members.contains_key(key)
    }

    /// Move a chunk to the recently-tested end.
    pub fn mark_as_tested(&mut self, key: ChunkKey) {
        if let Some(slot) = self.members.get_mut(&key) {
            self.seq += 1;
            *slot = self.seq;
            self.order.push_back((self.seq, key));
        }
    }

    /// The member tested longest ago, if any.
    pub fn next_to_test(&mut self) -> Option<ChunkKey> {
        while let Some(&(seq, key)) = self.order.front() {
            if self.members.get(&key) == Some(&seq) {
                return Some(key);
            }
            self.order.pop_front();
        }
        None
    }

    /// Randomize the test order (applied after a scan so the scrubber does
    /// not walk chunks in directory order).
    pub fn shuffle(&mut self) {
        let mut keys: Vec<ChunkKey> = self.members.keys().copied().collect();
        keys.shuffle(&mut rand::thread_rng());
        self.order.clear();
        self.members.clear();
        self.seq = 0;
        for key in keys {
            self.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPartType;
    use rimfs_types::ChunkId;

    fn key(id: u64) -> ChunkKey {
        ChunkKey::new(ChunkId(id), ChunkPartType::Standard)
    }

    #[test]
    fn test_chunk_set_insert_remove() {
        let mut set = FolderChunkSet::default();
        set.insert(key(1));
        set.insert(key(2));
        assert_eq!(set.len(), 2);
        assert!(set.contains(&key(1)));
        set.remove(&key(1));
        assert_eq!(set.len(), 1);
        assert!(!set.contains(&key(1)));
    }

    #[test]
    fn test_next_to_test_is_oldest() {
        let mut set = FolderChunkSet::default();
        set.insert(key(1));
        set.insert(key(2));
        set.insert(key(3));
        assert_eq!(set.next_to_test(), Some(key(1)));

        // Testing 1 rotates it to the back.
        set.mark_as_tested(key(1));
        assert_eq!(set.next_to_test(), Some(key(2)));
        set.mark_as_tested(key(2));
        set.mark_as_tested(key(3));
        assert_eq!(set.next_to_test(), Some(key(1)));
    }

    #[test]
    fn test_next_to_test_skips_removed() {
        let mut set = FolderChunkSet::default();
        set.insert(key(1));
        set.insert(key(2));
        set.remove(&key(1));
        assert_eq!(set.next_to_test(), Some(key(2)));
    }

    #[test]
    fn test_empty_set() {
        let mut set = FolderChunkSet::default();
        assert_eq!(set.next_to_test(), None);
        set.mark_as_tested(key(9)); // not a member; ignored
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_shuffle_preserves_members() {
        let mut set = FolderChunkSet::default();
        for i in 0..100 {
            set.insert(key(i));
        }
        set.shuffle();
        assert_eq!(set.len(), 100);
        for i in 0..100 {
            assert!(set.contains(&key(i)));
        }
    }

    #[test]
    fn test_error_ring_wraps() {
        let folder = Folder::new(PathBuf::from("/nonexistent"), false);
        for i in 0..(LAST_ERROR_SIZE as u64 + 5) {
            folder.record_error(i, libc::EIO, 1000 + i);
        }
        let inner = folder.inner.lock();
        assert_eq!(inner.last_error_index, 5);
        // The newest entry sits just before the index.
        let newest = inner.last_errors[(inner.last_error_index + LAST_ERROR_SIZE - 1) % LAST_ERROR_SIZE];
        assert_eq!(newest.chunk_id, LAST_ERROR_SIZE as u64 + 4);
    }
}
