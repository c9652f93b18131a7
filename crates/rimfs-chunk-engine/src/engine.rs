//! The engine object: owns the registry, folders, descriptor pool, report
//! queues and background threads.
//!
//! Lock ordering (take in this order when more than one is needed):
//! folder list -> per-folder inner -> registry -> per-folder chunk set ->
//! report queues -> descriptor pool -> per-chunk inner. Slow I/O runs with
//! none of these held.

use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, warn};

use rimfs_config::HddConfig;
use rimfs_types::{make_error_msg, usec_now, wall_time_secs, Result, StatusCode};
use rimfs_utils::UniqueQueue;

use crate::chunk::ChunkState;
use crate::folder::{Folder, FolderLockFile, MigrateState, ScanState};
use crate::open_pool::OpenChunkPool;
use crate::registry::Registry;
use crate::reports::MasterReports;
use crate::stats::EngineStats;
use crate::tester::ChunkTestRequest;
use crate::{scan, tester, ERROR_LIMIT, LAST_ERROR_TIME_SECS};

const USAGE_REFRESH_SECS: u64 = 60;
const FREE_RESOURCES_PERIOD_SECS: u64 = 2;
const FREE_RESOURCES_MAX: usize = 1024;

#[derive(Debug)]
pub(crate) struct FolderList {
    pub list: Vec<Arc<Folder>>,
    /// Folder state machines run only while this is set; cleared during a
    /// config re-read so a reload sees a quiescent folder list.
    pub actions: bool,
}

/// Aggregate space/chunk counters reported to the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub used_space: u64,
    pub total_space: u64,
    pub chunk_count: u32,
    pub to_delete_used_space: u64,
    pub to_delete_total_space: u64,
    pub to_delete_chunk_count: u32,
}

/// The chunk-storage engine.
#[derive(Debug)]
pub struct HddEngine {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) pool: OpenChunkPool,
    pub(crate) folders: Mutex<FolderList>,
    pub(crate) reports: Mutex<MasterReports>,
    pub(crate) stats: EngineStats,
    pub(crate) test_queue: UniqueQueue<ChunkTestRequest>,

    pub(crate) term: AtomicBool,
    pub(crate) tester_reset: AtomicBool,
    pub(crate) space_changed: AtomicBool,
    pub(crate) error_counter: AtomicU32,
    pub(crate) scans_in_progress: AtomicI32,

    // Config-derived runtime options.
    pub(crate) test_freq_ms: AtomicU32,
    pub(crate) advise_no_cache: AtomicBool,
    pub(crate) perform_fsync: AtomicBool,
    pub(crate) punch_holes: AtomicBool,
    pub(crate) split_format: AtomicBool,
    pub(crate) leave_free: AtomicU64,
    hdd_conf: Mutex<PathBuf>,

    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    self_ref: OnceLock<Weak<HddEngine>>,
}

impl HddEngine {
    /// Build an engine from the configuration and register the data folders
    /// from the folder-list file. Scanning starts with [`start`](Self::start).
    pub fn new(config: &HddConfig) -> Result<Arc<Self>> {
        let engine = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            pool: OpenChunkPool::new(),
            folders: Mutex::new(FolderList {
                list: Vec::new(),
                actions: false,
            }),
            reports: Mutex::new(MasterReports::default()),
            stats: EngineStats::default(),
            test_queue: UniqueQueue::new(),
            term: AtomicBool::new(false),
            tester_reset: AtomicBool::new(false),
            space_changed: AtomicBool::new(false),
            error_counter: AtomicU32::new(0),
            scans_in_progress: AtomicI32::new(0),
            test_freq_ms: AtomicU32::new(10_000),
            advise_no_cache: AtomicBool::new(false),
            perform_fsync: AtomicBool::new(true),
            punch_holes: AtomicBool::new(false),
            split_format: AtomicBool::new(true),
            leave_free: AtomicU64::new(0),
            hdd_conf: Mutex::new(config.hdd_conf_filename.clone()),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        engine
            .self_ref
            .set(Arc::downgrade(&engine))
            .ok()
            .expect("fresh engine");

        engine.apply_config(config);
        engine.folders_reinit()?;

        {
            let folders = engine.folders.lock();
            for folder in folders.list.iter() {
                info!(path = %folder.path.display(), "hdd space manager: path to scan");
            }
        }
        info!("hdd space manager: start background hdd scanning (searching for available chunks)");
        Ok(engine)
    }

    /// Apply a (re)loaded configuration.
    fn apply_config(&self, config: &HddConfig) {
        self.advise_no_cache
            .store(config.advise_no_cache, Ordering::Relaxed);
        self.perform_fsync
            .store(config.perform_fsync, Ordering::Relaxed);
        self.punch_holes.store(config.punch_holes, Ordering::Relaxed);
        self.test_freq_ms
            .store(config.test_freq_ms(), Ordering::Relaxed);

        let new_split = config.create_new_chunks_in_split_format;
        if self.split_format.swap(new_split, Ordering::Relaxed) != new_split {
            if new_split {
                info!("new chunks format set to 'split'");
            } else {
                info!("new chunks format set to 'interleaved'");
            }
        }

        match config.leave_free_bytes() {
            Some(bytes) => {
                if bytes < crate::CHUNK_SIZE as u64 {
                    warn!(
                        "leave_free_default is smaller than the chunk size; \
                         leaving so little space on hdd is not recommended"
                    );
                }
                self.leave_free.store(bytes, Ordering::Relaxed);
            }
            None => {
                warn!("leave_free_default parse error - left unchanged");
            }
        }
        *self.hdd_conf.lock() = config.hdd_conf_filename.clone();
    }

    /// Reload configuration and re-read the folder-list file. Folders that
    /// disappeared from the file are drained by the maintenance tick.
    pub fn reload(&self, config: &HddConfig) -> Result<()> {
        self.apply_config(config);
        info!("reloading hdd data ...");
        self.folders_reinit()
    }

    /// Handle to this engine for spawning background threads.
    fn self_arc(&self) -> Arc<HddEngine> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("engine self reference")
    }

    /// Spawn the long-lived background threads (tester, folder maintenance,
    /// resource aging, priority tester).
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock();

        let engine = self.self_arc();
        threads.push(
            std::thread::Builder::new()
                .name("hdd-tester".into())
                .spawn(move || tester::tester_thread(engine))
                .expect("spawn tester thread"),
        );

        let engine = self.self_arc();
        threads.push(
            std::thread::Builder::new()
                .name("hdd-folders".into())
                .spawn(move || {
                    while !engine.term.load(Ordering::Relaxed) {
                        engine.check_folders();
                        std::thread::sleep(std::time::Duration::from_secs(1));
                    }
                })
                .expect("spawn folders thread"),
        );

        let engine = self.self_arc();
        threads.push(
            std::thread::Builder::new()
                .name("hdd-free-resources".into())
                .spawn(move || {
                    while !engine.term.load(Ordering::Relaxed) {
                        engine.free_unused_fds(FREE_RESOURCES_MAX);
                        std::thread::sleep(std::time::Duration::from_secs(
                            FREE_RESOURCES_PERIOD_SECS,
                        ));
                    }
                })
                .expect("spawn free-resources thread"),
        );

        let engine = self.self_arc();
        threads.push(
            std::thread::Builder::new()
                .name("hdd-test-chunk".into())
                .spawn(move || tester::priority_test_thread(engine))
                .expect("spawn priority test thread"),
        );
    }

    /// Evict idle descriptors older than the aging threshold.
    pub(crate) fn free_unused_fds(&self, max: usize) {
        let _reg = self.registry.lock();
        self.pool.free_unused(usec_now(), max);
    }

    /// Evict idle descriptors regardless of age, up to `max`.
    pub(crate) fn free_unused_fds_forced(&self, max: usize) {
        let _reg = self.registry.lock();
        self.pool.free_unused(u64::MAX, max);
    }

    /// Whether any folder scan is still running.
    pub fn scans_in_progress(&self) -> bool {
        self.scans_in_progress.load(Ordering::Relaxed) != 0
    }

    /// True once since the last call if folder usage or membership changed.
    pub fn space_changed(&self) -> bool {
        self.space_changed.swap(false, Ordering::Relaxed)
    }

    /// Number of I/O errors since the last call.
    pub fn error_count(&self) -> u32 {
        self.error_counter.swap(0, Ordering::Relaxed)
    }

    /// Aggregate usable and to-be-drained space across folders.
    pub fn get_space(&self) -> SpaceInfo {
        let folders = self.folders.lock();
        let mut space = SpaceInfo::default();
        for folder in folders.list.iter() {
            if folder.is_damaged() || folder.was_removed_from_config.load(Ordering::Relaxed) {
                continue;
            }
            let inner = folder.inner.lock();
            let working = inner.scan_state == ScanState::Working;
            let chunks = folder.chunks.lock().len() as u32;
            if !folder.is_marked_for_deletion() {
                if working {
                    space.used_space += inner.total_space - inner.available_space;
                    space.total_space += inner.total_space;
                }
                space.chunk_count += chunks;
            } else {
                if working {
                    space.to_delete_used_space += inner.total_space - inner.available_space;
                    space.to_delete_total_space += inner.total_space;
                }
                space.to_delete_chunk_count += chunks;
            }
        }
        space
    }

    /// Pick a folder for a new chunk using carry weighting: take any
    /// candidate whose carry reached 1.0, otherwise top up every candidate's
    /// carry proportionally to its relative free space and take the new
    /// maximum.
    pub(crate) fn pick_folder(&self) -> Option<Arc<Folder>> {
        let folders = self.folders.lock();
        let list = &folders.list;
        if list.is_empty() {
            return None;
        }

        let mut best: Option<usize> = None;
        let mut max_carry = 1.0f64;
        let mut min_pct = f64::MAX;
        let mut max_pct = 0.0f64;

        for (i, folder) in list.iter().enumerate() {
            let inner = folder.inner.lock();
            if !folder.is_selectable_for_new_chunk(&inner) {
                continue;
            }
            if inner.carry >= max_carry {
                max_carry = inner.carry;
                best = Some(i);
            }
            let pct = inner.available_space as f64 / inner.total_space as f64;
            min_pct = min_pct.min(pct);
            max_pct = max_pct.max(pct);
        }

        if let Some(i) = best {
            // Lower the probability of being chosen again.
            list[i].inner.lock().carry -= 1.0;
            return Some(Arc::clone(&list[i]));
        }

        if max_pct == 0.0 {
            return None;
        }

        let s = if max_pct < 0.01 {
            0.0
        } else {
            (min_pct * 0.8).max(0.01)
        };
        let d = max_pct - s;
        max_carry = 1.0;

        for (i, folder) in list.iter().enumerate() {
            let mut inner = folder.inner.lock();
            if !folder.is_selectable_for_new_chunk(&inner) {
                continue;
            }
            let pct = inner.available_space as f64 / inner.total_space as f64;
            if pct > s {
                inner.carry += (pct - s) / d;
            }
            if inner.carry >= max_carry {
                max_carry = inner.carry;
                best = Some(i);
            }
        }

        best.map(|i| {
            list[i].inner.lock().carry -= 1.0;
            Arc::clone(&list[i])
        })
    }

    /// Report a folder's chunk inventory to the master. With `rm` the chunks
    /// are reported lost and dropped from the registry (locked ones are
    /// flagged `ToBeDeleted` and vanish on release).
    pub(crate) fn send_folder_data(&self, folder: &Arc<Folder>, rm: bool) {
        let marked_for_deletion = folder.is_marked_for_deletion();
        let mut reg = self.registry.lock();

        let mut to_remove = Vec::new();
        for (key, entry) in reg.map.iter() {
            let owned = entry
                .chunk
                .owner()
                .map(|f| Arc::ptr_eq(&f, folder))
                .unwrap_or(false);
            if !owned {
                continue;
            }
            if rm {
                to_remove.push(*key);
            } else {
                self.report_new_chunk(
                    entry.chunk.id,
                    entry.chunk.version(),
                    marked_for_deletion,
                    entry.chunk.part_type,
                );
            }
        }

        for key in to_remove {
            self.report_lost_chunk(key.id, key.part_type);
            let state = reg.map.get(&key).map(|e| e.state);
            match state {
                Some(ChunkState::Avail) => self.chunk_remove_locked(&mut reg, key),
                Some(ChunkState::Locked) => {
                    reg.map.get_mut(&key).unwrap().state = ChunkState::ToBeDeleted;
                }
                _ => {}
            }
        }
    }

    /// Once-per-second folder maintenance: drive scan state machines, drain
    /// removed folders, flip error-ridden folders to damaged, refresh stale
    /// usage.
    pub fn check_folders(&self) {
        let now = wall_time_secs();
        let mut changed = false;

        let mut folders_guard = self.folders.lock();
        if !folders_guard.actions {
            return;
        }

        // Folders dropped from the config: stop their scans, report their
        // chunks lost, then delete the folder object.
        let mut to_drop: Vec<usize> = Vec::new();
        for (i, folder) in folders_guard.list.iter().enumerate() {
            if !folder.was_removed_from_config.load(Ordering::Relaxed) {
                continue;
            }
            let state = folder.inner.lock().scan_state;
            match state {
                ScanState::InProgress => {
                    folder.inner.lock().scan_state = ScanState::Terminate;
                }
                ScanState::Terminate => {}
                ScanState::ThreadFinished
                | ScanState::SendNeeded
                | ScanState::Needed
                | ScanState::Working => {
                    if state == ScanState::ThreadFinished {
                        let handle = folder.inner.lock().scan_thread.take();
                        if let Some(handle) = handle {
                            let _ = handle.join();
                        }
                    }
                    folder.inner.lock().scan_state = ScanState::Working;
                    self.send_folder_data(folder, true);
                    changed = true;
                    folder
                        .was_removed_from_config
                        .store(false, Ordering::Relaxed);
                }
            }
            if folder.inner.lock().migrate_state == MigrateState::ThreadFinished {
                let handle = folder.inner.lock().migrate_thread.take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
                folder.inner.lock().migrate_state = MigrateState::Done;
            }
            // Only true once the inventory went out as lost reports.
            if !folder.was_removed_from_config.load(Ordering::Relaxed) {
                info!(path = %folder.path.display(), "folder successfully removed");
                to_drop.push(i);
                self.tester_reset.store(true, Ordering::Relaxed);
            }
        }
        for i in to_drop.into_iter().rev() {
            folders_guard.list.remove(i);
        }

        for folder in folders_guard.list.iter() {
            if folder.is_damaged() || folder.was_removed_from_config.load(Ordering::Relaxed) {
                continue;
            }
            let state = folder.inner.lock().scan_state;
            match state {
                ScanState::Needed => {
                    let engine = self.self_arc();
                    let f = Arc::clone(folder);
                    let mut inner = folder.inner.lock();
                    inner.scan_state = ScanState::InProgress;
                    inner.scan_thread = Some(
                        std::thread::Builder::new()
                            .name("hdd-scan".into())
                            .spawn(move || scan::folder_scan(&engine, &f))
                            .expect("spawn scan thread"),
                    );
                }
                ScanState::ThreadFinished => {
                    let handle = folder.inner.lock().scan_thread.take();
                    if let Some(handle) = handle {
                        let _ = handle.join();
                    }
                    let mut inner = folder.inner.lock();
                    inner.scan_state = ScanState::Working;
                    folder.refresh_usage(&mut inner);
                    inner.last_refresh = now;
                    folder.need_refresh.store(false, Ordering::Relaxed);
                    changed = true;
                }
                ScanState::SendNeeded => {
                    self.send_folder_data(folder, false);
                    let mut inner = folder.inner.lock();
                    inner.scan_state = ScanState::Working;
                    folder.refresh_usage(&mut inner);
                    inner.last_refresh = now;
                    folder.need_refresh.store(false, Ordering::Relaxed);
                    changed = true;
                }
                ScanState::Working => {
                    let recent_errors = {
                        let inner = folder.inner.lock();
                        inner
                            .last_errors
                            .iter()
                            .filter(|e| {
                                e.timestamp + LAST_ERROR_TIME_SECS >= now
                                    && (e.errno == libc::EIO || e.errno == libc::EROFS)
                            })
                            .count()
                    };
                    let ro_drain = folder.is_marked_for_removal.load(Ordering::Relaxed)
                        && folder.is_read_only();
                    if recent_errors >= ERROR_LIMIT && !ro_drain {
                        warn!(
                            errors = recent_errors,
                            window_secs = LAST_ERROR_TIME_SECS,
                            path = %folder.path.display(),
                            "too many I/O errors; marking folder as damaged"
                        );
                        self.send_folder_data(folder, true);
                        folder.is_damaged.store(true, Ordering::Relaxed);
                        changed = true;
                    } else if folder.need_refresh.swap(false, Ordering::Relaxed)
                        || folder.inner.lock().last_refresh + USAGE_REFRESH_SECS < now
                    {
                        let mut inner = folder.inner.lock();
                        folder.refresh_usage(&mut inner);
                        inner.last_refresh = now;
                        changed = true;
                    }
                }
                ScanState::InProgress | ScanState::Terminate => {}
            }
            if folder.inner.lock().migrate_state == MigrateState::ThreadFinished {
                let handle = folder.inner.lock().migrate_thread.take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
                folder.inner.lock().migrate_state = MigrateState::Done;
            }
        }
        drop(folders_guard);

        if changed {
            self.space_changed.store(true, Ordering::Relaxed);
        }
    }

    /// Re-read the folder-list file: update existing folders, add new ones,
    /// and mark the rest for removal.
    fn folders_reinit(&self) -> Result<()> {
        let path = self.hdd_conf.lock().clone();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            rimfs_types::Status::with_message(
                StatusCode::INVALID_CONFIG,
                format!("can't open hdd config file {}: {}", path.display(), e),
            )
        })?;
        info!(file = %path.display(), "hdd configuration file opened");

        {
            let mut folders = self.folders.lock();
            folders.actions = false;
            // At reload, folders absent from the file get drained later by
            // the maintenance tick.
            for folder in folders.list.iter() {
                folder.was_removed_from_config.store(true, Ordering::Relaxed);
            }
        }

        for line in content.lines() {
            self.parse_folder_line(line)?;
        }

        let mut any_available = false;
        {
            let mut folders = self.folders.lock();
            for folder in folders.list.iter() {
                if folder.was_removed_from_config.load(Ordering::Relaxed) {
                    info!(path = %folder.path.display(), "hdd space manager: folder will be removed");
                    continue;
                }
                any_available = true;
                match folder.inner.lock().scan_state {
                    ScanState::Needed => {
                        info!(path = %folder.path.display(), "hdd space manager: folder will be scanned");
                    }
                    ScanState::SendNeeded => {
                        info!(path = %folder.path.display(), "hdd space manager: folder will be resent");
                    }
                    _ => {
                        info!(path = %folder.path.display(), "hdd space manager: folder didn't change");
                    }
                }
            }
            folders.actions = true;
        }

        if !any_available {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!("no data paths defined in {}", path.display()),
            );
        }
        Ok(())
    }

    /// Parse one `[*]PATH` line of the folder-list file.
    fn parse_folder_line(&self, line: &str) -> Result<()> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let (marked_for_removal, path_str) = match line.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let mut normalized = path_str.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let path = PathBuf::from(&normalized);

        let lock_needed = {
            let folders = self.folders.lock();
            !folders.list.iter().any(|f| f.path == path)
        };

        let mut read_only = false;
        let mut damaged = false;
        let lock_path = path.join(".lock");
        let lock_file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(&lock_path)
        {
            Ok(file) => Some(file),
            Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
                read_only = true;
                None
            }
            Err(e) => {
                warn!(
                    file = %lock_path.display(),
                    error = %e,
                    "can't create lock file, marking hdd as damaged"
                );
                damaged = true;
                None
            }
        };
        // A read-only filesystem is fine for a folder that is only being
        // drained.

        let mut lock_info: Option<FolderLockFile> = None;
        if let Some(file) = lock_file {
            if lock_needed {
                let rc = unsafe { libc::lockf(file.as_raw_fd(), libc::F_TLOCK, 0) };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EAGAIN)
                        || err.raw_os_error() == Some(libc::EACCES)
                    {
                        return make_error_msg(
                            StatusCode::INVALID_CONFIG,
                            format!(
                                "data folder {} already locked by another process",
                                path.display()
                            ),
                        );
                    }
                    warn!(
                        file = %lock_path.display(),
                        error = %err,
                        "lockf failed, marking hdd as damaged"
                    );
                    damaged = true;
                }
            }
            if !damaged {
                match file.metadata() {
                    Ok(md) => {
                        let (dev, ino) = (md.dev(), md.ino());
                        if lock_needed {
                            let folders = self.folders.lock();
                            for other in folders.list.iter() {
                                let inner = other.inner.lock();
                                let Some(other_lock) = inner.lock.as_ref() else {
                                    continue;
                                };
                                if other_lock.dev != dev {
                                    continue;
                                }
                                if other_lock.ino == ino {
                                    return make_error_msg(
                                        StatusCode::INVALID_CONFIG,
                                        format!(
                                            "data folders '{}' and '{}' have the same lockfile",
                                            path.display(),
                                            other.path.display()
                                        ),
                                    );
                                }
                                warn!(
                                    "data folders '{}' and '{}' are on the same physical \
                                     device (could lead to unexpected behaviours)",
                                    path.display(),
                                    other.path.display()
                                );
                            }
                        }
                        lock_info = Some(FolderLockFile { file, dev, ino });
                    }
                    Err(e) => {
                        warn!(
                            file = %lock_path.display(),
                            error = %e,
                            "fstat failed, marking hdd as damaged"
                        );
                        damaged = true;
                    }
                }
            }
        }

        // Reload path: update the already-known folder in place.
        {
            let folders = self.folders.lock();
            for folder in folders.list.iter() {
                if folder.path != path {
                    continue;
                }
                folder
                    .was_removed_from_config
                    .store(false, Ordering::Relaxed);
                let mut inner = folder.inner.lock();
                if folder.is_damaged() {
                    // Give a previously damaged folder a fresh start.
                    inner.scan_state = ScanState::Needed;
                    folder.scan_progress.store(0, Ordering::Relaxed);
                    folder.is_damaged.store(damaged, Ordering::Relaxed);
                    inner.available_space = 0;
                    inner.total_space = 0;
                    inner.leave_free_space = self.leave_free.load(Ordering::Relaxed);
                    let _ = folder.current_stat.take();
                    for slot in inner.stats.iter_mut() {
                        *slot = Default::default();
                    }
                    inner.stats_pos = 0;
                    inner.last_errors = Default::default();
                    inner.last_error_index = 0;
                    inner.last_refresh = 0;
                    folder.need_refresh.store(true, Ordering::Relaxed);
                } else if folder.is_marked_for_removal.load(Ordering::Relaxed)
                    != marked_for_removal
                    || folder.is_read_only() != read_only
                {
                    // The flags changed; the inventory must go to the master
                    // again.
                    inner.scan_state = ScanState::SendNeeded;
                }
                folder.is_read_only.store(read_only, Ordering::Relaxed);
                folder
                    .is_marked_for_removal
                    .store(marked_for_removal, Ordering::Relaxed);
                return Ok(());
            }
        }

        let folder = Arc::new(Folder::new(path, marked_for_removal));
        folder.is_read_only.store(read_only, Ordering::Relaxed);
        folder.is_damaged.store(damaged, Ordering::Relaxed);
        {
            let mut inner = folder.inner.lock();
            inner.leave_free_space = self.leave_free.load(Ordering::Relaxed);
            if !damaged {
                inner.lock = lock_info;
            }
        }
        self.folders.lock().list.push(folder);
        self.tester_reset.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop all background work, flush dirty CRC tables, close descriptors
    /// and clear the registry and folder list.
    pub fn terminate(&self) {
        let already = self.term.swap(true, Ordering::SeqCst);
        if !already {
            let handles: Vec<_> = self.threads.lock().drain(..).collect();
            for handle in handles {
                let _ = handle.join();
            }
        }

        {
            let folders = self.folders.lock();
            for folder in folders.list.iter() {
                let mut inner = folder.inner.lock();
                if inner.scan_state == ScanState::InProgress {
                    inner.scan_state = ScanState::Terminate;
                }
                if inner.migrate_state == MigrateState::InProgress {
                    inner.migrate_state = MigrateState::Terminate;
                }
            }
        }

        // Wait for the per-folder threads to wind down.
        loop {
            let mut pending = 0usize;
            {
                let folders = self.folders.lock();
                for folder in folders.list.iter() {
                    let scan_handle = {
                        let mut inner = folder.inner.lock();
                        match inner.scan_state {
                            ScanState::ThreadFinished => {
                                inner.scan_state = ScanState::Working;
                                inner.scan_thread.take()
                            }
                            ScanState::Terminate | ScanState::InProgress => {
                                pending += 1;
                                None
                            }
                            _ => None,
                        }
                    };
                    if let Some(handle) = scan_handle {
                        let _ = handle.join();
                    }

                    let migrate_handle = {
                        let mut inner = folder.inner.lock();
                        match inner.migrate_state {
                            MigrateState::ThreadFinished => {
                                inner.migrate_state = MigrateState::Done;
                                inner.migrate_thread.take()
                            }
                            MigrateState::Terminate | MigrateState::InProgress => {
                                pending += 1;
                                None
                            }
                            _ => None,
                        }
                    };
                    if let Some(handle) = migrate_handle {
                        let _ = handle.join();
                    }
                }
            }
            if pending == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        // Flush what is dirty, close everything, clear the registry.
        {
            let mut reg = self.registry.lock();
            let keys: Vec<_> = reg.map.keys().copied().collect();
            for key in keys {
                let (state, chunk) = {
                    let entry = reg.map.get(&key).expect("key just enumerated");
                    (entry.state, Arc::clone(&entry.chunk))
                };
                if state == ChunkState::Avail {
                    let dirty = chunk.inner.lock().was_changed;
                    if dirty && chunk.format == crate::chunk::ChunkFormat::Split {
                        warn!(chunk_id = %chunk.id, "terminate: crc table not flushed - writing now");
                        if let Err(e) = self.write_crc_table(&chunk) {
                            warn!(file = %chunk.filename().display(), error = %e,
                                  "terminate: crc write failed");
                        }
                    }
                    let fd = chunk.inner.lock().fd;
                    if let Some(handle) = fd {
                        self.pool.purge(handle);
                    }
                } else {
                    warn!(chunk_id = %chunk.id, part_type = %chunk.part_type,
                          "terminate: chunk still locked");
                }
            }
            reg.map.clear();
            reg.free_conds.clear();
        }
        self.pool.free_unused(u64::MAX, usize::MAX);
        self.folders.lock().list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPartType;
    use rimfs_types::ChunkId;

    fn engine_over(dirs: &[&str], root: &std::path::Path) -> Arc<HddEngine> {
        let mut lines = String::new();
        for dir in dirs {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).unwrap();
            lines.push_str(&format!("{}/\n", path.display()));
        }
        let cfg_file = root.join("hdd.cfg");
        std::fs::write(&cfg_file, lines).unwrap();

        let config = HddConfig {
            hdd_conf_filename: cfg_file,
            perform_fsync: false,
            leave_free_default: "0".to_string(),
            ..Default::default()
        };
        let engine = HddEngine::new(&config).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            engine.check_folders();
            let working = {
                let folders = engine.folders.lock();
                folders
                    .list
                    .iter()
                    .all(|f| f.inner.lock().scan_state == ScanState::Working)
            };
            if working {
                return engine;
            }
            assert!(std::time::Instant::now() < deadline, "folders never scanned");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn test_error_threshold_marks_folder_damaged() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_over(&["hdd0"], root.path());
        let id = ChunkId(0x77);
        engine
            .create_chunk(id, 1, ChunkPartType::Standard)
            .unwrap();

        let folder = engine.folders.lock().list[0].clone();
        let now = wall_time_secs();
        folder.record_error(*id, libc::EIO, now);
        folder.record_error(*id, libc::EIO, now);

        engine.check_folders();

        assert!(folder.is_damaged());
        // The folder's chunks went out as lost reports and placement now
        // fails for lack of selectable folders.
        let lost = engine.get_lost_chunks(16);
        assert!(lost.iter().any(|c| c.id == id));
        assert_eq!(engine.get_space().total_space, 0);
        assert!(engine.pick_folder().is_none());
    }

    #[test]
    fn test_old_errors_do_not_damage_folder() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_over(&["hdd0"], root.path());

        let folder = engine.folders.lock().list[0].clone();
        let stale = wall_time_secs() - 2 * LAST_ERROR_TIME_SECS;
        folder.record_error(1, libc::EIO, stale);
        folder.record_error(2, libc::EIO, stale);

        engine.check_folders();
        assert!(!folder.is_damaged());
    }

    #[test]
    fn test_placement_uses_all_folders() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_over(&["hdd0", "hdd1"], root.path());

        for i in 0..20u64 {
            engine
                .create_chunk(ChunkId(0x5000 + i), 1, ChunkPartType::Standard)
                .unwrap();
        }
        let counts: Vec<usize> = {
            let folders = engine.folders.lock();
            folders
                .list
                .iter()
                .map(|f| f.chunks.lock().len())
                .collect()
        };
        assert_eq!(counts.iter().sum::<usize>(), 20);
        assert!(counts.iter().all(|&c| c > 0), "placement skewed: {:?}", counts);
    }

    #[test]
    fn test_reload_marks_folder_for_removal() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_over(&["hdd0", "hdd1"], root.path());
        let id = ChunkId(0x88);
        engine
            .create_chunk(id, 1, ChunkPartType::Standard)
            .unwrap();

        // Rewrite the folder list without hdd1 and reload.
        let kept = root.path().join("hdd0");
        let cfg_file = root.path().join("hdd.cfg");
        std::fs::write(&cfg_file, format!("{}/\n", kept.display())).unwrap();
        let config = HddConfig {
            hdd_conf_filename: cfg_file,
            perform_fsync: false,
            leave_free_default: "0".to_string(),
            ..Default::default()
        };
        engine.reload(&config).unwrap();

        engine.check_folders();
        let folders = engine.folders.lock();
        assert_eq!(folders.list.len(), 1);
        assert_eq!(folders.list[0].path, kept.join(""));
    }
}
