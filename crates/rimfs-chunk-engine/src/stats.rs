//! I/O and operation counters.
//!
//! Process-wide counters live in [`EngineStats`]; per-folder counters live in
//! each folder's [`CurrentFolderStat`]. Both are plain atomics so the hot I/O
//! paths never take a lock for accounting, and readers drain them with
//! exchange(0) semantics. The timing guards record a sample only when the
//! guarded I/O succeeded.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::folder::Folder;
use rimfs_types::usec_now;

fn atomic_max_u32(target: &AtomicU32, value: u32) {
    let mut prev = target.load(Ordering::Relaxed);
    while prev < value {
        match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(p) => prev = p,
        }
    }
}

/// One slot of the per-folder minute/hour/day statistics ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HddStatistics {
    pub rbytes: u64,
    pub wbytes: u64,
    pub usec_read_sum: u64,
    pub usec_write_sum: u64,
    pub usec_fsync_sum: u64,
    pub rops: u32,
    pub wops: u32,
    pub fsync_ops: u32,
    pub usec_read_max: u32,
    pub usec_write_max: u32,
    pub usec_fsync_max: u32,
}

impl HddStatistics {
    pub fn add(&mut self, other: &HddStatistics) {
        self.rbytes += other.rbytes;
        self.wbytes += other.wbytes;
        self.usec_read_sum += other.usec_read_sum;
        self.usec_write_sum += other.usec_write_sum;
        self.usec_fsync_sum += other.usec_fsync_sum;
        self.rops += other.rops;
        self.wops += other.wops;
        self.fsync_ops += other.fsync_ops;
        self.usec_read_max = self.usec_read_max.max(other.usec_read_max);
        self.usec_write_max = self.usec_write_max.max(other.usec_write_max);
        self.usec_fsync_max = self.usec_fsync_max.max(other.usec_fsync_max);
    }
}

/// Per-folder counters for the current minute. Not guarded by the folder
/// lock; these are chart data, not bookkeeping.
#[derive(Default, Debug)]
pub(crate) struct CurrentFolderStat {
    rbytes: AtomicU64,
    wbytes: AtomicU64,
    usec_read_sum: AtomicU64,
    usec_write_sum: AtomicU64,
    usec_fsync_sum: AtomicU64,
    rops: AtomicU32,
    wops: AtomicU32,
    fsync_ops: AtomicU32,
    usec_read_max: AtomicU32,
    usec_write_max: AtomicU32,
    usec_fsync_max: AtomicU32,
}

impl CurrentFolderStat {
    pub fn record_read(&self, bytes: u64, usec: u64) {
        self.rops.fetch_add(1, Ordering::Relaxed);
        self.rbytes.fetch_add(bytes, Ordering::Relaxed);
        self.usec_read_sum.fetch_add(usec, Ordering::Relaxed);
        atomic_max_u32(&self.usec_read_max, usec as u32);
    }

    pub fn record_write(&self, bytes: u64, usec: u64) {
        self.wops.fetch_add(1, Ordering::Relaxed);
        self.wbytes.fetch_add(bytes, Ordering::Relaxed);
        self.usec_write_sum.fetch_add(usec, Ordering::Relaxed);
        atomic_max_u32(&self.usec_write_max, usec as u32);
    }

    pub fn record_fsync(&self, usec: u64) {
        self.fsync_ops.fetch_add(1, Ordering::Relaxed);
        self.usec_fsync_sum.fetch_add(usec, Ordering::Relaxed);
        atomic_max_u32(&self.usec_fsync_max, usec as u32);
    }

    /// Drain into a ring slot, resetting every counter.
    pub fn take(&self) -> HddStatistics {
        HddStatistics {
            rbytes: self.rbytes.swap(0, Ordering::Relaxed),
            wbytes: self.wbytes.swap(0, Ordering::Relaxed),
            usec_read_sum: self.usec_read_sum.swap(0, Ordering::Relaxed),
            usec_write_sum: self.usec_write_sum.swap(0, Ordering::Relaxed),
            usec_fsync_sum: self.usec_fsync_sum.swap(0, Ordering::Relaxed),
            rops: self.rops.swap(0, Ordering::Relaxed),
            wops: self.wops.swap(0, Ordering::Relaxed),
            fsync_ops: self.fsync_ops.swap(0, Ordering::Relaxed),
            usec_read_max: self.usec_read_max.swap(0, Ordering::Relaxed),
            usec_write_max: self.usec_write_max.swap(0, Ordering::Relaxed),
            usec_fsync_max: self.usec_fsync_max.swap(0, Ordering::Relaxed),
        }
    }
}

/// Process-wide I/O and per-operation counters.
#[derive(Default, Debug)]
pub struct EngineStats {
    overhead_bytes_r: AtomicU64,
    overhead_bytes_w: AtomicU64,
    overhead_ops_r: AtomicU32,
    overhead_ops_w: AtomicU32,
    total_bytes_r: AtomicU64,
    total_bytes_w: AtomicU64,
    total_ops_r: AtomicU32,
    total_ops_w: AtomicU32,
    total_usec_r: AtomicU64,
    total_usec_w: AtomicU64,

    op_create: AtomicU32,
    op_delete: AtomicU32,
    op_version: AtomicU32,
    op_duplicate: AtomicU32,
    op_truncate: AtomicU32,
    op_duptrunc: AtomicU32,
    op_test: AtomicU32,
}

/// Snapshot of the I/O counters since the previous drain.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IoStatsSnapshot {
    pub overhead_bytes_read: u64,
    pub overhead_bytes_written: u64,
    pub overhead_read_ops: u32,
    pub overhead_write_ops: u32,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub total_read_ops: u32,
    pub total_write_ops: u32,
    pub total_read_usec: u64,
    pub total_write_usec: u64,
}

/// Snapshot of the per-operation counters since the previous drain.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OpStatsSnapshot {
    pub create: u32,
    pub delete: u32,
    pub set_version: u32,
    pub duplicate: u32,
    pub truncate: u32,
    pub duptrunc: u32,
    pub test: u32,
}

impl EngineStats {
    /// Internal reads (CRC tables, headers) that are not client payload.
    pub fn overhead_read(&self, size: u64) {
        self.overhead_ops_r.fetch_add(1, Ordering::Relaxed);
        self.overhead_bytes_r.fetch_add(size, Ordering::Relaxed);
    }

    pub fn overhead_write(&self, size: u64) {
        self.overhead_ops_w.fetch_add(1, Ordering::Relaxed);
        self.overhead_bytes_w.fetch_add(size, Ordering::Relaxed);
    }

    fn total_read(&self, size: u64, usec: u64) {
        self.total_ops_r.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_r.fetch_add(size, Ordering::Relaxed);
        self.total_usec_r.fetch_add(usec, Ordering::Relaxed);
    }

    fn total_write(&self, size: u64, usec: u64) {
        self.total_ops_w.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_w.fetch_add(size, Ordering::Relaxed);
        self.total_usec_w.fetch_add(usec, Ordering::Relaxed);
    }

    pub(crate) fn fsync_time(&self, usec: u64) {
        self.total_usec_w.fetch_add(usec, Ordering::Relaxed);
    }

    pub(crate) fn count_op(&self, op: OpKind) {
        let counter = match op {
            OpKind::Create => &self.op_create,
            OpKind::Delete => &self.op_delete,
            OpKind::SetVersion => &self.op_version,
            OpKind::Duplicate => &self.op_duplicate,
            OpKind::Truncate => &self.op_truncate,
            OpKind::Duptrunc => &self.op_duptrunc,
            OpKind::Test => &self.op_test,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take_io_stats(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            overhead_bytes_read: self.overhead_bytes_r.swap(0, Ordering::Relaxed),
            overhead_bytes_written: self.overhead_bytes_w.swap(0, Ordering::Relaxed),
            overhead_read_ops: self.overhead_ops_r.swap(0, Ordering::Relaxed),
            overhead_write_ops: self.overhead_ops_w.swap(0, Ordering::Relaxed),
            total_bytes_read: self.total_bytes_r.swap(0, Ordering::Relaxed),
            total_bytes_written: self.total_bytes_w.swap(0, Ordering::Relaxed),
            total_read_ops: self.total_ops_r.swap(0, Ordering::Relaxed),
            total_write_ops: self.total_ops_w.swap(0, Ordering::Relaxed),
            total_read_usec: self.total_usec_r.swap(0, Ordering::Relaxed),
            total_write_usec: self.total_usec_w.swap(0, Ordering::Relaxed),
        }
    }

    pub fn take_op_stats(&self) -> OpStatsSnapshot {
        OpStatsSnapshot {
            create: self.op_create.swap(0, Ordering::Relaxed),
            delete: self.op_delete.swap(0, Ordering::Relaxed),
            set_version: self.op_version.swap(0, Ordering::Relaxed),
            duplicate: self.op_duplicate.swap(0, Ordering::Relaxed),
            truncate: self.op_truncate.swap(0, Ordering::Relaxed),
            duptrunc: self.op_duptrunc.swap(0, Ordering::Relaxed),
            test: self.op_test.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum OpKind {
    Create,
    Delete,
    SetVersion,
    Duplicate,
    Truncate,
    Duptrunc,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoDirection {
    Read,
    Write,
}

/// Scoped timer for one folder-attributed I/O. Records the sample on drop
/// unless `fail()` was called.
pub(crate) struct FolderIoTimer<'a> {
    folder: &'a Folder,
    stats: &'a EngineStats,
    size: u64,
    start_usec: u64,
    direction: IoDirection,
    failed: bool,
}

impl<'a> FolderIoTimer<'a> {
    pub fn read(folder: &'a Folder, stats: &'a EngineStats, size: u64) -> Self {
        Self::new(folder, stats, size, IoDirection::Read)
    }

    pub fn write(folder: &'a Folder, stats: &'a EngineStats, size: u64) -> Self {
        Self::new(folder, stats, size, IoDirection::Write)
    }

    fn new(folder: &'a Folder, stats: &'a EngineStats, size: u64, direction: IoDirection) -> Self {
        Self {
            folder,
            stats,
            size,
            start_usec: usec_now(),
            direction,
            failed: false,
        }
    }

    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for FolderIoTimer<'_> {
    fn drop(&mut self) {
        if self.failed {
            return;
        }
        let elapsed = usec_now().saturating_sub(self.start_usec);
        if elapsed == 0 {
            return;
        }
        match self.direction {
            IoDirection::Read => {
                self.stats.total_read(self.size, elapsed);
                self.folder.current_stat.record_read(self.size, elapsed);
            }
            IoDirection::Write => {
                self.stats.total_write(self.size, elapsed);
                self.folder.current_stat.record_write(self.size, elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdd_statistics_add() {
        let mut a = HddStatistics {
            rbytes: 10,
            rops: 1,
            usec_read_max: 5,
            ..Default::default()
        };
        let b = HddStatistics {
            rbytes: 20,
            rops: 2,
            usec_read_max: 3,
            ..Default::default()
        };
        a.add(&b);
        assert_eq!(a.rbytes, 30);
        assert_eq!(a.rops, 3);
        assert_eq!(a.usec_read_max, 5);
    }

    #[test]
    fn test_current_stat_take_resets() {
        let s = CurrentFolderStat::default();
        s.record_read(100, 50);
        s.record_read(200, 70);
        s.record_write(300, 10);

        let snap = s.take();
        assert_eq!(snap.rops, 2);
        assert_eq!(snap.rbytes, 300);
        assert_eq!(snap.usec_read_sum, 120);
        assert_eq!(snap.usec_read_max, 70);
        assert_eq!(snap.wops, 1);
        assert_eq!(snap.wbytes, 300);

        let empty = s.take();
        assert_eq!(empty, HddStatistics::default());
    }

    #[test]
    fn test_engine_stats_exchange_semantics() {
        let s = EngineStats::default();
        s.overhead_read(4096);
        s.count_op(OpKind::Create);
        s.count_op(OpKind::Create);

        let io = s.take_io_stats();
        assert_eq!(io.overhead_bytes_read, 4096);
        assert_eq!(io.overhead_read_ops, 1);

        let ops = s.take_op_stats();
        assert_eq!(ops.create, 2);

        assert_eq!(s.take_io_stats().overhead_bytes_read, 0);
        assert_eq!(s.take_op_stats().create, 0);
    }

    #[test]
    fn test_atomic_max() {
        let v = AtomicU32::new(5);
        atomic_max_u32(&v, 3);
        assert_eq!(v.load(Ordering::Relaxed), 5);
        atomic_max_u32(&v, 9);
        assert_eq!(v.load(Ordering::Relaxed), 9);
    }
}
