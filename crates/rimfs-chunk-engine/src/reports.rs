//! Master-report queues and disk-info snapshots.
//!
//! Damaged, lost, and new chunks are queued here and drained in bounded
//! batches by the protocol layer talking to the master. Disk-info snapshots
//! aggregate each folder's per-minute ring into minute/hour/day rollups.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::debug;

use rimfs_types::ChunkId;

use crate::chunk::ChunkPartType;
use crate::engine::HddEngine;
use crate::folder::ScanState;
use crate::stats::HddStatistics;
use crate::{LAST_ERROR_SIZE, STATS_HISTORY};

/// Default batch sizes used by the protocol layer when draining reports.
pub const LOST_CHUNKS_BATCH: usize = 1024;
pub const NEW_CHUNKS_BATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWithType {
    pub id: ChunkId,
    pub part_type: ChunkPartType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWithVersionAndType {
    pub id: ChunkId,
    /// Version with the to-delete flag folded into the high bit.
    pub version: u32,
    pub part_type: ChunkPartType,
}

/// Fold the folder's marked-for-deletion flag into a reported version.
pub fn combine_version_with_todel(version: u32, todel: bool) -> u32 {
    if todel {
        version | 0x8000_0000
    } else {
        version & 0x7FFF_FFFF
    }
}

#[derive(Default, Debug)]
pub(crate) struct MasterReports {
    pub damaged: VecDeque<ChunkWithType>,
    pub lost: VecDeque<ChunkWithType>,
    pub new: VecDeque<ChunkWithVersionAndType>,
}

/// One folder's entry in a disk-info snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub path: String,
    pub to_delete: bool,
    pub damaged: bool,
    pub scan_in_progress: bool,
    /// Scan percentage while scanning, otherwise unused.
    pub scan_progress: u8,
    pub last_error_chunk_id: u64,
    pub last_error_timestamp: u64,
    pub used_space: u64,
    pub total_space: u64,
    pub chunk_count: u32,
    pub last_minute: HddStatistics,
    pub last_hour: HddStatistics,
    pub last_day: HddStatistics,
}

impl HddEngine {
    pub fn report_damaged_chunk(&self, id: ChunkId, part_type: ChunkPartType) {
        debug!(chunk_id = %id, part_type = %part_type, "reporting damaged chunk");
        self.reports
            .lock()
            .damaged
            .push_back(ChunkWithType { id, part_type });
    }

    pub fn get_damaged_chunks(&self, limit: usize) -> Vec<ChunkWithType> {
        let mut reports = self.reports.lock();
        let n = reports.damaged.len().min(limit);
        reports.damaged.drain(..n).collect()
    }

    pub fn report_lost_chunk(&self, id: ChunkId, part_type: ChunkPartType) {
        self.reports
            .lock()
            .lost
            .push_back(ChunkWithType { id, part_type });
    }

    pub fn get_lost_chunks(&self, limit: usize) -> Vec<ChunkWithType> {
        let mut reports = self.reports.lock();
        let n = reports.lost.len().min(limit);
        reports.lost.drain(..n).collect()
    }

    pub fn report_new_chunk(&self, id: ChunkId, version: u32, todel: bool, part_type: ChunkPartType) {
        let version = combine_version_with_todel(version, todel);
        self.reports.lock().new.push_back(ChunkWithVersionAndType {
            id,
            version,
            part_type,
        });
    }

    pub fn get_new_chunks(&self, limit: usize) -> Vec<ChunkWithVersionAndType> {
        let mut reports = self.reports.lock();
        let n = reports.new.len().min(limit);
        reports.new.drain(..n).collect()
    }

    /// Snapshot every folder for the master's disk-info report.
    pub fn disk_info(&self) -> Vec<DiskInfo> {
        let folders = self.folders.lock();
        let mut out = Vec::with_capacity(folders.list.len());
        for folder in folders.list.iter() {
            let inner = folder.inner.lock();
            let scan_in_progress = inner.scan_state == ScanState::InProgress;

            let last = (inner.last_error_index + LAST_ERROR_SIZE - 1) % LAST_ERROR_SIZE;
            let last_error = inner.last_errors[last];

            let last_minute = inner.stats[inner.stats_pos];
            let mut rollup = last_minute;
            for pos in 1..60 {
                rollup.add(&inner.stats[(inner.stats_pos + pos) % STATS_HISTORY]);
            }
            let last_hour = rollup;
            for pos in 60..STATS_HISTORY {
                rollup.add(&inner.stats[(inner.stats_pos + pos) % STATS_HISTORY]);
            }
            let last_day = rollup;

            out.push(DiskInfo {
                path: folder.path.display().to_string(),
                to_delete: folder.is_marked_for_deletion(),
                damaged: folder.is_damaged(),
                scan_in_progress,
                scan_progress: folder.scan_progress.load(Ordering::Relaxed),
                last_error_chunk_id: last_error.chunk_id,
                last_error_timestamp: last_error.timestamp,
                used_space: inner.total_space.saturating_sub(inner.available_space),
                total_space: inner.total_space,
                chunk_count: folder.chunks.lock().len() as u32,
                last_minute,
                last_hour,
                last_day,
            });
        }
        out
    }

    /// Rotate every folder's per-minute statistics ring; called once a
    /// minute by the owning service.
    pub fn move_stats(&self) {
        let folders = self.folders.lock();
        for folder in folders.list.iter() {
            let mut inner = folder.inner.lock();
            inner.stats_pos = if inner.stats_pos == 0 {
                STATS_HISTORY - 1
            } else {
                inner.stats_pos - 1
            };
            let pos = inner.stats_pos;
            inner.stats[pos] = folder.current_stat.take();
        }
    }
}
