//! Background scrubbing: the round-robin tester thread and the
//! client-triggered priority test thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use rimfs_types::{usec_now, ChunkId};

use crate::chunk::{ChunkPartType, ChunkState};
use crate::engine::HddEngine;
use crate::folder::ScanState;

/// A queued verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkTestRequest {
    pub id: ChunkId,
    pub version: u32,
    pub part_type: ChunkPartType,
}

impl HddEngine {
    /// Queue a chunk for priority verification (duplicates are merged).
    pub fn enqueue_chunk_test(&self, request: ChunkTestRequest) {
        self.test_queue.put(request);
    }
}

/// Round-robins through the folders; each tick it scrubs the chunk tested
/// longest ago on the current folder.
pub(crate) fn tester_thread(engine: Arc<HddEngine>) {
    let mut folder_index = 0usize;
    let mut elapsed_ms = 0u32;

    while !engine.term.load(Ordering::Relaxed) {
        let start_usec = usec_now();
        let mut to_test: Option<ChunkTestRequest> = None;

        {
            let folders = engine.folders.lock();
            if engine.tester_reset.swap(false, Ordering::Relaxed) {
                folder_index = 0;
                elapsed_ms = 0;
            }
            let freq_ms = engine.test_freq_ms.load(Ordering::Relaxed);
            elapsed_ms += freq_ms.min(1000);
            if elapsed_ms >= freq_ms && folders.actions && !folders.list.is_empty() {
                elapsed_ms = 0;

                let n = folders.list.len();
                let eligible = |f: &Arc<crate::folder::Folder>| {
                    !f.is_damaged()
                        && !f.is_marked_for_deletion()
                        && !f.was_removed_from_config.load(Ordering::Relaxed)
                        && f.inner.lock().scan_state == ScanState::Working
                };
                let mut selected = None;
                for step in 1..=n {
                    let idx = (folder_index + step) % n;
                    if eligible(&folders.list[idx]) {
                        selected = Some(idx);
                        break;
                    }
                }

                if let Some(idx) = selected {
                    folder_index = idx;
                    let folder = &folders.list[idx];
                    let reg = engine.registry.lock();
                    if let Some(key) = folder.chunks.lock().next_to_test() {
                        if let Some(entry) = reg.map.get(&key) {
                            if entry.state == ChunkState::Avail {
                                to_test = Some(ChunkTestRequest {
                                    id: key.id,
                                    version: entry.chunk.version(),
                                    part_type: key.part_type,
                                });
                            }
                        }
                    }
                }
            }
        }

        if let Some(req) = to_test {
            if engine
                .test_chunk_now(req.id, req.version, req.part_type)
                .is_err()
            {
                engine.report_damaged_chunk(req.id, req.part_type);
            }
        }

        sleep_remainder(start_usec, {
            let freq_ms = engine.test_freq_ms.load(Ordering::Relaxed);
            1000 * freq_ms.min(1000) as u64
        });
    }
}

/// Serves client-requested verifications from the priority queue, at most
/// one per second.
pub(crate) fn priority_test_thread(engine: Arc<HddEngine>) {
    while !engine.term.load(Ordering::Relaxed) {
        let start_usec = usec_now();

        if let Some(req) = engine.test_queue.try_get() {
            let name = format!("{}_{:08X}", req.id, req.version);
            if engine
                .test_chunk_now(req.id, req.version, req.part_type)
                .is_err()
            {
                info!(chunk = %name, "chunk corrupted (detected by a client)");
                engine.report_damaged_chunk(req.id, req.part_type);
            } else {
                info!(chunk = %name, "chunk spuriously reported as corrupted");
            }
        }

        sleep_remainder(start_usec, 1_000_000);
    }
}

fn sleep_remainder(start_usec: u64, budget_usec: u64) {
    let elapsed = usec_now().saturating_sub(start_usec);
    if elapsed < budget_usec {
        std::thread::sleep(std::time::Duration::from_micros(budget_usec - elapsed));
    }
}
