//! Folder scanning and legacy-layout migration.
//!
//! Each folder gets a short-lived scan thread that walks its 256-subfolder
//! trees (legacy layout first, then current) and registers every recognized
//! chunk file. A folder whose scan completed normally gets a migrator thread
//! that renames legacy-layout chunks into the current layout at a gentle
//! pace.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use rimfs_types::wall_time_secs;

use crate::chunk::{subfolder_name, subfolder_number, ChunkPartType, DirectoryLayout};
use crate::engine::HddEngine;
use crate::filename::{parse_chunk_filename, ParsedChunkFilename};
use crate::folder::{Folder, MigrateState, ScanState};
use crate::registry::{AcquireMode, ChunkGuard};
use crate::SUBFOLDER_COUNT;

/// Scan thread entry point.
pub(crate) fn folder_scan(engine: &Arc<HddEngine>, folder: &Arc<Folder>) {
    let begin_time = wall_time_secs();
    engine.scans_in_progress.fetch_add(1, Ordering::Relaxed);

    let marked_for_deletion = folder.is_marked_for_deletion();
    {
        let mut inner = folder.inner.lock();
        folder.refresh_usage(&mut inner);
    }
    engine.space_changed.store(true, Ordering::Relaxed);

    if !marked_for_deletion {
        let _ = std::fs::create_dir_all(&folder.path);
        for sub in 0..SUBFOLDER_COUNT {
            let _ = std::fs::create_dir(
                folder.path.join(subfolder_name(sub, DirectoryLayout::Current)),
            );
        }
    }

    engine.scan_folder_layout(folder, begin_time, DirectoryLayout::Legacy);
    engine.scan_folder_layout(folder, begin_time, DirectoryLayout::Current);

    info!(folder = %folder.path.display(), "randomizing chunk test order");
    folder.chunks.lock().shuffle();

    engine.scans_in_progress.fetch_sub(1, Ordering::Relaxed);

    let mut inner = folder.inner.lock();
    if inner.scan_state == ScanState::Terminate {
        info!(folder = %folder.path.display(), "scanning folder: interrupted");
    } else {
        info!(
            folder = %folder.path.display(),
            seconds = wall_time_secs() - begin_time,
            "scanning folder: complete"
        );
    }

    if inner.scan_state != ScanState::Terminate && inner.migrate_state == MigrateState::Done {
        inner.migrate_state = MigrateState::InProgress;
        let e = Arc::clone(engine);
        let f = Arc::clone(folder);
        inner.migrate_thread = Some(
            std::thread::Builder::new()
                .name("hdd-migrate".into())
                .spawn(move || folder_migrate(&e, &f))
                .expect("spawn migrate thread"),
        );
    }

    inner.scan_state = ScanState::ThreadFinished;
    folder.scan_progress.store(100, Ordering::Relaxed);
}

/// Migrator thread entry point.
pub(crate) fn folder_migrate(engine: &Arc<HddEngine>, folder: &Arc<Folder>) {
    let begin_time = wall_time_secs();
    let count = engine.migrate_directories(folder);

    let mut inner = folder.inner.lock();
    if inner.migrate_state == MigrateState::Terminate {
        info!(folder = %folder.path.display(), "converting directories: interrupted");
    } else if count > 0 {
        info!(
            folder = %folder.path.display(),
            moved = count,
            seconds = wall_time_secs() - begin_time,
            "converting directories: complete"
        );
    }
    inner.migrate_state = MigrateState::ThreadFinished;
}

impl HddEngine {
    /// Walk one directory layout of a folder, registering every chunk file.
    pub(crate) fn scan_folder_layout(
        &self,
        folder: &Arc<Folder>,
        begin_time: u64,
        layout: DirectoryLayout,
    ) {
        if folder.inner.lock().scan_state == ScanState::Terminate {
            return;
        }

        let mut terminate = false;
        let mut check_count = 0u32;
        let mut last_percent = 0u8;
        let mut last_time = wall_time_secs();

        for sub in 0..SUBFOLDER_COUNT {
            if terminate {
                break;
            }
            let sub_path = folder.path.join(subfolder_name(sub, layout));
            let Ok(entries) = std::fs::read_dir(&sub_path) else {
                continue;
            };

            for entry in entries.flatten() {
                if terminate {
                    break;
                }
                let name_os = entry.file_name();
                let name = name_os.to_string_lossy();
                let Some(parsed) = parse_chunk_filename(&name) else {
                    if name != "." && name != ".." {
                        warn!(
                            file = %name,
                            dir = %sub_path.display(),
                            "invalid file in chunk directory; skipping it"
                        );
                    }
                    continue;
                };
                if subfolder_number(parsed.id) != sub {
                    warn!(
                        file = %sub_path.join(&*name).display(),
                        "chunk placed in a wrong directory; skipping it"
                    );
                    continue;
                }

                let Some(actual_name) = self.convert_legacy_ec(&sub_path, &name, &parsed) else {
                    continue;
                };

                self.scan_add_chunk(folder, sub_path.join(&actual_name), &parsed, layout);

                check_count += 1;
                if check_count >= 1000 {
                    if folder.inner.lock().scan_state == ScanState::Terminate {
                        terminate = true;
                    }
                    check_count = 0;
                }
            }

            let now = wall_time_secs();
            let percent = (sub * 100 / SUBFOLDER_COUNT) as u8;
            if percent > last_percent && now > last_time {
                last_percent = percent;
                last_time = now;
                folder.scan_progress.store(percent, Ordering::Relaxed);
                // Report the growing chunk count to the master.
                self.space_changed.store(true, Ordering::Relaxed);
                info!(
                    folder = %folder.path.display(),
                    percent,
                    seconds = now - begin_time,
                    "scanning folder"
                );
            }
        }
    }

    /// Apply the legacy `_ec_` naming rule: parts of totals above 4 are
    /// dropped, the rest are renamed to `_ec2_`. Returns the surviving file
    /// name, or `None` when the file is gone.
    fn convert_legacy_ec(
        &self,
        sub_path: &Path,
        name: &str,
        parsed: &ParsedChunkFilename,
    ) -> Option<String> {
        if !parsed.legacy_ec {
            return Some(name.to_string());
        }
        let ChunkPartType::Ec2 { total, .. } = parsed.part_type else {
            return Some(name.to_string());
        };
        if total > 4 {
            if std::fs::remove_file(sub_path.join(name)).is_err() {
                error!(
                    file = %name,
                    dir = %sub_path.display(),
                    "failed to remove invalid chunk file"
                );
            }
            return None;
        }
        let new_name = name.replacen("_ec_", "_ec2_", 1);
        if std::fs::rename(sub_path.join(name), sub_path.join(&new_name)).is_err() {
            error!(
                file = %name,
                dir = %sub_path.display(),
                "failed to rename legacy chunk file"
            );
            return None;
        }
        Some(new_name)
    }

    /// Register one discovered chunk file. A higher version displaces (and
    /// unlinks) a previously seen copy; a format change recreates the
    /// registry entry.
    fn scan_add_chunk(
        &self,
        folder: &Arc<Folder>,
        full_path: std::path::PathBuf,
        parsed: &ParsedChunkFilename,
        layout: DirectoryLayout,
    ) {
        let Some(guard) = self.chunk_get(
            parsed.id,
            parsed.part_type,
            AcquireMode::Auto,
            Some(parsed.format),
        ) else {
            error!(file = %full_path.display(), "cannot use file as chunk");
            return;
        };

        let new_chunk = guard.filename().as_os_str().is_empty();
        if !new_chunk {
            if parsed.version <= guard.version() {
                // The copy we already registered is newer.
                if !folder.is_read_only() {
                    let _ = std::fs::remove_file(&full_path);
                }
                return;
            }
            if !folder.is_read_only() {
                let _ = std::fs::remove_file(guard.filename());
            }
        }

        let guard = if guard.format != parsed.format || !new_chunk {
            let key = guard.key();
            let mut reg = self.registry.lock();
            let old = guard.dismiss();
            let chunk = self.chunk_recreate_locked(&mut reg, Some(old), key, parsed.format);
            drop(reg);
            ChunkGuard::new(self, chunk)
        } else {
            guard
        };

        {
            let mut inner = guard.chunk().inner.lock();
            inner.version = parsed.version;
            inner.blocks = 0;
            inner.validattr = false;
            inner.owner = Arc::downgrade(folder);
            inner.layout = layout;
            inner.filename = full_path;
        }
        folder.chunks.lock().insert(guard.key());

        if new_chunk {
            self.report_new_chunk(
                guard.id,
                parsed.version,
                folder.is_marked_for_deletion(),
                guard.part_type,
            );
        }
    }

    /// Move chunks from the legacy directory layout into the current one,
    /// then remove the emptied legacy directories. Rate-limited to one move
    /// per millisecond. Returns the number of chunks moved.
    pub(crate) fn migrate_directories(&self, folder: &Arc<Folder>) -> i64 {
        if folder.inner.lock().migrate_state == MigrateState::Terminate {
            return 0;
        }

        let mut count = 0i64;
        let mut terminate = false;
        let mut check_count = 0u32;

        for sub in 0..SUBFOLDER_COUNT {
            if terminate {
                break;
            }
            let sub_path = folder.path.join(subfolder_name(sub, DirectoryLayout::Legacy));
            let Ok(entries) = std::fs::read_dir(&sub_path) else {
                continue;
            };

            for entry in entries.flatten() {
                if terminate {
                    break;
                }
                let name_os = entry.file_name();
                let name = name_os.to_string_lossy();
                let Some(parsed) = parse_chunk_filename(&name) else {
                    continue;
                };
                if subfolder_number(parsed.id) != sub {
                    continue;
                }

                let Some(chunk) = self.chunk_find(parsed.id, parsed.part_type) else {
                    continue;
                };
                if chunk.filename() != sub_path.join(&*name) {
                    continue;
                }
                let version = chunk.version();
                if let Err(e) = chunk.rename_file(version) {
                    // Probably something structural (read-only fs, wrong
                    // permissions, new dirs on another mountpoint); stop
                    // moving chunks.
                    warn!(
                        file = %chunk.filename().display(),
                        error = %e,
                        "cannot migrate chunk"
                    );
                    terminate = true;
                }
                drop(chunk);
                count += 1;

                check_count += 1;
                if check_count >= 100 {
                    if folder.inner.lock().migrate_state == MigrateState::Terminate {
                        terminate = true;
                    }
                    check_count = 0;
                }

                // Micro sleep to keep migration from loading the disk.
                if !terminate {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }

            if !terminate && std::fs::remove_dir(&sub_path).is_err() {
                warn!(dir = %sub_path.display(), "cannot remove old directory");
            }
        }

        count
    }
}
