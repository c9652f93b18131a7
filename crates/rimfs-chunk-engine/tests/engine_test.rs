//! End-to-end tests of the chunk engine against real temp directories.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rimfs_chunk_engine::{
    empty_block_crc, ChunkPartType, HddEngine, BLOCK_SIZE,
};
use rimfs_config::HddConfig;
use rimfs_types::status_code::ChunkCode;
use rimfs_types::ChunkId;
use rimfs_utils::{crc32, crc32_zero_expanded};

const STD: ChunkPartType = ChunkPartType::Standard;

struct TestEnv {
    _root: tempfile::TempDir,
    data_dir: PathBuf,
    engine: Arc<HddEngine>,
}

fn make_config(root: &Path, split_format: bool) -> (HddConfig, PathBuf) {
    let data_dir = root.join("hdd0");
    std::fs::create_dir_all(&data_dir).unwrap();
    let cfg_file = root.join("hdd.cfg");
    std::fs::write(&cfg_file, format!("{}/\n", data_dir.display())).unwrap();

    let config = HddConfig {
        hdd_conf_filename: cfg_file,
        hdd_test_freq_secs: 0.001,
        advise_no_cache: false,
        perform_fsync: false,
        punch_holes: false,
        create_new_chunks_in_split_format: split_format,
        leave_free_default: "0".to_string(),
    };
    (config, data_dir)
}

/// Build an engine over a fresh temp folder and tick it until the folder is
/// scanned and usable.
fn setup(split_format: bool) -> TestEnv {
    let root = tempfile::tempdir().unwrap();
    let (config, data_dir) = make_config(root.path(), split_format);
    let engine = HddEngine::new(&config).unwrap();
    wait_for_working(&engine);
    TestEnv {
        _root: root,
        data_dir,
        engine,
    }
}

fn wait_for_working(engine: &Arc<HddEngine>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        engine.check_folders();
        if engine.get_space().total_space > 0 {
            return;
        }
        assert!(Instant::now() < deadline, "folder never became usable");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn full_block(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE as usize]
}

fn write_full_block(engine: &HddEngine, id: ChunkId, version: u32, block: u16, byte: u8) {
    let data = full_block(byte);
    engine
        .write(id, version, STD, block, 0, BLOCK_SIZE, crc32(0, &data), &data)
        .unwrap();
}

/// Read one block and split the response into (crc, data).
fn read_block(engine: &HddEngine, id: ChunkId, version: u32, block: u16) -> (u32, Vec<u8>) {
    let mut out = Vec::new();
    engine
        .read(
            id,
            version,
            STD,
            block as u32 * BLOCK_SIZE,
            BLOCK_SIZE,
            0,
            0,
            &mut out,
        )
        .unwrap();
    assert_eq!(out.len(), 4 + BLOCK_SIZE as usize);
    let crc = u32::from_be_bytes(out[..4].try_into().unwrap());
    (crc, out[4..].to_vec())
}

#[test]
fn test_create_write_read_delete_split() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0x42);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();

    write_full_block(engine, id, 1, 0, 0xAA);
    let (crc, data) = read_block(engine, id, 1, 0);
    assert_eq!(data, full_block(0xAA));
    assert_eq!(crc, crc32(0, &full_block(0xAA)));

    engine.close_chunk(id, STD).unwrap();

    let chunk_file = env
        .data_dir
        .join("chunks42")
        .join("chunk_0000000000000042_00000001.csf");
    assert!(chunk_file.exists());

    engine.delete_chunk(id, 1, STD).unwrap();
    assert!(!chunk_file.exists());
    assert_eq!(engine.chunk_count(), 0);
}

#[test]
fn test_full_block_write_idempotent() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(7);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0x5A);
    write_full_block(engine, id, 1, 0, 0x5A);
    engine.close_chunk(id, STD).unwrap();

    engine.open_chunk(id, STD).unwrap();
    let (crc, data) = read_block(engine, id, 1, 0);
    assert_eq!(data, full_block(0x5A));
    assert_eq!(crc, crc32(0, &data));
    engine.close_chunk(id, STD).unwrap();
}

#[test]
fn test_partial_write_then_read_roundtrip() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(8);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0x11);

    // Overwrite a sub-range of the block.
    let patch = vec![0x99u8; 512];
    engine
        .write(id, 1, STD, 0, 4096, 512, crc32(0, &patch), &patch)
        .unwrap();

    // Whole block reads back as base data with the patch applied.
    let mut expected = full_block(0x11);
    expected[4096..4096 + 512].copy_from_slice(&patch);
    let (crc, data) = read_block(engine, id, 1, 0);
    assert_eq!(data, expected);
    assert_eq!(crc, crc32(0, &expected));

    // Sub-range read covers exactly the patched bytes.
    let mut out = Vec::new();
    engine.read(id, 1, STD, 4096, 512, 0, 0, &mut out).unwrap();
    assert_eq!(&out[4..], &patch[..]);
    assert_eq!(
        u32::from_be_bytes(out[..4].try_into().unwrap()),
        crc32(0, &patch)
    );

    engine.close_chunk(id, STD).unwrap();
}

#[test]
fn test_partial_write_equals_full_write() {
    // A partial write must leave the same stored CRC as a full-block write
    // of the resulting content.
    let env = setup(true);
    let engine = &env.engine;
    let a = ChunkId(21);
    let b = ChunkId(22);

    let mut content = full_block(0x33);
    content[100..200].fill(0x44);

    engine.create_chunk(a, 1, STD).unwrap();
    engine.open_chunk(a, STD).unwrap();
    write_full_block(engine, a, 1, 0, 0x33);
    engine
        .write(a, 1, STD, 0, 100, 100, crc32(0, &content[100..200]), &content[100..200])
        .unwrap();
    engine.close_chunk(a, STD).unwrap();

    engine.create_chunk(b, 1, STD).unwrap();
    engine.open_chunk(b, STD).unwrap();
    engine
        .write(b, 1, STD, 0, 0, BLOCK_SIZE, crc32(0, &content), &content)
        .unwrap();
    engine.close_chunk(b, STD).unwrap();

    engine.open_chunk(a, STD).unwrap();
    engine.open_chunk(b, STD).unwrap();
    let (crc_a, data_a) = read_block(engine, a, 1, 0);
    let (crc_b, data_b) = read_block(engine, b, 1, 0);
    assert_eq!(data_a, data_b);
    assert_eq!(crc_a, crc_b);
    engine.close_chunk(a, STD).unwrap();
    engine.close_chunk(b, STD).unwrap();
}

#[test]
fn test_reads_past_end_return_zeros() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(9);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    let (crc, data) = read_block(engine, id, 1, 5);
    assert_eq!(data, vec![0u8; BLOCK_SIZE as usize]);
    assert_eq!(crc, empty_block_crc());
    engine.close_chunk(id, STD).unwrap();
}

#[test]
fn test_partial_write_detects_on_disk_corruption() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0x51);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    let zeros = full_block(0);
    engine
        .write(id, 1, STD, 0, 0, BLOCK_SIZE, empty_block_crc(), &zeros)
        .unwrap();
    engine.close_chunk(id, STD).unwrap();

    // Flip one data byte behind the engine's back.
    let chunk_file = env
        .data_dir
        .join("chunks51")
        .join("chunk_0000000000000051_00000001.csf");
    let file = OpenOptions::new().write(true).open(&chunk_file).unwrap();
    file.write_all_at(&[0xFF], 5120 + 10).unwrap();
    drop(file);

    engine.open_chunk(id, STD).unwrap();
    let patch = vec![0x77u8; 8];
    let err = engine
        .write(id, 1, STD, 0, 10, 8, crc32(0, &patch), &patch)
        .unwrap_err();
    assert_eq!(err.code(), ChunkCode::CRC_MISMATCH);
    engine.close_chunk(id, STD).unwrap();

    let damaged = engine.get_damaged_chunks(16);
    assert!(damaged.iter().any(|d| d.id == id));
}

#[test]
fn test_version_mismatch() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0x60);

    engine.create_chunk(id, 7, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();

    let data = full_block(0xAB);
    let crc = crc32(0, &data);
    let err = engine
        .write(id, 8, STD, 0, 0, BLOCK_SIZE, crc, &data)
        .unwrap_err();
    assert_eq!(err.code(), ChunkCode::WRONG_VERSION);

    // Version zero means "any".
    engine.write(id, 0, STD, 0, 0, BLOCK_SIZE, crc, &data).unwrap();
    engine.close_chunk(id, STD).unwrap();
}

#[test]
fn test_set_version_rewrites_header_and_filename() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0x70);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.set_chunk_version(id, 1, 5, STD).unwrap();

    let old_file = env
        .data_dir
        .join("chunks70")
        .join("chunk_0000000000000070_00000001.csf");
    let new_file = env
        .data_dir
        .join("chunks70")
        .join("chunk_0000000000000070_00000005.csf");
    assert!(!old_file.exists());
    assert!(new_file.exists());

    // Version field sits at offset 24 of the signature.
    let raw = std::fs::read(&new_file).unwrap();
    assert_eq!(&raw[24..28], &5u32.to_be_bytes());

    engine.check_version(id, 5).unwrap();
    assert_eq!(
        engine.check_version(id, 4).unwrap_err().code(),
        ChunkCode::WRONG_VERSION
    );
}

#[test]
fn test_truncate_shrink_and_grow() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0x80);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0xA1);
    write_full_block(engine, id, 1, 1, 0xA2);
    write_full_block(engine, id, 1, 2, 0xA3);
    engine.close_chunk(id, STD).unwrap();

    // Shrink to one full block plus 4 bytes.
    let length = BLOCK_SIZE + 4;
    engine.truncate_chunk(id, STD, 1, 2, length).unwrap();
    assert_eq!(engine.get_blocks(id, STD, 2).unwrap(), 2);

    let chunk_file = env
        .data_dir
        .join("chunks80")
        .join("chunk_0000000000000080_00000002.csf");
    let md = std::fs::metadata(&chunk_file).unwrap();
    assert_eq!(md.len(), 5120 + 2 * BLOCK_SIZE as u64);

    engine.open_chunk(id, STD).unwrap();
    let (crc, data) = read_block(engine, id, 2, 1);
    let mut expected = vec![0u8; BLOCK_SIZE as usize];
    expected[..4].fill(0xA2);
    assert_eq!(data, expected);
    assert_eq!(crc, crc32_zero_expanded(0, &[0xA2; 4], BLOCK_SIZE as usize - 4));
    engine.close_chunk(id, STD).unwrap();

    // Grow back to three blocks; the tail reads as zeros.
    engine
        .truncate_chunk(id, STD, 2, 3, 3 * BLOCK_SIZE)
        .unwrap();
    assert_eq!(engine.get_blocks(id, STD, 3).unwrap(), 3);
    engine.open_chunk(id, STD).unwrap();
    let (crc, data) = read_block(engine, id, 3, 2);
    assert_eq!(data, vec![0u8; BLOCK_SIZE as usize]);
    assert_eq!(crc, empty_block_crc());
    engine.close_chunk(id, STD).unwrap();
}

#[test]
fn test_duptrunc() {
    let env = setup(true);
    let engine = &env.engine;
    let src = ChunkId(100);
    let dst = ChunkId(200);

    engine.create_chunk(src, 1, STD).unwrap();
    engine.open_chunk(src, STD).unwrap();
    write_full_block(engine, src, 1, 0, 0xAA);
    write_full_block(engine, src, 1, 1, 0xBB);
    write_full_block(engine, src, 1, 2, 0xCC);
    engine.close_chunk(src, STD).unwrap();

    engine
        .duptrunc_chunk(src, 1, 2, STD, dst, 1, BLOCK_SIZE + 4)
        .unwrap();

    // The source was version-bumped on disk.
    let src_file = env
        .data_dir
        .join("chunks64")
        .join("chunk_0000000000000064_00000002.csf");
    assert!(src_file.exists());
    let raw = std::fs::read(&src_file).unwrap();
    assert_eq!(&raw[24..28], &2u32.to_be_bytes());

    // The copy holds two blocks; the second is the zero-extended tail.
    assert_eq!(engine.get_blocks(dst, STD, 1).unwrap(), 2);
    engine.open_chunk(dst, STD).unwrap();

    let (crc0, data0) = read_block(engine, dst, 1, 0);
    assert_eq!(data0, full_block(0xAA));
    assert_eq!(crc0, crc32(0, &data0));

    let (crc1, data1) = read_block(engine, dst, 1, 1);
    let mut expected = vec![0u8; BLOCK_SIZE as usize];
    expected[..4].fill(0xBB);
    assert_eq!(data1, expected);
    assert_eq!(crc1, crc32_zero_expanded(0, &[0xBB; 4], BLOCK_SIZE as usize - 4));
    engine.close_chunk(dst, STD).unwrap();
}

#[test]
fn test_duplicate_whole_chunk() {
    let env = setup(true);
    let engine = &env.engine;
    let src = ChunkId(101);
    let dst = ChunkId(201);

    engine.create_chunk(src, 3, STD).unwrap();
    engine.open_chunk(src, STD).unwrap();
    write_full_block(engine, src, 3, 0, 0xD1);
    write_full_block(engine, src, 3, 1, 0xD2);
    engine.close_chunk(src, STD).unwrap();

    engine.duplicate_chunk(src, 3, 3, STD, dst, 9).unwrap();

    assert_eq!(engine.get_blocks(dst, STD, 9).unwrap(), 2);
    engine.open_chunk(dst, STD).unwrap();
    let (_, data0) = read_block(engine, dst, 9, 0);
    let (_, data1) = read_block(engine, dst, 9, 1);
    assert_eq!(data0, full_block(0xD1));
    assert_eq!(data1, full_block(0xD2));
    engine.close_chunk(dst, STD).unwrap();

    // Source is intact.
    engine.open_chunk(src, STD).unwrap();
    let (_, data) = read_block(engine, src, 3, 1);
    assert_eq!(data, full_block(0xD2));
    engine.close_chunk(src, STD).unwrap();
}

#[test]
fn test_interleaved_roundtrip_and_sparse() {
    let env = setup(false);
    let engine = &env.engine;
    let id = ChunkId(0x90);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0xE7);
    let (crc, data) = read_block(engine, id, 1, 0);
    assert_eq!(data, full_block(0xE7));
    assert_eq!(crc, crc32(0, &data));
    engine.close_chunk(id, STD).unwrap();

    // Growing the chunk creates sparse blocks: zero CRC bytes over zero
    // payload must read back as the empty-block CRC.
    engine
        .truncate_chunk(id, STD, 1, 2, 3 * BLOCK_SIZE)
        .unwrap();
    engine.open_chunk(id, STD).unwrap();
    let (crc, data) = read_block(engine, id, 2, 2);
    assert_eq!(data, vec![0u8; BLOCK_SIZE as usize]);
    assert_eq!(crc, empty_block_crc());
    engine.close_chunk(id, STD).unwrap();

    // The on-disk file has no header.
    let chunk_file = env
        .data_dir
        .join("chunks90")
        .join("chunk_0000000000000090_00000002.cif");
    let md = std::fs::metadata(&chunk_file).unwrap();
    assert_eq!(md.len(), 3 * (BLOCK_SIZE as u64 + 4));
}

#[test]
fn test_create_conflict() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0xA0);

    engine.create_chunk(id, 1, STD).unwrap();
    let err = engine.create_chunk(id, 2, STD).unwrap_err();
    assert_eq!(err.code(), ChunkCode::CHUNK_EXISTS);
}

#[test]
fn test_scanner_discovers_existing_chunks() {
    // Create chunks with one engine, then bring up a fresh engine over the
    // same folder and let its scanner find them.
    let root = tempfile::tempdir().unwrap();
    let (config, _) = make_config(root.path(), true);

    {
        let engine = HddEngine::new(&config).unwrap();
        wait_for_working(&engine);
        for i in 0..5u64 {
            engine.create_chunk(ChunkId(0x1000 + i), 1, STD).unwrap();
            engine.open_chunk(ChunkId(0x1000 + i), STD).unwrap();
            write_full_block(&engine, ChunkId(0x1000 + i), 1, 0, i as u8 + 1);
            engine.close_chunk(ChunkId(0x1000 + i), STD).unwrap();
        }
        engine.terminate();
    }

    let engine = HddEngine::new(&config).unwrap();
    wait_for_working(&engine);
    assert_eq!(engine.chunk_count(), 5);

    // Rediscovered chunks are reported as new and readable.
    let new = engine.get_new_chunks(100);
    assert_eq!(new.len(), 5);

    engine.open_chunk(ChunkId(0x1002), STD).unwrap();
    let (_, data) = read_block(&engine, ChunkId(0x1002), 1, 0);
    assert_eq!(data, full_block(3));
    engine.close_chunk(ChunkId(0x1002), STD).unwrap();
    engine.terminate();
}

#[test]
fn test_scrubber_detects_corruption() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0xB0);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0x42);
    engine.close_chunk(id, STD).unwrap();

    // Flip one data byte behind the engine's back.
    let chunk_file = env
        .data_dir
        .join("chunksB0")
        .join("chunk_00000000000000B0_00000001.csf");
    let file = OpenOptions::new().write(true).open(&chunk_file).unwrap();
    file.write_all_at(&[0x43], 5120 + 1000).unwrap();
    drop(file);

    // Run the background scrubber until it reports the damage.
    engine.start();
    let deadline = Instant::now() + Duration::from_secs(10);
    let damaged = loop {
        let damaged = engine.get_damaged_chunks(16);
        if !damaged.is_empty() {
            break damaged;
        }
        assert!(Instant::now() < deadline, "scrubber never found the corruption");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert!(damaged.iter().any(|d| d.id == id));
    engine.terminate();
}

#[test]
fn test_requested_verification_finds_corruption() {
    let env = setup(true);
    let engine = &env.engine;
    let id = ChunkId(0xC0);

    engine.create_chunk(id, 1, STD).unwrap();
    engine.open_chunk(id, STD).unwrap();
    write_full_block(engine, id, 1, 0, 0x10);
    engine.close_chunk(id, STD).unwrap();

    let chunk_file = env
        .data_dir
        .join("chunksC0")
        .join("chunk_00000000000000C0_00000001.csf");
    let file = OpenOptions::new().write(true).open(&chunk_file).unwrap();
    file.write_all_at(&[0x11], 5120).unwrap();
    drop(file);

    // A client-style verification fails with a CRC error.
    let err = engine.test_chunk_now(id, 1, STD).unwrap_err();
    assert_eq!(err.code(), ChunkCode::CRC_MISMATCH);

    // An intact chunk passes.
    let ok_id = ChunkId(0xC1);
    engine.create_chunk(ok_id, 1, STD).unwrap();
    engine.open_chunk(ok_id, STD).unwrap();
    write_full_block(engine, ok_id, 1, 0, 0x20);
    engine.close_chunk(ok_id, STD).unwrap();
    engine.test_chunk_now(ok_id, 1, STD).unwrap();
}

#[test]
fn test_lock_file_uniqueness() {
    // Two configured paths whose .lock files are the same inode must be
    // rejected.
    let root = tempfile::tempdir().unwrap();
    let dir_a = root.path().join("hdd-a");
    let dir_b = root.path().join("hdd-b");
    std::fs::create_dir_all(&dir_a).unwrap();
    std::fs::create_dir_all(&dir_b).unwrap();
    std::fs::write(dir_a.join(".lock"), b"").unwrap();
    std::fs::hard_link(dir_a.join(".lock"), dir_b.join(".lock")).unwrap();

    let cfg_file = root.path().join("hdd.cfg");
    std::fs::write(
        &cfg_file,
        format!("{}/\n{}/\n", dir_a.display(), dir_b.display()),
    )
    .unwrap();

    let config = HddConfig {
        hdd_conf_filename: cfg_file,
        leave_free_default: "0".to_string(),
        ..Default::default()
    };
    let err = HddEngine::new(&config).unwrap_err();
    assert!(err.describe().contains("lockfile"), "{}", err);
}

#[test]
fn test_concurrent_writers_one_chunk_object() {
    let env = setup(true);
    let engine = Arc::clone(&env.engine);
    let id = ChunkId(0xD0);

    engine.create_chunk(id, 1, STD).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u16 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for round in 0..8u16 {
                engine.open_chunk(id, STD).unwrap();
                let block = t * 8 + round;
                let data = vec![(t + 1) as u8; BLOCK_SIZE as usize];
                engine
                    .write(id, 1, STD, block, 0, BLOCK_SIZE, crc32(0, &data), &data)
                    .unwrap();
                engine.close_chunk(id, STD).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.chunk_count(), 1);
    assert_eq!(engine.get_blocks(id, STD, 1).unwrap(), 32);
    engine.test_chunk_now(id, 1, STD).unwrap();
}

#[test]
fn test_bulk_enumeration() {
    let env = setup(true);
    let engine = &env.engine;
    for i in 0..10u64 {
        engine.create_chunk(ChunkId(0x2000 + i), 1, STD).unwrap();
    }

    let mut seen = Vec::new();
    engine.for_each_chunk_in_bulks(
        |bulk| {
            assert!(bulk.len() <= 4);
            seen.extend(bulk.iter().map(|c| c.id));
        },
        4,
    );
    assert_eq!(seen.len(), 10);
}

#[test]
fn test_disk_info_and_space() {
    let env = setup(true);
    let engine = &env.engine;
    engine.create_chunk(ChunkId(1), 1, STD).unwrap();

    let space = engine.get_space();
    assert!(space.total_space > 0);
    assert_eq!(space.chunk_count, 1);

    let info = engine.disk_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].chunk_count, 1);
    assert!(!info[0].damaged);
    assert!(!info[0].to_delete);
    assert!(info[0].path.contains("hdd0"));
    assert!(info[0].total_space > 0);

    // Rotating the minute ring must not disturb the snapshot shape.
    engine.move_stats();
    let info = engine.disk_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].chunk_count, 1);
}
