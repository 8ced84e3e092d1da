//! End-to-end scenarios: first-time layout, durable write/read across
//! clean and crash reboots, concurrent writes racing a checkpoint,
//! device replacement, and allocator exhaustion.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use volstore_common::{EngineConfig, OpenMode};
use volstore_engine::volume::{VolState, VolumeParams};
use volstore_engine::Engine;

fn make_devices(dir: &TempDir, n: usize, dev_size: u64) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let path = dir.path().join(format!("pdev{i}"));
            let f = std::fs::File::create(&path).unwrap();
            f.set_len(dev_size).unwrap();
            path
        })
        .collect()
}

fn config(devices: Vec<PathBuf>) -> EngineConfig {
    let mut cfg = EngineConfig::new(devices);
    cfg.open_mode = OpenMode::BufferedIo;
    cfg.data_vdev_size = 128 << 20;
    cfg.log_vdev_size = 128 << 20;
    cfg
}

fn volume_params(size: u64) -> VolumeParams {
    VolumeParams {
        name: "vol0".into(),
        uuid: Uuid::new_v4(),
        size,
        page_size: 4096,
    }
}

#[test]
fn first_time_boot_stripes_data_vdev_across_pdevs() {
    let dir = TempDir::new().unwrap();
    // Two equal devices; an 8 GiB data vdev striped over both must come
    // out as one 4 GiB chunk per device.
    let devices = make_devices(&dir, 2, 64 << 30);
    let mut cfg = config(devices);
    cfg.data_vdev_size = 8 << 30;

    let (engine, info) = Engine::start(cfg).unwrap();
    assert!(info.first_time_boot);

    let data = engine.volume_manager().data_store().vdev().clone();
    assert_eq!(data.num_chunks(), 2);
    assert_eq!(data.chunk_size(), 4 << 30);
    assert_eq!(data.mirror_count(), 0);

    let dm = engine.device_manager();
    let chunks = dm.chunks_of_vdev(data.vdev_id());
    let pdevs: Vec<u32> = chunks.iter().map(|c| c.pdev_id.raw()).collect();
    assert!(pdevs.contains(&0) && pdevs.contains(&1), "one chunk per pdev");

    // The directory generation is identical on every device.
    let gens: Vec<u64> = dm
        .pdev_ids()
        .iter()
        .map(|id| dm.pdev(*id).unwrap().sb_gen())
        .collect();
    assert!(gens.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn write_survives_clean_reboot() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    let pattern = vec![0xABu8; 8 * 4096];

    {
        let (engine, info) = Engine::start(cfg.clone()).unwrap();
        assert!(info.first_time_boot);
        engine.create_volume(params).unwrap();
        engine.write(uuid, 0, &pattern).unwrap();
        assert!(engine.shutdown(false), "clean shutdown must succeed");
    }

    let (engine, info) = Engine::start(cfg).unwrap();
    assert!(!info.first_time_boot);
    assert_eq!(engine.read(uuid, 0, 8).unwrap(), pattern);

    // The whole range is one mapping of 8 lbas.
    let vol = engine.volume(uuid).unwrap();
    let extents = vol.mapped_extents(0, 8);
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0].1.n_lbas, 8);
}

#[test]
fn write_survives_crash_via_journal_replay() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    let pattern = vec![0xCDu8; 8 * 4096];

    {
        let (engine, _) = Engine::start(cfg.clone()).unwrap();
        engine.create_volume(params).unwrap();
        engine.write(uuid, 16, &pattern).unwrap();
        // No shutdown: the index snapshot was never flushed, only the
        // journal knows about this write.
    }

    let (engine, _) = Engine::start(cfg).unwrap();
    let out = engine.read(uuid, 16, 8).unwrap();
    assert_eq!(out, pattern, "replay must reinstall the journaled write");

    // Replaying the same record on the next boot stays a no-op.
    engine.shutdown(false);
}

#[test]
fn crash_after_checkpoint_replays_only_the_tail() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let params = volume_params(64 << 20);
    let uuid = params.uuid;

    {
        let (engine, _) = Engine::start(cfg.clone()).unwrap();
        engine.create_volume(params).unwrap();
        engine.write(uuid, 0, &vec![0x01u8; 4 * 4096]).unwrap();
        // Checkpoint persists the index and bitmaps and truncates the
        // journal; the next write exists only in the journal.
        assert!(engine.trigger_checkpoint(true));
        engine.write(uuid, 4, &vec![0x02u8; 4 * 4096]).unwrap();
    }

    let (engine, _) = Engine::start(cfg).unwrap();
    assert_eq!(engine.read(uuid, 0, 4).unwrap(), vec![0x01u8; 4 * 4096]);
    assert_eq!(engine.read(uuid, 4, 4).unwrap(), vec![0x02u8; 4 * 4096]);
}

#[test]
fn concurrent_writes_race_a_checkpoint() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let (engine, _) = Engine::start(cfg.clone()).unwrap();
    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    engine.create_volume(params).unwrap();

    let mut writers = Vec::new();
    for t in 0..2u64 {
        let engine: Arc<Engine> = engine.clone();
        writers.push(std::thread::spawn(move || {
            // Disjoint lba ranges per thread.
            for i in 0..16u64 {
                let lba = t * 1024 + i * 8;
                let fill = (t as u8 + 1) * 0x11 ^ i as u8;
                engine.write(uuid, lba, &vec![fill; 8 * 4096]).unwrap();
            }
        }));
    }
    for _ in 0..8 {
        engine.trigger_checkpoint(true);
        std::thread::yield_now();
    }
    for w in writers {
        w.join().unwrap();
    }

    // Every write completed and reads back intact.
    for t in 0..2u64 {
        for i in 0..16u64 {
            let lba = t * 1024 + i * 8;
            let fill = (t as u8 + 1) * 0x11 ^ i as u8;
            assert_eq!(engine.read(uuid, lba, 8).unwrap(), vec![fill; 8 * 4096]);
        }
    }

    // No mapped block is free in the allocator.
    let vol = engine.volume(uuid).unwrap();
    for t in 0..2u64 {
        for (_, v) in vol.mapped_extents(t * 1024, 16 * 8) {
            assert!(engine.volume_manager().data_store().is_allocated(v.block_id));
        }
    }
}

#[test]
fn pulled_pdev_is_replaced_by_spare_and_vdevs_fail() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices.clone());

    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    let gen_before;
    {
        let (engine, _) = Engine::start(cfg.clone()).unwrap();
        engine.create_volume(params).unwrap();
        engine.write(uuid, 0, &vec![0x5Au8; 8 * 4096]).unwrap();
        engine.shutdown(false);
        gen_before = {
            // Reopen cheaply to read the generation.
            let (engine, _) = Engine::start(cfg.clone()).unwrap();
            let g = engine.device_manager().generation();
            engine.shutdown(false);
            g
        };
    }

    // Pull pdev 1 between boots and supply a fresh device of the same
    // size.
    std::fs::remove_file(&devices[1]).unwrap();
    let f = std::fs::File::create(&devices[1]).unwrap();
    f.set_len(1 << 30).unwrap();

    let (engine, info) = Engine::start(cfg).unwrap();
    assert!(!info.first_time_boot);
    assert!(engine.device_manager().generation() > gen_before);

    // Every vdev with a chunk on the lost device is failed, and reads
    // from the volume now error out.
    let data = engine.volume_manager().data_store().vdev().clone();
    assert!(data.is_failed());
    assert!(engine.read(uuid, 0, 8).is_err());
}

#[test]
fn allocator_rolls_devices_then_reports_no_space() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let mut cfg = config(devices);
    // Smallest legal data vdev: one 32 MiB chunk per device.
    cfg.data_vdev_size = 64 << 20;

    let (engine, _) = Engine::start(cfg).unwrap();
    let params = volume_params(256 << 20);
    let uuid = params.uuid;
    engine.create_volume(params).unwrap();

    // Fill until the allocator runs dry.
    let chunk = vec![0x99u8; 32 * 4096];
    let mut written = 0u64;
    let err = loop {
        match engine.write(uuid, written * 32, &chunk) {
            Ok(()) => written += 1,
            Err(e) => break e,
        }
    };
    assert!(err.is_no_space(), "expected NoSpace, got {err}");

    // Both devices were consumed before giving up: mappings exist on
    // both chunks of the striped vdev.
    let vol = engine.volume(uuid).unwrap();
    let mut chunks_used = std::collections::HashSet::new();
    for (_, v) in vol.mapped_extents(0, (written * 32) as u32) {
        chunks_used.insert(v.block_id.chunk_id());
    }
    assert_eq!(chunks_used.len(), 2, "round-robin must reach every device");

    // Everything written before exhaustion still reads back.
    assert_eq!(engine.read(uuid, 0, 32).unwrap(), chunk);
}

#[test]
fn destroy_survives_reboot_between_journal_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    {
        let (engine, _) = Engine::start(cfg.clone()).unwrap();
        engine.create_volume(params).unwrap();
        engine.write(uuid, 0, &vec![0x42u8; 8 * 4096]).unwrap();
        engine.destroy_volume(uuid).unwrap();
        // The volume is gone already on this boot.
        assert!(engine.volume(uuid).is_err());
    }

    // And stays gone after a reboot.
    let (engine, _) = Engine::start(cfg).unwrap();
    assert!(engine.volume(uuid).is_err());
    assert!(engine.list_volumes().is_empty());
}

#[test]
fn offline_state_persists_across_reboot() {
    let dir = TempDir::new().unwrap();
    let devices = make_devices(&dir, 2, 1 << 30);
    let cfg = config(devices);

    let params = volume_params(64 << 20);
    let uuid = params.uuid;
    {
        let (engine, _) = Engine::start(cfg.clone()).unwrap();
        engine.create_volume(params).unwrap();
        engine.set_volume_state(uuid, VolState::Offline).unwrap();
        engine.shutdown(false);
    }

    let (engine, _) = Engine::start(cfg).unwrap();
    let vol = engine.volume(uuid).unwrap();
    assert_eq!(vol.state(), VolState::Offline);
    assert!(engine.write(uuid, 0, &[0u8; 4096]).is_err());
}
