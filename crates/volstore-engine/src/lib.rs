//! volstore engine: crash-consistent block volumes over raw devices.
//!
//! [`Engine::start`] opens (or first-time formats) the device set, builds
//! the three internal vdevs (striped data with a slab allocator, an
//! append-log journal, and a meta vdev holding the registry) and
//! recovers volumes by replaying the journal over the last checkpoint's
//! snapshots. All user I/O flows through the [`volume::VolumeManager`]
//! pipeline; checkpoints are driven by [`Engine::trigger_checkpoint`]
//! (typically from a periodic timer) and by the journal's high-watermark
//! callback.

pub mod blkalloc;
pub mod checkpoint;
pub mod index;
pub mod logdev;
pub mod metablk;
pub mod volume;

use blkalloc::{AllocPolicy, BlkStore};
use checkpoint::{CpCoordinator, CpHandler};
use logdev::LogDevice;
use metablk::MetaRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use volume::{EngineCpState, MemReleaseConfig, VolState, Volume, VolumeManager, VolumeParams};
use volstore_common::types::MAX_BLKS_PER_UNIT;
use volstore_common::{EngineConfig, Error, Lba, Result};
use volstore_device::dm::DmConfig;
use volstore_device::{DeviceManager, VirtualDev};

/// Context tags identifying each internal vdev in its descriptor
const CTX_DATA: &[u8] = b"volstore:data";
const CTX_LOG: &[u8] = b"volstore:log";
const CTX_META: &[u8] = b"volstore:meta";

/// Registry sub-type for engine-level markers
const SUB_ENGINE: &str = "engine";
const CLEAN_SHUTDOWN_KEY: u128 = 0;

/// Outcome of [`Engine::start`]
#[derive(Debug, Clone, Copy)]
pub struct StartupInfo {
    pub first_time_boot: bool,
    pub max_io_size: u64,
}

/// The engine context: explicit, built once, torn down by `shutdown`
pub struct Engine {
    config: EngineConfig,
    dm: Arc<DeviceManager>,
    registry: Arc<MetaRegistry>,
    logdev: Arc<LogDevice>,
    volmgr: Arc<VolumeManager>,
    cp: Arc<CpCoordinator<EngineCpState>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Open the configured devices and bring the engine online.
    /// Formats everything when no device carries a valid superblock.
    pub fn start(config: EngineConfig) -> Result<(Arc<Engine>, StartupInfo)> {
        config.validate()?;

        let dm = DeviceManager::new(DmConfig {
            open_mode: config.open_mode,
            phys_page_size: config.phys_page_size,
            atomic_page_size: config.atomic_page_size,
            system_uuid: config.system_uuid,
            max_error_before_marking_dev_down: config.max_error_before_marking_dev_down,
        });

        let first_time = !dm.any_device_formatted(&config.devices)?;
        dm.add_devices(&config.devices, first_time)?;

        let page = config.min_virtual_page_size;
        let hwm = config.vdev_high_watermark_percent;

        let (registry, logdev, volmgr, cp) = if first_time {
            Self::format_stores(&config, &dm, page, hwm)?
        } else {
            Self::recover_stores(&config, &dm, hwm)?
        };

        let engine = Arc::new(Engine {
            config,
            dm: dm.clone(),
            registry: registry.clone(),
            logdev: logdev.clone(),
            volmgr: volmgr.clone(),
            cp: cp.clone(),
            shut_down: AtomicBool::new(false),
        });

        // Wire the handler and the event paths.
        let volmgr_dyn: Arc<dyn CpHandler<EngineCpState>> = volmgr.clone();
        let weak: Weak<dyn CpHandler<EngineCpState>> = Arc::downgrade(&volmgr_dyn);
        cp.set_handler(weak);

        {
            // Log space pressure forces a space-reclaiming checkpoint.
            let cp = cp.clone();
            logdev.vdev().set_high_watermark_cb(move |pct| {
                info!(pct, "journal high watermark, forcing blkalloc checkpoint");
                cp.current().ctx.request_blkalloc_cp();
                cp.trigger();
            });
        }
        {
            // A device past its error threshold fails the live volumes.
            let volmgr = Arc::downgrade(&volmgr);
            dm.set_vdev_error_cb(move |vdev_id| {
                warn!(vdev = %vdev_id, "vdev error reported");
                if let Some(volmgr) = volmgr.upgrade() {
                    volmgr.mark_volumes_failed();
                }
            });
        }

        // Clean-shutdown marker: consume it so the next boot after a
        // crash sees its absence.
        let clean = engine.registry.get(SUB_ENGINE, CLEAN_SHUTDOWN_KEY).is_some();
        if !first_time {
            info!(clean, "boot state");
            engine.registry.remove(SUB_ENGINE, CLEAN_SHUTDOWN_KEY);
            engine.registry.persist()?;
        }

        // A destroy interrupted by the crash finishes now.
        if engine.volmgr.has_pending_destroy() {
            engine.trigger_checkpoint(true);
        }

        let info = StartupInfo {
            first_time_boot: first_time,
            max_io_size: u64::from(page) * u64::from(MAX_BLKS_PER_UNIT),
        };
        info!(first_time, "engine started");
        Ok((engine, info))
    }

    #[allow(clippy::type_complexity)]
    fn format_stores(
        config: &EngineConfig,
        dm: &Arc<DeviceManager>,
        page: u32,
        hwm: u8,
    ) -> Result<(
        Arc<MetaRegistry>,
        Arc<LogDevice>,
        Arc<VolumeManager>,
        Arc<CpCoordinator<EngineCpState>>,
    )> {
        let min_chunk = config.min_chunk_size();
        let total = dm.total_capacity();

        let meta_size = min_chunk;
        let data_size = if config.data_vdev_size > 0 {
            config.data_vdev_size
        } else {
            total * 60 / 100
        };
        let log_size = if config.log_vdev_size > 0 {
            config.log_vdev_size
        } else {
            (total / 20).max(min_chunk * u64::from(dm.pdev_count()))
        };

        let meta_vdev =
            VirtualDev::create(dm.clone(), "meta", meta_size, 0, page, false, CTX_META, hwm)?;
        let data_vdev = VirtualDev::create(
            dm.clone(),
            "data",
            data_size,
            config.data_mirrors,
            page,
            true,
            CTX_DATA,
            hwm,
        )?;
        let log_vdev =
            VirtualDev::create(dm.clone(), "journal", log_size, 0, page, true, CTX_LOG, hwm)?;

        let registry = Arc::new(MetaRegistry::format(meta_vdev));
        registry.persist()?;

        let data_store = Arc::new(BlkStore::new(
            data_vdev,
            AllocPolicy::Variable(config.slabs.clone()),
        ));
        let logdev = Arc::new(LogDevice::new(log_vdev));
        let cp = CpCoordinator::new(EngineCpState::first(1));
        let volmgr = VolumeManager::new(
            cp.clone(),
            logdev.clone(),
            registry.clone(),
            data_store,
            Self::mem_cfg(config),
        );
        Ok((registry, logdev, volmgr, cp))
    }

    #[allow(clippy::type_complexity)]
    fn recover_stores(
        config: &EngineConfig,
        dm: &Arc<DeviceManager>,
        hwm: u8,
    ) -> Result<(
        Arc<MetaRegistry>,
        Arc<LogDevice>,
        Arc<VolumeManager>,
        Arc<CpCoordinator<EngineCpState>>,
    )> {
        let mut meta_vdev = None;
        let mut data_vdev = None;
        let mut log_vdev = None;
        for desc in dm.vdevs() {
            let name = if desc.context_data.starts_with(CTX_META) {
                "meta"
            } else if desc.context_data.starts_with(CTX_DATA) {
                "data"
            } else if desc.context_data.starts_with(CTX_LOG) {
                "journal"
            } else {
                warn!(vdev = %desc.vdev_id, "unrecognized vdev, leaving it alone");
                continue;
            };
            let vdev = VirtualDev::load(dm.clone(), desc.vdev_id, name, hwm)?;
            match name {
                "meta" => meta_vdev = Some(vdev),
                "data" => data_vdev = Some(vdev),
                _ => log_vdev = Some(vdev),
            }
        }
        let meta_vdev = meta_vdev.ok_or_else(|| Error::io_error("meta vdev missing"))?;
        let data_vdev = data_vdev.ok_or_else(|| Error::io_error("data vdev missing"))?;
        let log_vdev = log_vdev.ok_or_else(|| Error::io_error("journal vdev missing"))?;
        if meta_vdev.is_failed() {
            // Without the registry nothing else can be trusted.
            return Err(Error::io_error(
                "meta vdev lost a device; engine state is unrecoverable",
            ));
        }

        let registry = Arc::new(MetaRegistry::open(meta_vdev)?);

        let mut data_store =
            BlkStore::new(data_vdev, AllocPolicy::Variable(config.slabs.clone()));
        VolumeManager::restore_bitmaps(&registry, &mut data_store)?;
        let data_store = Arc::new(data_store);

        let logdev = Arc::new(LogDevice::new(log_vdev));

        // The first epoch after boot continues the persisted counters.
        let base_cp = registry
            .entries_of(volume::SUB_CPSB)
            .iter()
            .filter_map(|(_, blob)| bincode::deserialize::<volume::CpSuperblock>(blob).ok())
            .map(|sb| sb.cp_cnt)
            .max()
            .unwrap_or(0);
        let cp = CpCoordinator::new(EngineCpState::first(base_cp + 1));
        let volmgr = VolumeManager::new(
            cp.clone(),
            logdev.clone(),
            registry.clone(),
            data_store,
            Self::mem_cfg(config),
        );
        volmgr.load_from_registry()?;

        // Replay the journal over the recovered snapshots.
        let vm = volmgr.clone();
        logdev.recover(move |store, seq, payload| {
            if let Err(e) = vm.replay_record(store, seq, &payload) {
                warn!(store, seq, "journal replay failed for a record: {e}");
            }
        })?;
        volmgr.recovery_done();

        Ok((registry, logdev, volmgr, cp))
    }

    fn mem_cfg(config: &EngineConfig) -> MemReleaseConfig {
        MemReleaseConfig {
            app_mem_size: config.app_mem_size,
            soft_threshold_pct: config.soft_mem_release_threshold,
            aggressive_threshold_pct: config.aggressive_mem_release_threshold,
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Busy("engine is shut down".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.dm
    }

    #[must_use]
    pub fn volume_manager(&self) -> &Arc<VolumeManager> {
        &self.volmgr
    }

    #[must_use]
    pub fn log_device(&self) -> &Arc<LogDevice> {
        &self.logdev
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- volume API --------------------------------------------------

    pub fn create_volume(&self, params: VolumeParams) -> Result<Arc<Volume>> {
        self.check_running()?;
        self.volmgr.create_volume(params)
    }

    pub fn volume(&self, uuid: Uuid) -> Result<Arc<Volume>> {
        self.volmgr.volume(uuid)
    }

    #[must_use]
    pub fn list_volumes(&self) -> Vec<Arc<Volume>> {
        self.volmgr.list_volumes()
    }

    pub fn write(&self, uuid: Uuid, lba: Lba, data: &[u8]) -> Result<()> {
        self.check_running()?;
        let max = u64::from(self.config.min_virtual_page_size) * u64::from(MAX_BLKS_PER_UNIT);
        if data.len() as u64 > max {
            return Err(Error::io_error(format!(
                "write of {} bytes exceeds max_io_size {max}",
                data.len()
            )));
        }
        self.volmgr.write(uuid, lba, data)
    }

    pub fn read(&self, uuid: Uuid, lba: Lba, n_lbas: u32) -> Result<Vec<u8>> {
        self.check_running()?;
        self.volmgr.read(uuid, lba, n_lbas)
    }

    pub fn unmap(&self, uuid: Uuid, lba: Lba, n_lbas: u32) -> Result<()> {
        self.check_running()?;
        self.volmgr.unmap(uuid, lba, n_lbas)
    }

    pub fn destroy_volume(&self, uuid: Uuid) -> Result<()> {
        self.check_running()?;
        self.volmgr.destroy(uuid)
    }

    pub fn set_volume_state(&self, uuid: Uuid, state: VolState) -> Result<()> {
        self.check_running()?;
        self.volmgr.set_volume_state(uuid, state)
    }

    // ---- checkpoints and shutdown ------------------------------------

    /// Roll the checkpoint epoch. With `blkalloc` set the flush also
    /// persists allocator bitmaps and reclaims journal space.
    pub fn trigger_checkpoint(&self, blkalloc: bool) -> bool {
        if blkalloc {
            self.cp.current().ctx.request_blkalloc_cp();
        }
        self.cp.trigger()
    }

    /// Graceful shutdown: a final space-reclaiming checkpoint bounded by
    /// the configured timeout, then the clean-shutdown marker. Forced
    /// shutdown skips both, leaving the next boot to treat the state as
    /// crashed. Returns whether the shutdown was clean.
    pub fn shutdown(&self, force: bool) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        if force {
            info!("forced shutdown");
            return false;
        }

        self.trigger_checkpoint(true);
        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        while self.cp.in_flight() {
            if Instant::now() >= deadline {
                warn!("shutdown drain timed out, elevating to force");
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        self.registry.put(SUB_ENGINE, CLEAN_SHUTDOWN_KEY, vec![1]);
        if let Err(e) = self.registry.persist() {
            warn!("clean-shutdown marker write failed: {e}");
            return false;
        }
        info!("clean shutdown");
        true
    }

    /// Capacity summary: (used bytes, total data bytes)
    #[must_use]
    pub fn capacity(&self) -> (u64, u64) {
        let store = self.volmgr.data_store();
        let page = u64::from(store.page_size());
        let total = store.vdev().size();
        let used = total - store.free_count() * page;
        (used, total)
    }
}
