//! Log device.
//!
//! Appends opaque records to a vdev in append-log mode on behalf of any
//! number of *stores*. Each record carries a 512-byte header slot with
//! the store id, the caller-issued sequence number, a payload CRC and the
//! previous record's CRC; the chain lets recovery stop at the first torn
//! or stale record. Appends return only after the record is durable.
//!
//! Truncation is two-level: `truncate(store, seq)` retires a store's
//! records up to a sequence number, and `device_truncate` advances the
//! vdev's durable `data_start_offset` to the minimum offset any store
//! still needs.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use volstore_common::checksum::compute_crc32c;
use volstore_common::types::{round_up, MAGIC};
use volstore_common::{Error, Result, SeqNum};
use volstore_device::VirtualDev;

/// Every record starts on this grid and its header fills one slot
pub const LOG_RECORD_ALIGN: u64 = 512;

const HEADER_FIELDS_SIZE: usize = 8 + 4 + 4 + 8 + 4 + 4 + 4;

struct RecordHeader {
    store_id: u32,
    seq: SeqNum,
    len: u32,
    crc: u32,
    prev_crc: u32,
}

impl RecordHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_RECORD_ALIGN as usize);
        buf.put_u64_le(MAGIC);
        buf.put_u32_le(self.store_id);
        buf.put_u32_le(0); // reserved
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc);
        buf.put_u32_le(self.prev_crc);
        buf.resize(LOG_RECORD_ALIGN as usize, 0);
        buf
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_FIELDS_SIZE {
            return None;
        }
        let mut buf = data;
        if buf.get_u64_le() != MAGIC {
            return None;
        }
        let store_id = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let seq = buf.get_u64_le();
        let len = buf.get_u32_le();
        let crc = buf.get_u32_le();
        let prev_crc = buf.get_u32_le();
        Some(Self {
            store_id,
            seq,
            len,
            crc,
            prev_crc,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordLoc {
    offset: u64,
    total: u64,
}

struct StoreState {
    /// Sequence numbers at or below this are retired
    truncated_to: SeqNum,
    records: BTreeMap<SeqNum, RecordLoc>,
}

struct LogInner {
    stores: BTreeMap<u32, StoreState>,
    next_store_id: u32,
    last_crc: u32,
}

/// Append-only record store multiplexer over one append-log vdev
pub struct LogDevice {
    vdev: Arc<VirtualDev>,
    inner: Mutex<LogInner>,
}

impl LogDevice {
    #[must_use]
    pub fn new(vdev: Arc<VirtualDev>) -> Self {
        Self {
            vdev,
            inner: Mutex::new(LogInner {
                stores: BTreeMap::new(),
                next_store_id: 0,
                last_crc: 0,
            }),
        }
    }

    #[must_use]
    pub fn vdev(&self) -> &Arc<VirtualDev> {
        &self.vdev
    }

    /// Register a new store and return its id
    pub fn create_store(&self) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_store_id;
        inner.next_store_id += 1;
        inner.stores.insert(
            id,
            StoreState {
                truncated_to: 0,
                records: BTreeMap::new(),
            },
        );
        debug!(store = id, "created log store");
        id
    }

    /// Forget a store entirely (volume destroy); its space is reclaimed
    /// by the next `device_truncate`.
    pub fn remove_store(&self, store_id: u32) {
        self.inner.lock().stores.remove(&store_id);
    }

    #[must_use]
    pub fn store_ids(&self) -> Vec<u32> {
        self.inner.lock().stores.keys().copied().collect()
    }

    /// Append a record under a caller-issued sequence number. Returns
    /// after the record is durable, so completion work the caller does
    /// next has the write-ahead guarantee.
    pub fn append(&self, store_id: u32, seq: SeqNum, payload: &[u8]) -> Result<()> {
        let total = round_up(
            LOG_RECORD_ALIGN + payload.len() as u64,
            LOG_RECORD_ALIGN,
        );

        let mut inner = self.inner.lock();
        match inner.stores.get(&store_id) {
            None => return Err(Error::io_error(format!("no such log store {store_id}"))),
            Some(store) if seq <= store.truncated_to => {
                return Err(Error::io_error(format!(
                    "sequence {seq} already truncated on store {store_id}"
                )))
            }
            Some(_) => {}
        }

        let crc = compute_crc32c(payload);
        let header = RecordHeader {
            store_id,
            seq,
            len: payload.len() as u32,
            crc,
            prev_crc: inner.last_crc,
        };

        let offset = self.vdev.reserve(total)?;
        let mut blob = header.encode();
        blob.extend_from_slice(payload);
        blob.resize(total as usize, 0);
        self.vdev.write_at(offset, &blob)?;
        self.vdev.sync()?;

        inner.last_crc = crc;
        let store = inner
            .stores
            .get_mut(&store_id)
            .ok_or_else(|| Error::io_error("store vanished during append"))?;
        store.records.insert(seq, RecordLoc { offset, total });
        Ok(())
    }

    /// Read one record back by sequence number
    pub fn read_sync(&self, store_id: u32, seq: SeqNum) -> Result<Vec<u8>> {
        let loc = {
            let inner = self.inner.lock();
            let store = inner
                .stores
                .get(&store_id)
                .ok_or_else(|| Error::io_error(format!("no such log store {store_id}")))?;
            *store.records.get(&seq).ok_or(Error::NotFound)?
        };

        let mut blob = vec![0u8; loc.total as usize];
        let n = self.vdev.read_at(loc.offset, &mut blob)?;
        if n < blob.len() {
            return Err(Error::io_error("log record truncated on device"));
        }
        let header = RecordHeader::decode(&blob)
            .ok_or_else(|| Error::io_error("log record header corrupt"))?;
        if header.store_id != store_id || header.seq != seq {
            return Err(Error::io_error("log record does not match its slot"));
        }
        let payload =
            blob[LOG_RECORD_ALIGN as usize..LOG_RECORD_ALIGN as usize + header.len as usize]
                .to_vec();
        let actual = compute_crc32c(&payload);
        if actual != header.crc {
            return Err(Error::ChecksumMismatch {
                expected: header.crc,
                actual,
            });
        }
        Ok(payload)
    }

    /// Retire a store's records at or below `seq`
    pub fn truncate(&self, store_id: u32, seq: SeqNum) {
        let mut inner = self.inner.lock();
        if let Some(store) = inner.stores.get_mut(&store_id) {
            store.truncated_to = store.truncated_to.max(seq);
            store.records = store.records.split_off(&(seq + 1));
        }
    }

    /// Advance the vdev's durable start offset to the minimum position
    /// any store still references.
    pub fn device_truncate(&self) -> Result<()> {
        let inner = self.inner.lock();
        let min_needed = inner
            .stores
            .values()
            .filter_map(|s| s.records.values().map(|l| l.offset).min())
            .min();
        // With nothing retained the whole log up to the write tail is
        // reclaimable.
        let new_start = min_needed.unwrap_or_else(|| self.vdev.tail_offset());
        drop(inner);

        if new_start != self.vdev.data_start_offset() {
            info!(new_start, "advancing log device start offset");
            self.vdev.truncate(new_start)?;
        }
        Ok(())
    }

    /// Scan the log from the durable start offset, delivering every
    /// intact record in append order. Stops at the first record whose
    /// magic, CRC or chain breaks; everything after it is discarded.
    /// Rebuilds the store map and pushes the discovered tail back into
    /// the vdev.
    pub fn recover(&self, mut on_record: impl FnMut(u32, SeqNum, Vec<u8>)) -> Result<()> {
        let start = self.vdev.data_start_offset();
        self.vdev.seek(start);
        self.vdev.update_tail_offset(start);

        let mut last_crc = 0u32;
        let mut first = true;
        let mut tail = start;
        let mut found: Vec<(u32, SeqNum, Vec<u8>)> = Vec::new();

        {
            let mut inner = self.inner.lock();
            loop {
                let record_start = self.vdev.seeked_pos();
                let mut head = vec![0u8; LOG_RECORD_ALIGN as usize];
                let n = match self.vdev.read_from_cursor(&mut head) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if n < head.len() {
                    break;
                }
                let Some(header) = RecordHeader::decode(&head) else {
                    break;
                };
                if !first && header.prev_crc != last_crc {
                    warn!(seq = header.seq, "log record chain broken, stopping scan");
                    break;
                }

                let total =
                    round_up(LOG_RECORD_ALIGN + u64::from(header.len), LOG_RECORD_ALIGN);
                let body = total - LOG_RECORD_ALIGN;
                let mut payload = vec![0u8; body as usize];
                let n = self.vdev.read_from_cursor(&mut payload)?;
                if (n as u64) < body {
                    break;
                }
                payload.truncate(header.len as usize);
                let actual = compute_crc32c(&payload);
                if actual != header.crc {
                    warn!(seq = header.seq, "log record checksum mismatch, stopping scan");
                    break;
                }

                {
                    let store = inner
                        .stores
                        .entry(header.store_id)
                        .or_insert_with(|| StoreState {
                            truncated_to: 0,
                            records: BTreeMap::new(),
                        });
                    store.records.insert(
                        header.seq,
                        RecordLoc {
                            offset: record_start,
                            total,
                        },
                    );
                }
                if header.store_id + 1 > inner.next_store_id {
                    inner.next_store_id = header.store_id + 1;
                }

                last_crc = header.crc;
                first = false;
                tail = self.vdev.seeked_pos();
                found.push((header.store_id, header.seq, payload));
            }
            inner.last_crc = last_crc;
        }

        // Everything from the first bad record on is dead space.
        self.vdev.update_tail_offset(tail);
        info!(records = found.len(), tail, "log scan complete");
        for (store, seq, payload) in found {
            on_record(store, seq, payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;
    use volstore_common::OpenMode;
    use volstore_device::dm::DmConfig;
    use volstore_device::DeviceManager;

    fn setup() -> (TempDir, Arc<DeviceManager>, Arc<VirtualDev>) {
        let dir = TempDir::new().unwrap();
        let devices: Vec<PathBuf> = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("pdev{i}"));
                std::fs::File::create(&path).unwrap().set_len(512 << 20).unwrap();
                path
            })
            .collect();
        let dm = DeviceManager::new(DmConfig {
            open_mode: OpenMode::BufferedIo,
            phys_page_size: 4096,
            atomic_page_size: 4096,
            system_uuid: Uuid::new_v4(),
            max_error_before_marking_dev_down: 3,
        });
        dm.add_devices(&devices, true).unwrap();
        let vdev =
            VirtualDev::create(dm.clone(), "journal", 64 << 20, 0, 4096, true, b"log", 80)
                .unwrap();
        (dir, dm, vdev)
    }

    #[test]
    fn test_append_read_roundtrip() {
        let (_dir, _dm, vdev) = setup();
        let ld = LogDevice::new(vdev);
        let store = ld.create_store();

        ld.append(store, 1, b"first record").unwrap();
        ld.append(store, 2, b"second record, longer than the first").unwrap();

        assert_eq!(ld.read_sync(store, 1).unwrap(), b"first record");
        assert_eq!(
            ld.read_sync(store, 2).unwrap(),
            b"second record, longer than the first"
        );
        assert!(matches!(ld.read_sync(store, 3), Err(Error::NotFound)));
    }

    #[test]
    fn test_recover_replays_in_order() {
        let (_dir, dm, vdev) = setup();
        let vdev_id = vdev.vdev_id();
        {
            let ld = LogDevice::new(vdev);
            let s0 = ld.create_store();
            let s1 = ld.create_store();
            ld.append(s0, 1, b"a").unwrap();
            ld.append(s1, 1, b"b").unwrap();
            ld.append(s0, 2, b"c").unwrap();
        }

        let vdev = VirtualDev::load(dm, vdev_id, "journal", 80).unwrap();
        let ld = LogDevice::new(vdev);
        let mut seen = Vec::new();
        ld.recover(|store, seq, payload| seen.push((store, seq, payload)))
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (0, 1, b"a".to_vec()));
        assert_eq!(seen[1], (1, 1, b"b".to_vec()));
        assert_eq!(seen[2], (0, 2, b"c".to_vec()));
        // Recovered records are readable again.
        assert_eq!(ld.read_sync(0, 2).unwrap(), b"c");
        // Store ids continue after the highest seen.
        assert_eq!(ld.create_store(), 2);
    }

    #[test]
    fn test_recover_stops_at_corruption() {
        let (_dir, dm, vdev) = setup();
        let vdev_id = vdev.vdev_id();
        let second_offset = {
            let ld = LogDevice::new(vdev.clone());
            let s = ld.create_store();
            ld.append(s, 1, b"good").unwrap();
            let off = vdev.tail_offset();
            ld.append(s, 2, b"to be corrupted").unwrap();
            ld.append(s, 3, b"after the tear").unwrap();
            off
        };

        // Corrupt the second record's payload in place by writing to the
        // backing pdev directly.
        {
            use std::os::unix::fs::FileExt;
            let cid = vdev.primary_chunk_ids()[(second_offset / vdev.chunk_size()) as usize];
            let chunk = dm.chunk(cid).unwrap();
            let pdev_path = dm.pdev(chunk.pdev_id).unwrap().path().to_string();
            let phys = chunk.start_offset + (second_offset % vdev.chunk_size()) + LOG_RECORD_ALIGN;
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(pdev_path)
                .unwrap();
            file.write_all_at(&[0xFF; 8], phys).unwrap();
            file.sync_all().unwrap();
        }

        let vdev = VirtualDev::load(dm, vdev_id, "journal", 80).unwrap();
        let ld = LogDevice::new(vdev);
        let mut seen = Vec::new();
        ld.recover(|_, seq, _| seen.push(seq)).unwrap();

        // The bad record and everything after it are dropped.
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_truncate_and_device_truncate() {
        let (_dir, _dm, vdev) = setup();
        let ld = LogDevice::new(vdev.clone());
        let s0 = ld.create_store();
        let s1 = ld.create_store();

        ld.append(s0, 1, &[0u8; 2048]).unwrap();
        ld.append(s1, 1, &[1u8; 2048]).unwrap();
        ld.append(s0, 2, &[2u8; 2048]).unwrap();
        assert_eq!(vdev.data_start_offset(), 0);

        // Retiring only s0's first record cannot advance past s1's.
        ld.truncate(s0, 1);
        ld.device_truncate().unwrap();
        let after_first = vdev.data_start_offset();
        assert!(after_first > 0);

        // Retiring everything reclaims up to the tail.
        ld.truncate(s0, 2);
        ld.truncate(s1, 1);
        ld.device_truncate().unwrap();
        assert_eq!(vdev.data_start_offset(), vdev.tail_offset());
        assert_eq!(vdev.write_bytes_total(), 0);

        // Appends continue cleanly after truncation.
        ld.append(s0, 3, b"post-truncate").unwrap();
        assert_eq!(ld.read_sync(s0, 3).unwrap(), b"post-truncate");
    }
}
