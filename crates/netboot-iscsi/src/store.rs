//! Durable record store for images, devices, transfer states and the boot log.
//!
//! The store is the source of truth for image names and links. Callers
//! write to it only after the matching file and daemon operations have
//! succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{IscsiError, IscsiResult};
use crate::model::{BootLogEntry, Device, Image, TransferState};

/// Maximum number of boot log entries retained.
pub const BOOT_LOG_CAPACITY: usize = 1000;

/// Keyed record storage used by the iSCSI subsystem.
pub trait RecordStore: Send + Sync {
    /// Image by id.
    fn get_image(&self, id: &str) -> IscsiResult<Option<Image>>;
    /// All images, sorted by id.
    fn list_images(&self) -> IscsiResult<Vec<Image>>;
    /// Insert or replace an image.
    fn put_image(&self, image: &Image) -> IscsiResult<()>;
    /// Remove an image; returns whether it existed.
    fn remove_image(&self, id: &str) -> IscsiResult<bool>;

    /// Device by normalized MAC.
    fn get_device(&self, mac: &str) -> IscsiResult<Option<Device>>;
    /// All devices, sorted by MAC.
    fn list_devices(&self) -> IscsiResult<Vec<Device>>;
    /// Insert or replace a device.
    fn put_device(&self, device: &Device) -> IscsiResult<()>;

    /// Transfer state by normalized MAC.
    fn get_transfer(&self, mac: &str) -> IscsiResult<Option<TransferState>>;
    /// Applies `f` to the transfer state of `mac` as one atomic step and
    /// returns the stored result. A fresh session is started when none exists.
    ///
    /// This is the only writer of transfer states.
    fn update_transfer(
        &self,
        mac: &str,
        f: &mut dyn FnMut(&mut TransferState),
    ) -> IscsiResult<TransferState>;

    /// Remove a device; returns whether it existed.
    fn remove_device(&self, mac: &str) -> IscsiResult<bool>;

    /// Append a boot log entry, evicting the oldest beyond capacity.
    fn append_boot_log(&self, entry: BootLogEntry) -> IscsiResult<()>;
    /// Newest-first boot log entries, optionally filtered by MAC.
    fn boot_logs(&self, mac: Option<&str>, limit: usize) -> IscsiResult<Vec<BootLogEntry>>;
}

fn newest_first(entries: &[BootLogEntry], mac: Option<&str>, limit: usize) -> Vec<BootLogEntry> {
    entries
        .iter()
        .rev()
        .filter(|e| mac.map_or(true, |m| e.mac == m))
        .take(limit)
        .cloned()
        .collect()
}

fn push_bounded(entries: &mut Vec<BootLogEntry>, entry: BootLogEntry) {
    entries.push(entry);
    if entries.len() > BOOT_LOG_CAPACITY {
        let excess = entries.len() - BOOT_LOG_CAPACITY;
        entries.drain(..excess);
    }
}

fn poisoned() -> IscsiError {
    IscsiError::Store("record store lock poisoned".to_string())
}

#[derive(Default)]
struct MemoryInner {
    images: BTreeMap<String, Image>,
    devices: BTreeMap<String, Device>,
    transfers: BTreeMap<String, TransferState>,
    boot_log: Vec<BootLogEntry>,
}

/// In-process [`RecordStore`], used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get_image(&self, id: &str) -> IscsiResult<Option<Image>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.images.get(id).cloned())
    }

    fn list_images(&self) -> IscsiResult<Vec<Image>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.images.values().cloned().collect())
    }

    fn put_image(&self, image: &Image) -> IscsiResult<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.images.insert(image.id.clone(), image.clone());
        Ok(())
    }

    fn remove_image(&self, id: &str) -> IscsiResult<bool> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.images.remove(id).is_some())
    }

    fn get_device(&self, mac: &str) -> IscsiResult<Option<Device>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.devices.get(mac).cloned())
    }

    fn list_devices(&self) -> IscsiResult<Vec<Device>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.devices.values().cloned().collect())
    }

    fn put_device(&self, device: &Device) -> IscsiResult<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.devices.insert(device.mac.clone(), device.clone());
        Ok(())
    }

    fn get_transfer(&self, mac: &str) -> IscsiResult<Option<TransferState>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.transfers.get(mac).cloned())
    }

    fn update_transfer(
        &self,
        mac: &str,
        f: &mut dyn FnMut(&mut TransferState),
    ) -> IscsiResult<TransferState> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let state = inner
            .transfers
            .entry(mac.to_string())
            .or_insert_with(|| TransferState::new_session(mac));
        f(state);
        Ok(state.clone())
    }

    fn remove_device(&self, mac: &str) -> IscsiResult<bool> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.devices.remove(mac).is_some())
    }

    fn append_boot_log(&self, entry: BootLogEntry) -> IscsiResult<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        push_bounded(&mut inner.boot_log, entry);
        Ok(())
    }

    fn boot_logs(&self, mac: Option<&str>, limit: usize) -> IscsiResult<Vec<BootLogEntry>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(newest_first(&inner.boot_log, mac, limit))
    }
}

const IMAGES_FILE: &str = "images.json";
const PROFILES_FILE: &str = "profiles.json";
const TRANSFERS_FILE: &str = "transfers.json";
const BOOT_LOG_FILE: &str = "boot_logs.json";

/// [`RecordStore`] backed by one JSON document per record kind.
///
/// Every write replaces the whole document through a temp file and rename,
/// so a crash leaves either the old or the new version on disk.
///
/// This is a small-document store: calls do synchronous file I/O under one
/// mutex and run inline on the calling task. Each document stays a few
/// hundred KiB at most, since the boot log is capped at
/// [`BOOT_LOG_CAPACITY`] entries and the other documents hold one record
/// per image or device. Deployments with many thousands of devices need a
/// real database behind [`RecordStore`].
pub struct JsonFileStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> IscsiResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| IscsiError::Store(format!("creating {}: {}", dir.display(), e)))?;
        debug!(dir = %dir.display(), "opened json record store");
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Directory holding the JSON documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_doc<T: DeserializeOwned + Default>(&self, file: &str) -> IscsiResult<T> {
        let path = self.dir.join(file);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(IscsiError::Store(format!("reading {}: {}", path.display(), e)))
            }
        };
        if contents.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&contents)
            .map_err(|e| IscsiError::Store(format!("parsing {}: {}", path.display(), e)))
    }

    fn write_doc<T: Serialize>(&self, file: &str, value: &T) -> IscsiResult<()> {
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!(".{}.tmp", file));
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| IscsiError::Store(format!("encoding {}: {}", file, e)))?;
        std::fs::write(&tmp, json)
            .map_err(|e| IscsiError::Store(format!("writing {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            warn!(path = %path.display(), "failed to replace record document: {}", e);
            IscsiError::Store(format!("replacing {}: {}", path.display(), e))
        })
    }

    fn update_doc<T, F, R>(&self, file: &str, f: F) -> IscsiResult<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut doc: T = self.read_doc(file)?;
        let result = f(&mut doc);
        self.write_doc(file, &doc)?;
        Ok(result)
    }

    fn read_locked<T: DeserializeOwned + Default>(&self, file: &str) -> IscsiResult<T> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        self.read_doc(file)
    }
}

impl RecordStore for JsonFileStore {
    fn get_image(&self, id: &str) -> IscsiResult<Option<Image>> {
        let mut images: BTreeMap<String, Image> = self.read_locked(IMAGES_FILE)?;
        Ok(images.remove(id))
    }

    fn list_images(&self) -> IscsiResult<Vec<Image>> {
        let images: BTreeMap<String, Image> = self.read_locked(IMAGES_FILE)?;
        Ok(images.into_values().collect())
    }

    fn put_image(&self, image: &Image) -> IscsiResult<()> {
        self.update_doc(IMAGES_FILE, |images: &mut BTreeMap<String, Image>| {
            images.insert(image.id.clone(), image.clone());
        })
    }

    fn remove_image(&self, id: &str) -> IscsiResult<bool> {
        self.update_doc(IMAGES_FILE, |images: &mut BTreeMap<String, Image>| {
            images.remove(id).is_some()
        })
    }

    fn get_device(&self, mac: &str) -> IscsiResult<Option<Device>> {
        let mut devices: BTreeMap<String, Device> = self.read_locked(PROFILES_FILE)?;
        Ok(devices.remove(mac))
    }

    fn list_devices(&self) -> IscsiResult<Vec<Device>> {
        let devices: BTreeMap<String, Device> = self.read_locked(PROFILES_FILE)?;
        Ok(devices.into_values().collect())
    }

    fn put_device(&self, device: &Device) -> IscsiResult<()> {
        self.update_doc(PROFILES_FILE, |devices: &mut BTreeMap<String, Device>| {
            devices.insert(device.mac.clone(), device.clone());
        })
    }

    fn get_transfer(&self, mac: &str) -> IscsiResult<Option<TransferState>> {
        let mut transfers: BTreeMap<String, TransferState> = self.read_locked(TRANSFERS_FILE)?;
        Ok(transfers.remove(mac))
    }

    fn update_transfer(
        &self,
        mac: &str,
        f: &mut dyn FnMut(&mut TransferState),
    ) -> IscsiResult<TransferState> {
        self.update_doc(
            TRANSFERS_FILE,
            |transfers: &mut BTreeMap<String, TransferState>| {
                let state = transfers
                    .entry(mac.to_string())
                    .or_insert_with(|| TransferState::new_session(mac));
                f(state);
                state.clone()
            },
        )
    }

    fn remove_device(&self, mac: &str) -> IscsiResult<bool> {
        self.update_doc(PROFILES_FILE, |devices: &mut BTreeMap<String, Device>| {
            devices.remove(mac).is_some()
        })
    }

    fn append_boot_log(&self, entry: BootLogEntry) -> IscsiResult<()> {
        self.update_doc(BOOT_LOG_FILE, |entries: &mut Vec<BootLogEntry>| {
            push_bounded(entries, entry);
        })
    }

    fn boot_logs(&self, mac: Option<&str>, limit: usize) -> IscsiResult<Vec<BootLogEntry>> {
        let entries: Vec<BootLogEntry> = self.read_locked(BOOT_LOG_FILE)?;
        Ok(newest_first(&entries, mac, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, ImageStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn image(name: &str) -> Image {
        Image {
            id: name.to_string(),
            name: name.to_string(),
            size_gb: 4,
            target_name: format!("iqn.test:{}", name),
            target_id: Some(1),
            file_path: PathBuf::from(format!("/images/{}.img", name)),
            assigned_to: None,
            status: ImageStatus::Available,
            created_at: Utc::now(),
            copied_from: None,
        }
    }

    fn exercise(store: &dyn RecordStore) {
        assert!(store.get_image("a").unwrap().is_none());
        store.put_image(&image("b")).unwrap();
        store.put_image(&image("a")).unwrap();
        let names: Vec<String> = store.list_images().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(store.remove_image("a").unwrap());
        assert!(!store.remove_image("a").unwrap());

        let mut device = Device::minimal("aa:bb:cc:dd:ee:ff");
        device.device_type = DeviceType::Raspi;
        store.put_device(&device).unwrap();
        assert_eq!(
            store.get_device("aa:bb:cc:dd:ee:ff").unwrap().unwrap().device_type,
            DeviceType::Raspi
        );
        assert_eq!(store.list_devices().unwrap().len(), 1);

        assert!(store.get_transfer("aa:bb:cc:dd:ee:ff").unwrap().is_none());
        let state = store
            .update_transfer("aa:bb:cc:dd:ee:ff", &mut |s| s.http_requests += 1)
            .unwrap();
        assert_eq!(state.http_requests, 1);
        assert_eq!(store.get_transfer("aa:bb:cc:dd:ee:ff").unwrap(), Some(state));

        assert!(store.remove_device("aa:bb:cc:dd:ee:ff").unwrap());
        assert!(!store.remove_device("aa:bb:cc:dd:ee:ff").unwrap());
        assert!(store.get_device("aa:bb:cc:dd:ee:ff").unwrap().is_none());
        assert!(store.get_transfer("aa:bb:cc:dd:ee:ff").unwrap().is_some());

        store
            .append_boot_log(BootLogEntry::new("aa:bb:cc:dd:ee:ff", "check_in", "x64", ""))
            .unwrap();
        store
            .append_boot_log(BootLogEntry::new("webui", "iscsi_create", "b", ""))
            .unwrap();
        let all = store.boot_logs(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event, "iscsi_create");
        let filtered = store.boot_logs(Some("aa:bb:cc:dd:ee:ff"), 10).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event, "check_in");
    }

    #[test]
    fn test_memory_store_roundtrip() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("data")).unwrap();
        exercise(&store);
        assert!(dir.path().join("data").join("images.json").exists());
        assert!(dir.path().join("data").join("profiles.json").exists());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.put_image(&image("persisted")).unwrap();
        }
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(store.get_image("persisted").unwrap().unwrap().size_gb, 4);
    }

    #[test]
    fn test_json_store_rejects_corrupt_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("images.json"), "{not json").unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(matches!(store.list_images(), Err(IscsiError::Store(_))));
    }

    #[test]
    fn test_boot_log_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..(BOOT_LOG_CAPACITY + 25) {
            store
                .append_boot_log(BootLogEntry::new("webui", "event", format!("{}", i), ""))
                .unwrap();
        }
        let all = store.boot_logs(None, usize::MAX).unwrap();
        assert_eq!(all.len(), BOOT_LOG_CAPACITY);
        assert_eq!(all[0].details, format!("{}", BOOT_LOG_CAPACITY + 24));
        assert_eq!(all.last().unwrap().details, "25");
    }

    fn hammer_transfer(store: &dyn RecordStore, threads: usize, per_thread: u64) {
        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        store
                            .update_transfer("aa:bb:cc:dd:ee:ff", &mut |s| {
                                s.http_tx_bytes += 1;
                                s.http_requests += 1;
                            })
                            .unwrap();
                    }
                });
            }
        });
        let state = store.get_transfer("aa:bb:cc:dd:ee:ff").unwrap().unwrap();
        let expected = threads as u64 * per_thread;
        assert_eq!(state.http_requests, expected);
        assert_eq!(state.http_tx_bytes, expected);
    }

    #[test]
    fn test_memory_store_transfer_updates_are_atomic() {
        hammer_transfer(&MemoryStore::new(), 8, 2000);
    }

    #[test]
    fn test_json_store_transfer_updates_are_atomic() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        hammer_transfer(&store, 4, 25);
    }

    #[test]
    fn test_json_boot_log_document_stays_bounded() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        for i in 0..(BOOT_LOG_CAPACITY + 10) {
            store
                .append_boot_log(BootLogEntry::new("webui", "event", format!("{}", i), ""))
                .unwrap();
        }
        let on_disk: Vec<BootLogEntry> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(BOOT_LOG_FILE)).unwrap())
                .unwrap();
        assert_eq!(on_disk.len(), BOOT_LOG_CAPACITY);
        assert_eq!(on_disk[0].details, "10");
    }
}
