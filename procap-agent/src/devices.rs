//! Network device metadata keyed by interface index.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SYSFS_NET: &str = "/sys/class/net";

/// Minimum time between two refreshes triggered by lookup misses.
const MISS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub ifindex: u32,
    pub name: String,
}

/// Resolves an interface index to its device.
pub trait DeviceLookup: Send + Sync {
    fn lookup(&self, ifindex: u32) -> Option<DeviceInfo>;
}

/// ifindex → device map populated from sysfs.
///
/// Lookups never touch the filesystem. A miss only wakes the background
/// refresher (see [`DeviceCache::spawn_refresher`]), which rescans at most
/// once per second, so interfaces created after startup (veth pairs,
/// tunnels) show up without a separate watcher.
#[derive(Debug)]
pub struct DeviceCache {
    root: PathBuf,
    devices: RwLock<HashMap<u32, DeviceInfo>>,
    refresh_wanted: Notify,
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::with_root(SYSFS_NET)
    }
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache reading device entries from `root` instead of `/sys/class/net`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            devices: RwLock::new(HashMap::new()),
            refresh_wanted: Notify::new(),
        }
    }

    pub fn insert(&self, device: DeviceInfo) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.ifindex, device);
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Known device names, ordered by ifindex.
    pub fn names(&self) -> Vec<String> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut known: Vec<&DeviceInfo> = devices.values().collect();
        known.sort_by_key(|d| d.ifindex);
        known.into_iter().map(|d| d.name.clone()).collect()
    }

    /// Rescan the sysfs root and merge what it finds. Returns the number of
    /// devices read. Blocking; async callers use [`rescan`](Self::rescan).
    pub fn refresh(&self) -> io::Result<usize> {
        let found = read_sysfs_devices(&self.root)?;
        let count = found.len();
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        for device in found {
            devices.insert(device.ifindex, device);
        }
        debug!("device cache refreshed: {} devices", count);
        Ok(count)
    }

    /// [`refresh`](Self::refresh) on the blocking pool.
    pub async fn rescan(self: &Arc<Self>) -> io::Result<usize> {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.refresh())
            .await
            .map_err(io::Error::other)?
    }

    /// Refresh every `interval`, and soon after a lookup miss, until
    /// `cancel` fires.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = cache.refresh_wanted.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = cache.rescan().await {
                    warn!("failed to refresh devices from {}: {}", cache.root.display(), e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(MISS_REFRESH_INTERVAL) => {}
                }
            }
            debug!("device refresher stopped");
        })
    }

    fn get(&self, ifindex: u32) -> Option<DeviceInfo> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ifindex)
            .cloned()
    }
}

impl DeviceLookup for DeviceCache {
    fn lookup(&self, ifindex: u32) -> Option<DeviceInfo> {
        let found = self.get(ifindex);
        if found.is_none() {
            self.refresh_wanted.notify_one();
        }
        found
    }
}

/// Read `<root>/<name>/ifindex` for every entry under `root`.
///
/// Entries without a readable or parseable `ifindex` file are skipped.
pub fn read_sysfs_devices(root: &Path) -> io::Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(raw) = std::fs::read_to_string(entry.path().join("ifindex")) else {
            continue;
        };
        let Ok(ifindex) = raw.trim().parse::<u32>() else {
            continue;
        };
        devices.push(DeviceInfo { ifindex, name });
    }
    devices.sort_by_key(|d| d.ifindex);
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_sysfs(devices: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, ifindex) in devices {
            let dev = dir.path().join(name);
            fs::create_dir(&dev).unwrap();
            fs::write(dev.join("ifindex"), ifindex).unwrap();
        }
        dir
    }

    #[test]
    fn reads_ifindex_files() {
        let dir = fake_sysfs(&[("lo", "1\n"), ("eth0", "2\n"), ("bogus", "x\n")]);
        fs::create_dir(dir.path().join("noindex")).unwrap();
        let devices = read_sysfs_devices(dir.path()).unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceInfo {
                    ifindex: 1,
                    name: "lo".into()
                },
                DeviceInfo {
                    ifindex: 2,
                    name: "eth0".into()
                },
            ]
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_sysfs_devices(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn lookup_miss_does_not_read_sysfs() {
        let dir = fake_sysfs(&[("eth0", "2")]);
        let cache = DeviceCache::with_root(dir.path());
        assert!(cache.lookup(2).is_none());
        assert!(cache.is_empty());
        cache.refresh().unwrap();
        assert_eq!(cache.lookup(2).map(|d| d.name), Some("eth0".to_string()));
    }

    #[tokio::test]
    async fn miss_wakes_the_refresher() {
        let dir = fake_sysfs(&[("eth0", "2")]);
        let cache = Arc::new(DeviceCache::with_root(dir.path()));
        let cancel = CancellationToken::new();
        // Long enough that only the miss can trigger the rescan.
        let task = cache.spawn_refresher(Duration::from_secs(3600), cancel.clone());

        let dev = dir.path().join("veth0");
        fs::create_dir(&dev).unwrap();
        fs::write(dev.join("ifindex"), "3").unwrap();
        assert!(cache.lookup(3).is_none());

        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(device) = cache.get(3) {
                    return device;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(found.name, "veth0");
        assert_eq!(cache.names(), vec!["eth0", "veth0"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn rescan_runs_off_the_runtime() {
        let dir = fake_sysfs(&[("lo", "1"), ("eth0", "2")]);
        let cache = Arc::new(DeviceCache::with_root(dir.path()));
        assert_eq!(cache.rescan().await.unwrap(), 2);
        assert_eq!(cache.len(), 2);

        let missing = Arc::new(DeviceCache::with_root(dir.path().join("absent")));
        assert!(missing.rescan().await.is_err());
    }

    #[test]
    fn inserted_devices_are_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::with_root(dir.path());
        cache.insert(DeviceInfo {
            ifindex: 9,
            name: "tun0".into(),
        });
        assert_eq!(cache.lookup(9).map(|d| d.name), Some("tun0".to_string()));
    }
}
