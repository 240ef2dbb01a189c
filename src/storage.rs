use anyhow::{anyhow, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// NVS namespace holding everything the supervisor persists.
pub const NAMESPACE: &str = "sensornode";

/// Key of the configuration document written by the local server.
pub const CONFIG_KEY: &str = "config";

/// A small key/value view over non-volatile storage.
///
/// Implementations are cheap handles onto shared storage: cloning one
/// yields another view of the same namespace, which is how the local
/// server's handlers and the boot path see the same state.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Reads a `u32`, `None` if the key was never written.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be read.
    fn get_u32(&self, key: &str) -> Result<Option<u32>>;

    /// Writes a `u32`.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be written.
    fn set_u32(&self, key: &str, value: u32) -> Result<()>;

    /// Reads a `u8`, `None` if the key was never written.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be read.
    fn get_u8(&self, key: &str) -> Result<Option<u8>>;

    /// Writes a `u8`.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be written.
    fn set_u8(&self, key: &str, value: u8) -> Result<()>;

    /// Reads a string, `None` if the key was never written.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be read.
    fn get_str(&self, key: &str) -> Result<Option<String>>;

    /// Writes a string.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be written.
    fn set_str(&self, key: &str, value: &str) -> Result<()>;

    /// Removes a key. Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns an error if the underlying storage cannot be written.
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
enum Slot {
    U32(u32),
    U8(u8),
    Str(String),
}

#[derive(Debug, Default)]
struct Cells {
    slots: HashMap<String, Slot>,
    broken: bool,
}

/// Volatile storage backed by a map, used on the host.
///
/// It can be switched into a broken mode where every access fails, which is
/// how flash wear-out and NVS corruption are exercised off-target.
#[derive(Clone, Debug, Default)]
pub struct RamStorage {
    cells: Arc<Mutex<Cells>>,
}

impl RamStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read and write fail (or succeed again).
    ///
    /// # Errors
    /// Returns an error if the mutex lock cannot be acquired.
    pub fn set_broken(&self, broken: bool) -> Result<()> {
        self.with(|cells| {
            cells.broken = broken;
            Ok(())
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Cells) -> Result<T>) -> Result<T> {
        let mut cells = self
            .cells
            .lock()
            .map_err(|e| anyhow!("Mutex lock error: {:?}", e))?;

        f(&mut cells)
    }

    fn read(&self, key: &str) -> Result<Option<Slot>> {
        self.with(|cells| {
            if cells.broken {
                return Err(anyhow!("storage read failed for `{key}`"));
            }
            Ok(cells.slots.get(key).cloned())
        })
    }

    fn write(&self, key: &str, slot: Option<Slot>) -> Result<()> {
        self.with(|cells| {
            if cells.broken {
                return Err(anyhow!("storage write failed for `{key}`"));
            }
            match slot {
                Some(slot) => cells.slots.insert(key.to_owned(), slot),
                None => cells.slots.remove(key),
            };
            Ok(())
        })
    }
}

impl Storage for RamStorage {
    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.read(key)? {
            None => Ok(None),
            Some(Slot::U32(value)) => Ok(Some(value)),
            Some(other) => Err(anyhow!("`{key}` holds {other:?}, not a u32")),
        }
    }

    fn set_u32(&self, key: &str, value: u32) -> Result<()> {
        self.write(key, Some(Slot::U32(value)))
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        match self.read(key)? {
            None => Ok(None),
            Some(Slot::U8(value)) => Ok(Some(value)),
            Some(other) => Err(anyhow!("`{key}` holds {other:?}, not a u8")),
        }
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<()> {
        self.write(key, Some(Slot::U8(value)))
    }

    fn get_str(&self, key: &str) -> Result<Option<String>> {
        match self.read(key)? {
            None => Ok(None),
            Some(Slot::Str(value)) => Ok(Some(value)),
            Some(other) => Err(anyhow!("`{key}` holds {other:?}, not a string")),
        }
    }

    fn set_str(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Some(Slot::Str(value.to_owned())))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None)
    }
}

#[cfg(target_os = "espidf")]
pub use nvs::NvsStorage;

#[cfg(target_os = "espidf")]
mod nvs {
    use anyhow::{anyhow, Result};
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
    use std::sync::{Arc, Mutex};

    use super::Storage;

    /// Largest string the supervisor stores (the configuration document).
    const MAX_STR_LEN: usize = 4096;

    /// Storage backed by an ESP-IDF NVS namespace.
    #[derive(Clone)]
    pub struct NvsStorage {
        nvs: Arc<Mutex<EspNvs<NvsDefault>>>,
    }

    impl NvsStorage {
        /// Opens (creating if needed) the given namespace on the default partition.
        ///
        /// # Errors
        /// Returns an error if the namespace cannot be opened.
        pub fn new(partition: EspDefaultNvsPartition, namespace: &str) -> Result<Self> {
            let nvs = EspNvs::new(partition, namespace, true)?;
            Ok(Self {
                nvs: Arc::new(Mutex::new(nvs)),
            })
        }

        fn with<T>(&self, f: impl FnOnce(&mut EspNvs<NvsDefault>) -> Result<T>) -> Result<T> {
            let mut nvs = self
                .nvs
                .lock()
                .map_err(|e| anyhow!("Mutex lock error: {:?}", e))?;

            f(&mut nvs)
        }
    }

    impl Storage for NvsStorage {
        fn get_u32(&self, key: &str) -> Result<Option<u32>> {
            self.with(|nvs| Ok(nvs.get_u32(key)?))
        }

        fn set_u32(&self, key: &str, value: u32) -> Result<()> {
            self.with(|nvs| Ok(nvs.set_u32(key, value)?))
        }

        fn get_u8(&self, key: &str) -> Result<Option<u8>> {
            self.with(|nvs| Ok(nvs.get_u8(key)?))
        }

        fn set_u8(&self, key: &str, value: u8) -> Result<()> {
            self.with(|nvs| Ok(nvs.set_u8(key, value)?))
        }

        fn get_str(&self, key: &str) -> Result<Option<String>> {
            self.with(|nvs| {
                let mut buf = vec![0_u8; MAX_STR_LEN];
                Ok(nvs.get_str(key, &mut buf)?.map(str::to_owned))
            })
        }

        fn set_str(&self, key: &str, value: &str) -> Result<()> {
            self.with(|nvs| Ok(nvs.set_str(key, value)?))
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.with(|nvs| {
                nvs.remove(key)?;
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_cells() {
        let a = RamStorage::new();
        let b = a.clone();
        a.set_u32("k", 7).unwrap();
        assert_eq!(b.get_u32("k").unwrap(), Some(7));
        b.remove("k").unwrap();
        assert_eq!(a.get_u32("k").unwrap(), None);
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let storage = RamStorage::new();
        storage.set_str("k", "text").unwrap();
        assert!(storage.get_u32("k").is_err());
    }

    #[test]
    fn broken_storage_fails_every_access() {
        let storage = RamStorage::new();
        storage.set_u8("k", 1).unwrap();
        storage.set_broken(true).unwrap();
        assert!(storage.get_u8("k").is_err());
        assert!(storage.set_u8("k", 2).is_err());
        storage.set_broken(false).unwrap();
        assert_eq!(storage.get_u8("k").unwrap(), Some(1));
    }
}
