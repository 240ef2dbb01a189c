//! Cross-reboot state: the boot counter, the firmware update flag and the
//! manual update trigger.
//!
//! Nothing in here ever fails its caller. A read that fails, or finds data it
//! does not recognise, degrades to the safest value (counter 0, flag idle, no
//! request); a write that fails is logged and dropped, since losing it only
//! weakens boot-loop protection for one cycle.

use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

use crate::storage::Storage;

const COUNTER_KEY: &str = "boot_cnt";
const FLAG_KEY: &str = "fw_flag";
const REQUEST_KEY: &str = "fw_req";

/// Tag stored in the upper half of the counter word.
const COUNTER_TAG: u32 = 0xB007_0000;
const COUNTER_MASK: u32 = 0x0000_FFFF;

/// Number of consecutive boots that have not completed an application cycle.
#[derive(Clone)]
pub struct PersistentCounter<S: Storage> {
    storage: S,
}

impl<S: Storage> PersistentCounter<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Reads the counter, returning 0 when storage is uninitialized or corrupt.
    #[must_use]
    pub fn load(&self) -> u32 {
        match self.storage.get_u32(COUNTER_KEY) {
            Ok(None) => 0,
            Ok(Some(word)) if word & !COUNTER_MASK == COUNTER_TAG => word & COUNTER_MASK,
            Ok(Some(word)) => {
                warn!("Boot counter word {word:#010x} is corrupt, treating as fresh");
                0
            }
            Err(e) => {
                warn!("Boot counter unreadable, treating as fresh: {e:#}");
                0
            }
        }
    }

    /// Persists `value`, clamped to what the stored word can hold.
    pub fn save(&self, value: u32) {
        let word = COUNTER_TAG | value.min(COUNTER_MASK);
        if let Err(e) = self.storage.set_u32(COUNTER_KEY, word) {
            warn!("Failed to persist boot counter {value}: {e:#}");
        }
    }

    /// Increments and persists the counter, returning the new value.
    pub fn increment(&self) -> u32 {
        let value = self.load().saturating_add(1).min(COUNTER_MASK);
        self.save(value);
        value
    }

    /// Resets the counter to 0. Idempotent.
    pub fn clear(&self) {
        self.save(0);
    }
}

/// State of the firmware update bookkeeping.
///
/// # Variants
/// * `Idle` - No update is pending.
/// * `InProgress` - An image is being fetched; finding this at boot means the fetch never finished.
/// * `Applied` - A new image was selected and the device rebooted into it.
/// * `Probation` - The new image is running its first cycle; finding this at boot means it never confirmed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum UpdateFlag {
    #[default]
    Idle = 0,
    InProgress = 1,
    Applied = 2,
    Probation = 3,
}

impl UpdateFlag {
    /// Returns `true` if the flag marks an update that was never confirmed.
    #[must_use]
    pub fn is_unconfirmed(self) -> bool {
        matches!(self, UpdateFlag::InProgress | UpdateFlag::Probation)
    }
}

impl fmt::Display for UpdateFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateFlag::Idle => write!(f, "idle"),
            UpdateFlag::InProgress => write!(f, "in-progress"),
            UpdateFlag::Applied => write!(f, "applied"),
            UpdateFlag::Probation => write!(f, "probation"),
        }
    }
}

/// Persisted [`UpdateFlag`].
#[derive(Clone)]
pub struct FirmwareFlag<S: Storage> {
    storage: S,
}

impl<S: Storage> FirmwareFlag<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Reads the flag; unreadable or unknown codes read as `Idle`.
    #[must_use]
    pub fn load(&self) -> UpdateFlag {
        match self.storage.get_u8(FLAG_KEY) {
            Ok(None) => UpdateFlag::Idle,
            Ok(Some(code)) => UpdateFlag::try_from(code).unwrap_or_else(|_| {
                warn!("Unknown update flag code {code}, treating as idle");
                UpdateFlag::Idle
            }),
            Err(e) => {
                warn!("Update flag unreadable, treating as idle: {e:#}");
                UpdateFlag::Idle
            }
        }
    }

    pub fn set(&self, flag: UpdateFlag) {
        if let Err(e) = self.storage.set_u8(FLAG_KEY, flag.into()) {
            warn!("Failed to persist update flag {flag}: {e:#}");
        }
    }

    pub fn clear(&self) {
        self.set(UpdateFlag::Idle);
    }
}

/// Persisted manual update trigger, set from the local server.
#[derive(Clone)]
pub struct UpdateRequest<S: Storage> {
    storage: S,
}

impl<S: Storage> UpdateRequest<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn pending(&self) -> bool {
        match self.storage.get_u8(REQUEST_KEY) {
            Ok(value) => value == Some(1),
            Err(e) => {
                warn!("Update request unreadable, ignoring it: {e:#}");
                false
            }
        }
    }

    pub fn set(&self) {
        if let Err(e) = self.storage.set_u8(REQUEST_KEY, 1) {
            warn!("Failed to persist update request: {e:#}");
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(REQUEST_KEY) {
            warn!("Failed to clear update request: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamStorage;

    #[test]
    fn counter_starts_at_zero_and_increments() {
        let counter = PersistentCounter::new(RamStorage::new());
        assert_eq!(counter.load(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.load(), 2);
        counter.clear();
        counter.clear();
        assert_eq!(counter.load(), 0);
    }

    #[test]
    fn untagged_counter_word_reads_as_zero() {
        let storage = RamStorage::new();
        storage.set_u32(COUNTER_KEY, 0xFFFF_FFFF).unwrap();
        assert_eq!(PersistentCounter::new(storage).load(), 0);
    }

    #[test]
    fn counter_survives_write_failures() {
        let storage = RamStorage::new();
        let counter = PersistentCounter::new(storage.clone());
        counter.save(4);
        storage.set_broken(true).unwrap();
        assert_eq!(counter.load(), 0);
        assert_eq!(counter.increment(), 1);
        storage.set_broken(false).unwrap();
        assert_eq!(counter.load(), 4);
    }

    #[test]
    fn counter_saturates() {
        let counter = PersistentCounter::new(RamStorage::new());
        counter.save(u32::MAX);
        assert_eq!(counter.load(), COUNTER_MASK);
        assert_eq!(counter.increment(), COUNTER_MASK);
    }

    #[test]
    fn unknown_flag_code_reads_as_idle() {
        let storage = RamStorage::new();
        storage.set_u8(FLAG_KEY, 42).unwrap();
        assert_eq!(FirmwareFlag::new(storage).load(), UpdateFlag::Idle);
    }

    #[test]
    fn flag_round_trips_through_storage() {
        let flag = FirmwareFlag::new(RamStorage::new());
        flag.set(UpdateFlag::Probation);
        assert_eq!(flag.load(), UpdateFlag::Probation);
        flag.clear();
        assert_eq!(flag.load(), UpdateFlag::Idle);
    }

    #[test]
    fn request_is_cleared_by_removal() {
        let request = UpdateRequest::new(RamStorage::new());
        assert!(!request.pending());
        request.set();
        assert!(request.pending());
        request.clear();
        assert!(!request.pending());
    }
}
