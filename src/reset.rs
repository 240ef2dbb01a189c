use num_enum::TryFromPrimitive;
use std::fmt;

/// Why the device is booting, as far as the supervisor cares.
///
/// # Variants
/// * `PowerOn` - Cold start, including brownout and supply glitches.
/// * `ExternalReset` - The reset pin (or a host interface) restarted the chip.
/// * `SoftwareReset` - The firmware restarted itself.
/// * `Crash` - Panic, watchdog or other fault.
/// * `DeepSleepWake` - Deliberate wake from deep sleep.
/// * `Unknown` - Anything the hardware could not explain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    ExternalReset,
    SoftwareReset,
    Crash,
    DeepSleepWake,
    Unknown,
}

impl ResetReason {
    /// Classifies a raw `esp_reset_reason_t` value.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        ResetCode::try_from(code).map_or(ResetReason::Unknown, ResetReason::from)
    }

    /// Returns `true` for resets caused by a fault rather than a decision.
    #[must_use]
    pub fn is_crash(self) -> bool {
        self == ResetReason::Crash
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::PowerOn => write!(f, "power-on"),
            ResetReason::ExternalReset => write!(f, "external-reset"),
            ResetReason::SoftwareReset => write!(f, "software-reset"),
            ResetReason::Crash => write!(f, "crash"),
            ResetReason::DeepSleepWake => write!(f, "deep-sleep-wake"),
            ResetReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw reset codes as reported by `esp_reset_reason()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
enum ResetCode {
    Unknown = 0,
    PowerOn = 1,
    External = 2,
    Software = 3,
    Panic = 4,
    InterruptWatchdog = 5,
    TaskWatchdog = 6,
    OtherWatchdog = 7,
    DeepSleep = 8,
    Brownout = 9,
    Sdio = 10,
    Usb = 11,
    Jtag = 12,
    Efuse = 13,
    PowerGlitch = 14,
    CpuLockup = 15,
}

impl From<ResetCode> for ResetReason {
    fn from(code: ResetCode) -> Self {
        match code {
            ResetCode::PowerOn | ResetCode::Brownout | ResetCode::PowerGlitch => {
                ResetReason::PowerOn
            }
            ResetCode::External | ResetCode::Sdio | ResetCode::Usb | ResetCode::Jtag => {
                ResetReason::ExternalReset
            }
            ResetCode::Software => ResetReason::SoftwareReset,
            ResetCode::Panic
            | ResetCode::InterruptWatchdog
            | ResetCode::TaskWatchdog
            | ResetCode::OtherWatchdog
            | ResetCode::Efuse
            | ResetCode::CpuLockup => ResetReason::Crash,
            ResetCode::DeepSleep => ResetReason::DeepSleepWake,
            ResetCode::Unknown => ResetReason::Unknown,
        }
    }
}

/// Source of the reset reason for the current boot. Reading it has no side effects.
pub trait ResetClassifier {
    fn classify(&self) -> ResetReason;
}

/// A fixed reason, for simulated boots.
impl ResetClassifier for ResetReason {
    fn classify(&self) -> ResetReason {
        *self
    }
}

/// Reads the reason from the chip's reset status.
#[cfg(target_os = "espidf")]
pub struct ChipReset;

#[cfg(target_os = "espidf")]
impl ResetClassifier for ChipReset {
    fn classify(&self) -> ResetReason {
        let code = unsafe { esp_idf_svc::sys::esp_reset_reason() };
        #[allow(clippy::useless_conversion)]
        ResetReason::from_code(u32::from(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_classify_as_crash() {
        for code in [4, 5, 6, 7, 13, 15] {
            assert!(ResetReason::from_code(code).is_crash(), "code {code}");
        }
    }

    #[test]
    fn deliberate_resets_are_told_apart() {
        assert_eq!(ResetReason::from_code(1), ResetReason::PowerOn);
        assert_eq!(ResetReason::from_code(9), ResetReason::PowerOn);
        assert_eq!(ResetReason::from_code(2), ResetReason::ExternalReset);
        assert_eq!(ResetReason::from_code(3), ResetReason::SoftwareReset);
        assert_eq!(ResetReason::from_code(8), ResetReason::DeepSleepWake);
    }

    #[test]
    fn unknown_codes_are_unknown() {
        assert_eq!(ResetReason::from_code(0), ResetReason::Unknown);
        assert_eq!(ResetReason::from_code(999), ResetReason::Unknown);
    }

    #[test]
    fn classification_is_stable() {
        let reason = ResetReason::Crash;
        assert_eq!(reason.classify(), reason.classify());
    }
}
