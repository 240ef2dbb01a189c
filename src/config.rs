use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, error::Error, fmt, time::Duration};

use crate::power::RestMode;

/// Device identifier used when the document does not name one.
pub const DEFAULT_DEVICE_ID: &str = "node";

const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 64;

/// Highest GPIO number of the ESP32.
const MAX_GPIO: u8 = 39;

/// GPIOs that can drive an output. 6-11 belong to the flash, 34-39 are input only.
fn is_output_gpio(pin: u8) -> bool {
    matches!(pin, 0..=5 | 12..=19 | 21..=23 | 25..=27 | 32 | 33)
}

/// Why a configuration document was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Not JSON, or a field has the wrong type.
    Malformed(String),
    /// A required field is absent.
    Missing(&'static str),
    /// A field is present but unusable.
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Malformed(e) => write!(f, "malformed configuration: {e}"),
            ConfigError::Missing(field) => write!(f, "missing required field `{field}`"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid `{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {}

/// Switches that narrow what the supervisor may do on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Features {
    pub allow_local_server: bool,
    pub allow_auto_update: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            allow_local_server: true,
            allow_auto_update: false,
        }
    }
}

/// Role of an auxiliary GPIO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinRole {
    /// Power gate for peripheral sensors.
    Vcc,
    #[serde(other)]
    Other,
}

/// Where and when to look for new firmware.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OtaSettings {
    /// Look for new firmware on every boot that reaches the gate's update rule.
    pub check_on_boot: bool,
    /// Manifest location; defaults to `{base}/firmware`.
    pub manifest_url: Option<String>,
}

/// Tunables of the boot supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Policy {
    /// Consecutive unconfirmed boots tolerated before a boot loop is assumed.
    pub boot_loop_threshold: u32,
    /// Serve the local server when the reset pin started this boot.
    pub server_on_external_reset: bool,
    pub connect_timeout_ms: u64,
    pub transmit_timeout_ms: u64,
    pub update_timeout_ms: u64,
    pub local_server_window_ms: u64,
    pub rest_ms: u64,
    pub rest_mode: RestMode,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            boot_loop_threshold: 3,
            server_on_external_reset: true,
            connect_timeout_ms: 15_000,
            transmit_timeout_ms: 5_000,
            update_timeout_ms: 60_000,
            local_server_window_ms: 300_000,
            rest_ms: 600_000,
            rest_mode: RestMode::Deep,
        }
    }
}

impl Policy {
    /// Budget of one network join, see [`crate::wifi::ConnectivityManager::connect`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Timeout of each telemetry request.
    #[must_use]
    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }

    /// Budget of a whole update attempt, manifest and image included.
    #[must_use]
    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    /// How long the local server stays up before the device restarts.
    #[must_use]
    pub fn local_server_window(&self) -> Duration {
        Duration::from_millis(self.local_server_window_ms)
    }

    /// Length of the sleep that ends a cycle.
    ///
    /// # Returns
    /// `restMs` as a [`Duration`]; the mode comes from [`Policy::rest_mode`].
    #[must_use]
    pub fn rest_duration(&self) -> Duration {
        Duration::from_millis(self.rest_ms)
    }
}

/// The document as written, before required fields are checked.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    ssid: Option<String>,
    password: Option<String>,
    host: Option<String>,
    device_id: Option<String>,
    #[serde(default)]
    features: Features,
    #[serde(default)]
    pins: BTreeMap<u8, PinRole>,
    #[serde(default)]
    ota: OtaSettings,
    #[serde(default)]
    policy: Policy,
}

/// Device configuration, immutable for the duration of a boot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    ssid: String,
    password: String,
    host: String,
    device_id: String,
    features: Features,
    pins: BTreeMap<u8, PinRole>,
    ota: OtaSettings,
    policy: Policy,
}

impl Configuration {
    /// Parses and validates a configuration document.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the document is not JSON, misses a
    /// required field, or carries an unusable value.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let doc: Document =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        let ssid = doc.ssid.ok_or(ConfigError::Missing("ssid"))?;
        let password = doc.password.ok_or(ConfigError::Missing("password"))?;
        let host = doc.host.ok_or(ConfigError::Missing("host"))?;
        let device_id = doc
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_owned());

        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::Invalid {
                field: "ssid",
                reason: "must be 1 to 32 bytes",
            });
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::Invalid {
                field: "password",
                reason: "must be at most 64 bytes",
            });
        }
        if host.trim().is_empty() || host.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "host",
                reason: "must be a non-empty host name without spaces",
            });
        }
        if device_id.is_empty()
            || !device_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(ConfigError::Invalid {
                field: "deviceId",
                reason: "must be made of letters, digits, '.', '_' or '-'",
            });
        }
        if let Some((_, role)) = doc.pins.iter().find(|(pin, role)| {
            **pin > MAX_GPIO || (**role == PinRole::Vcc && !is_output_gpio(**pin))
        }) {
            return Err(ConfigError::Invalid {
                field: "pins",
                reason: if *role == PinRole::Vcc {
                    "vcc pins must be output-capable GPIOs outside the flash pins"
                } else {
                    "must be GPIO numbers from 0 to 39"
                },
            });
        }

        Ok(Self {
            ssid,
            password,
            host,
            device_id,
            features: doc.features,
            pins: doc.pins,
            ota: doc.ota,
            policy: doc.policy,
        })
    }

    #[must_use]
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn features(&self) -> Features {
        self.features
    }

    #[must_use]
    pub fn pins(&self) -> &BTreeMap<u8, PinRole> {
        &self.pins
    }

    /// GPIO numbers that gate peripheral power.
    pub fn vcc_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.pins
            .iter()
            .filter(|(_, role)| **role == PinRole::Vcc)
            .map(|(pin, _)| *pin)
    }

    #[must_use]
    pub fn ota(&self) -> &OtaSettings {
        &self.ota
    }

    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

/// Holds the configuration parsed at setup and hands it out read-only.
///
/// The only way to obtain a store is a successful [`ConfigStore::parse`], so
/// a boot either has exactly one configuration or none at all.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    current: Configuration,
}

impl ConfigStore {
    /// Parses the document supplied by the caller.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the document is rejected.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            current: Configuration::parse(raw)?,
        })
    }

    #[must_use]
    pub fn current(&self) -> &Configuration {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{"ssid":"garden","password":"hunter22","host":"10.0.0.2:8100"}"#;

    #[test]
    fn required_fields_round_trip() {
        let raw = r#"{"ssid":"n","password":"s","host":"h","deviceId":"d"}"#;
        let config = ConfigStore::parse(raw).unwrap();
        let current = config.current();
        assert_eq!(
            (current.ssid(), current.password(), current.host(), current.device_id()),
            ("n", "s", "h", "d")
        );
    }

    #[test]
    fn optional_fields_take_defaults() {
        let config = Configuration::parse(MINIMAL).unwrap();
        assert_eq!(config.device_id(), DEFAULT_DEVICE_ID);
        assert_eq!(config.features(), Features::default());
        assert_eq!(config.policy(), &Policy::default());
        assert_eq!(config.ota(), &OtaSettings::default());
        assert!(config.pins().is_empty());
    }

    #[test]
    fn missing_required_fields_are_reported() {
        assert_eq!(
            Configuration::parse(r#"{"password":"x","host":"h"}"#),
            Err(ConfigError::Missing("ssid"))
        );
        assert_eq!(
            Configuration::parse(r#"{"ssid":"x","host":"h"}"#),
            Err(ConfigError::Missing("password"))
        );
        assert_eq!(
            Configuration::parse(r#"{"ssid":"x","password":""}"#),
            Err(ConfigError::Missing("host"))
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            Configuration::parse("{\"ssid\": "),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            Configuration::parse(r#"{"ssid":1,"password":"","host":"h"}"#),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"ssid":"a","password":"","host":"h","colour":"blue","features":{"allowAutoUpdate":true,"beta":1}}"#;
        let config = Configuration::parse(raw).unwrap();
        assert!(config.features().allow_auto_update);
        assert!(config.features().allow_local_server);
    }

    #[test]
    fn pins_map_numbers_to_roles() {
        let raw = r#"{"ssid":"a","password":"","host":"h","pins":{"12":"vcc","4":"led","13":"vcc"}}"#;
        let config = Configuration::parse(raw).unwrap();
        assert_eq!(config.pins().get(&4), Some(&PinRole::Other));
        assert_eq!(config.vcc_pins().collect::<Vec<_>>(), vec![12, 13]);
    }

    #[test]
    fn vcc_pins_must_be_usable_outputs() {
        for pin in [6, 11, 34, 39, 40, 200] {
            let raw = format!(r#"{{"ssid":"a","password":"","host":"h","pins":{{"{pin}":"vcc"}}}}"#);
            assert!(
                matches!(
                    Configuration::parse(&raw),
                    Err(ConfigError::Invalid { field: "pins", .. })
                ),
                "GPIO {pin}"
            );
        }

        let raw = r#"{"ssid":"a","password":"","host":"h","pins":{"36":"adc","33":"vcc"}}"#;
        assert_eq!(
            Configuration::parse(raw).unwrap().vcc_pins().collect::<Vec<_>>(),
            vec![33]
        );
        assert!(matches!(
            Configuration::parse(r#"{"ssid":"a","password":"","host":"h","pins":{"41":"adc"}}"#),
            Err(ConfigError::Invalid { field: "pins", .. })
        ));
    }

    #[test]
    fn policy_overrides_are_partial() {
        let raw = r#"{"ssid":"a","password":"","host":"h","policy":{"bootLoopThreshold":7,"restMode":"light"}}"#;
        let policy = Configuration::parse(raw).unwrap().policy().clone();
        assert_eq!(policy.boot_loop_threshold, 7);
        assert_eq!(policy.rest_mode, RestMode::Light);
        assert_eq!(policy.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn unusable_values_are_invalid() {
        let too_long = format!(r#"{{"ssid":"{}","password":"","host":"h"}}"#, "x".repeat(33));
        assert!(matches!(
            Configuration::parse(&too_long),
            Err(ConfigError::Invalid { field: "ssid", .. })
        ));
        assert!(matches!(
            Configuration::parse(r#"{"ssid":"a","password":"","host":"h","deviceId":"a/b"}"#),
            Err(ConfigError::Invalid { field: "deviceId", .. })
        ));
        assert!(matches!(
            Configuration::parse(r#"{"ssid":"a","password":"","host":" "}"#),
            Err(ConfigError::Invalid { field: "host", .. })
        ));
    }
}
