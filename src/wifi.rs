use anyhow::Result;
use log::{info, warn};
use std::{error::Error, fmt, time::Duration};

use crate::config::Configuration;

/// Why joining the network failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// The budget elapsed before the interface came up.
    TimedOut,
    /// The network rejected the credentials.
    AuthFailed,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::TimedOut => write!(f, "network join timed out"),
            ConnectError::AuthFailed => write!(f, "network rejected the credentials"),
        }
    }
}

impl Error for ConnectError {}

/// The base URL was asked for before a successful [`ConnectivityManager::connect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotConnected;

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not connected")
    }
}

impl Error for NotConnected {}

/// The wireless station interface.
pub trait Radio {
    /// Joins `ssid`, blocking until the interface is up or `budget` elapses.
    /// Never retries on its own.
    ///
    /// # Errors
    /// Returns a [`ConnectError`] if the network was not joined.
    fn join(&mut self, ssid: &str, secret: &str, budget: Duration) -> Result<(), ConnectError>;

    /// Hosts an open access point named `ssid` for local configuration.
    ///
    /// # Errors
    /// Returns an error if the access point cannot be started.
    fn host_access_point(&mut self, ssid: &str) -> Result<()>;

    /// Announces `hostname`.local and the local HTTP server over mDNS.
    ///
    /// # Errors
    /// Returns an error if the responder cannot be set up.
    fn advertise(&mut self, hostname: &str) -> Result<()>;
}

/// Builds the device's service URL from the configured host and identifier.
///
/// Depends on nothing but its arguments.
#[must_use]
pub fn base_url(host: &str, device_id: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/api/devices/{device_id}")
    } else {
        format!("http://{host}/api/devices/{device_id}")
    }
}

/// Link state of the current boot.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Link {
    Down,
    Station { base_url: String },
    AccessPoint,
}

/// Joins the configured network and knows the service URL once joined.
pub struct ConnectivityManager<R: Radio> {
    radio: R,
    link: Link,
}

impl<R: Radio> ConnectivityManager<R> {
    #[must_use]
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            link: Link::Down,
        }
    }

    /// Joins the network named by `config` within `budget`.
    ///
    /// # Errors
    /// Returns the radio's [`ConnectError`]; the caller owns any retry decision.
    pub fn connect(&mut self, config: &Configuration, budget: Duration) -> Result<(), ConnectError> {
        if let Link::Station { .. } = self.link {
            return Ok(());
        }

        info!(
            "Joining `{}` (budget {}ms)",
            config.ssid(),
            budget.as_millis()
        );
        match self.radio.join(config.ssid(), config.password(), budget) {
            Ok(()) => {
                let base_url = base_url(config.host(), config.device_id());
                info!("Joined `{}`, service at {base_url}", config.ssid());
                self.link = Link::Station { base_url };
                self.advertise(config.device_id());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to join `{}`: {e}", config.ssid());
                self.link = Link::Down;
                Err(e)
            }
        }
    }

    /// Falls back to hosting an access point named after the device.
    ///
    /// # Errors
    /// Returns an error if the access point cannot be started.
    pub fn host_access_point(&mut self, device_id: &str) -> Result<()> {
        self.radio.host_access_point(device_id)?;
        info!("Hosting access point `{device_id}`");
        self.link = Link::AccessPoint;
        self.advertise(device_id);
        Ok(())
    }

    fn advertise(&mut self, device_id: &str) {
        match self.radio.advertise(device_id) {
            Ok(()) => info!("Advertising `{device_id}.local`"),
            Err(e) => warn!("mDNS unavailable: {e:#}"),
        }
    }

    /// The service URL of this device.
    ///
    /// # Errors
    /// Returns [`NotConnected`] unless a station join succeeded this boot.
    pub fn base_url(&self) -> Result<&str, NotConnected> {
        match &self.link {
            Link::Station { base_url } => Ok(base_url),
            Link::Down | Link::AccessPoint => Err(NotConnected),
        }
    }

    #[must_use]
    pub fn radio(&self) -> &R {
        &self.radio
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspRadio;

#[cfg(target_os = "espidf")]
mod esp {
    use anyhow::{anyhow, Result};
    use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
    use esp_idf_svc::{
        eventloop::EspSystemEventLoop,
        hal::modem::Modem,
        mdns::EspMdns,
        nvs::EspDefaultNvsPartition,
        sys::{EspError, ESP_ERR_WIFI_PASSWORD, ESP_ERR_WIFI_SSID},
        wifi::EspWifi,
    };
    use log::warn;
    use std::time::Duration;

    use super::{ConnectError, Radio};
    use crate::time::{sleep, Deadline};

    const POLL_INTERVAL_MS: u32 = 100;

    /// The ESP32 Wi-Fi driver.
    pub struct EspRadio {
        wifi: EspWifi<'static>,
        mdns: Option<EspMdns>,
    }

    impl EspRadio {
        /// Creates the driver; the radio stays off until [`Radio::join`].
        ///
        /// # Errors
        /// Returns an error if the driver cannot be created.
        pub fn new(
            modem: Modem,
            sys_loop: EspSystemEventLoop,
            nvs: Option<EspDefaultNvsPartition>,
        ) -> Result<Self> {
            Ok(Self {
                wifi: EspWifi::new(modem, sys_loop, nvs)?,
                mdns: None,
            })
        }

        fn classify(e: &EspError) -> ConnectError {
            let code = e.code();
            if code == ESP_ERR_WIFI_PASSWORD as i32 || code == ESP_ERR_WIFI_SSID as i32 {
                ConnectError::AuthFailed
            } else {
                warn!("Wi-Fi driver error: {e}");
                ConnectError::TimedOut
            }
        }
    }

    impl Radio for EspRadio {
        fn join(&mut self, ssid: &str, secret: &str, budget: Duration) -> Result<(), ConnectError> {
            let configuration = Configuration::Client(ClientConfiguration {
                auth_method: if secret.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ssid: ssid.try_into().map_err(|()| ConnectError::AuthFailed)?,
                password: secret.try_into().map_err(|()| ConnectError::AuthFailed)?,
                ..Default::default()
            });

            let deadline = Deadline::after(budget);
            self.wifi
                .set_configuration(&configuration)
                .map_err(|e| Self::classify(&e))?;
            self.wifi.start().map_err(|e| Self::classify(&e))?;
            self.wifi.connect().map_err(|e| Self::classify(&e))?;

            while !deadline.expired() {
                if self.wifi.is_up().map_err(|e| Self::classify(&e))? {
                    return Ok(());
                }
                sleep(POLL_INTERVAL_MS);
            }

            let _ = self.wifi.disconnect();
            Err(ConnectError::TimedOut)
        }

        fn host_access_point(&mut self, ssid: &str) -> Result<()> {
            let _ = self.wifi.disconnect();
            let _ = self.wifi.stop();

            self.wifi
                .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                    ssid: ssid
                        .try_into()
                        .map_err(|()| anyhow!("Failed to convert access point SSID"))?,
                    auth_method: AuthMethod::None,
                    channel: 1,
                    ..Default::default()
                }))?;
            self.wifi.start()?;

            Ok(())
        }

        fn advertise(&mut self, hostname: &str) -> Result<()> {
            if self.mdns.is_none() {
                self.mdns = Some(EspMdns::take()?);
            }
            let mdns = self
                .mdns
                .as_mut()
                .ok_or_else(|| anyhow!("Failed to take mDNS"))?;

            mdns.set_hostname(hostname)?;
            mdns.add_service(None, "_http", "_tcp", 80, &[("path", "/status")])?;

            Ok(())
        }
    }
}
