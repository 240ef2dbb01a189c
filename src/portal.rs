//! The local configuration and diagnostics server.
//!
//! Request handling lives in [`Portal`], which knows nothing about sockets;
//! a [`LocalServer`] binds it to a real (or simulated) HTTP server.

use anyhow::Result;
use embedded_svc::http::Method;
use log::{info, warn};
use serde_json::{json, Value};
use std::{error::Error, fmt};

use crate::{
    config::Configuration,
    gate::ServeCause,
    ota::{self, FirmwareSlot},
    persist::{FirmwareFlag, PersistentCounter, UpdateFlag, UpdateRequest},
    reset::ResetReason,
    storage::{Storage, CONFIG_KEY},
};

/// Largest request body the portal reads, firmware uploads aside.
pub const MAX_BODY_LEN: usize = 4096;

/// Optional header carrying the hex SHA-256 of an uploaded image.
pub const SHA256_HEADER: &str = "X-Firmware-Sha256";

/// Why a portal request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortalError {
    BadRequest(String),
    Conflict(&'static str),
    NotFound,
    MethodNotAllowed,
    Storage(String),
}

impl PortalError {
    /// HTTP status answering this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            PortalError::BadRequest(_) => 400,
            PortalError::NotFound => 404,
            PortalError::MethodNotAllowed => 405,
            PortalError::Conflict(_) => 409,
            PortalError::Storage(_) => 500,
        }
    }
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalError::BadRequest(e) => write!(f, "bad request: {e}"),
            PortalError::Conflict(e) => write!(f, "{e}"),
            PortalError::NotFound => write!(f, "no such route"),
            PortalError::MethodNotAllowed => write!(f, "method not allowed"),
            PortalError::Storage(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl Error for PortalError {}

/// A handled request, ready to be written out.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    /// The device must restart once the response is sent.
    pub restart: bool,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            restart: false,
        }
    }

    fn accepted(body: Value) -> Self {
        Self {
            status: 202,
            ..Self::ok(body)
        }
    }
}

impl From<PortalError> for Response {
    fn from(e: PortalError) -> Self {
        Self {
            status: e.status(),
            body: json!({ "error": e.to_string() }),
            restart: false,
        }
    }
}

/// What the boot knew when it decided to serve.
#[derive(Clone, Copy, Debug)]
pub struct BootReport {
    pub boot_count: u32,
    pub reset: ResetReason,
    pub flag_at_entry: UpdateFlag,
    pub cause: ServeCause,
    pub version: &'static str,
}

/// Route handlers of the local server.
#[derive(Clone)]
pub struct Portal<S: Storage> {
    storage: S,
    config: Configuration,
    report: BootReport,
}

impl<S: Storage> Portal<S> {
    /// # Arguments
    /// * `storage` - The persisted state the handlers read and write.
    /// * `config` - The configuration active this boot.
    /// * `report` - What the boot found on entry.
    #[must_use]
    pub fn new(storage: S, config: Configuration, report: BootReport) -> Self {
        Self {
            storage,
            config,
            report,
        }
    }

    /// Dispatches one request whose body fits in memory.
    ///
    /// Firmware uploads are streamed and go through [`Portal::accept_firmware`].
    #[must_use]
    pub fn handle(&self, method: Method, path: &str, body: &[u8]) -> Response {
        let path = path.split('?').next().unwrap_or(path);
        info!("Portal {method:?} {path}");

        let handled = match (path, method) {
            ("/status", Method::Get) => Ok(Response::ok(self.status())),
            ("/config", Method::Get) => Ok(Response::ok(self.config())),
            ("/config", Method::Put) => self.replace_config(body),
            ("/counter", Method::Delete) => Ok(Response::ok(self.clear_counter())),
            ("/update", Method::Post) => self.request_update(),
            ("/restart", Method::Post) => Ok(Response {
                restart: true,
                ..Response::ok(json!({ "restarting": true }))
            }),
            ("/firmware", Method::Post) => Err(PortalError::BadRequest(
                "firmware images must be streamed".to_owned(),
            )),
            ("/status" | "/config" | "/counter" | "/update" | "/restart" | "/firmware", _) => {
                Err(PortalError::MethodNotAllowed)
            }
            _ => Err(PortalError::NotFound),
        };

        handled.unwrap_or_else(|e| {
            warn!("Portal {method:?} {path} refused: {e}");
            e.into()
        })
    }

    /// Installs a firmware image uploaded to `POST /firmware`.
    ///
    /// The image goes from `read` straight into `slot`. Once it is in place
    /// the update flag becomes [`UpdateFlag::Applied`] and the response asks
    /// for a restart, so the new image boots on probation like a fetched one.
    ///
    /// # Arguments
    /// * `slot` - The inactive firmware slot.
    /// * `sha256` - Digest from the [`SHA256_HEADER`] header, if sent.
    /// * `read` - Reads the request body, returning 0 at its end.
    pub fn accept_firmware<O: FirmwareSlot>(
        &self,
        slot: &mut O,
        sha256: Option<&str>,
        read: impl FnMut(&mut [u8]) -> Result<usize>,
    ) -> Response {
        info!("Portal firmware upload");

        match ota::receive_image(slot, sha256, read) {
            Ok(written) => {
                FirmwareFlag::new(self.storage.clone()).set(UpdateFlag::Applied);
                info!("Uploaded firmware installed ({written} bytes), restarting into it");
                Response {
                    restart: true,
                    ..Response::ok(json!({ "installed": true, "bytes": written }))
                }
            }
            Err(e) => {
                let e = PortalError::BadRequest(format!("{e:#}"));
                warn!("Firmware upload refused: {e}");
                e.into()
            }
        }
    }

    fn status(&self) -> Value {
        json!({
            "deviceId": self.config.device_id(),
            "version": self.report.version,
            "bootCount": PersistentCounter::new(self.storage.clone()).load(),
            "bootCountAtEntry": self.report.boot_count,
            "resetReason": self.report.reset.to_string(),
            "updateFlag": FirmwareFlag::new(self.storage.clone()).load().to_string(),
            "updateFlagAtEntry": self.report.flag_at_entry.to_string(),
            "updateRequested": UpdateRequest::new(self.storage.clone()).pending(),
            "serving": self.report.cause.to_string(),
        })
    }

    fn config(&self) -> Value {
        let config = &self.config;
        json!({
            "ssid": config.ssid(),
            "passwordSet": !config.password().is_empty(),
            "host": config.host(),
            "deviceId": config.device_id(),
            "features": config.features(),
            "pins": config.pins(),
            "ota": config.ota(),
            "policy": config.policy(),
        })
    }

    fn replace_config(&self, body: &[u8]) -> Result<Response, PortalError> {
        let raw = std::str::from_utf8(body).map_err(|e| PortalError::BadRequest(e.to_string()))?;
        let parsed = Configuration::parse(raw).map_err(|e| PortalError::BadRequest(e.to_string()))?;

        self.storage
            .set_str(CONFIG_KEY, raw)
            .map_err(|e| PortalError::Storage(format!("{e:#}")))?;
        info!("Stored new configuration for `{}`", parsed.device_id());

        Ok(Response::ok(json!({ "stored": true, "restartRequired": true })))
    }

    fn clear_counter(&self) -> Value {
        PersistentCounter::new(self.storage.clone()).clear();
        FirmwareFlag::new(self.storage.clone()).clear();
        info!("Boot counter and update flag cleared");

        json!({ "bootCount": 0, "updateFlag": UpdateFlag::Idle.to_string() })
    }

    fn request_update(&self) -> Result<Response, PortalError> {
        if !self.config.features().allow_auto_update {
            return Err(PortalError::Conflict("firmware updates are disabled"));
        }

        UpdateRequest::new(self.storage.clone()).set();
        Ok(Response::accepted(json!({ "updateRequested": true })))
    }
}

/// Something that can serve a [`Portal`] over HTTP.
pub trait LocalServer<S: Storage> {
    /// Starts serving; returns once the server accepts requests.
    ///
    /// # Errors
    /// Returns an error if the server cannot be started.
    fn serve(&mut self, portal: Portal<S>) -> Result<()>;
}

#[cfg(target_os = "espidf")]
pub use esp::EspPortalServer;

#[cfg(target_os = "espidf")]
mod esp {
    use anyhow::{anyhow, Result};
    use embedded_svc::{
        http::{Headers, Method},
        io::{Read, Write},
    };
    use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
    use std::sync::Arc;

    use super::{LocalServer, Portal, Response, MAX_BODY_LEN, SHA256_HEADER};
    use crate::{ota::EspSlot, storage::Storage, thread};

    const ROUTES: [(&str, Method); 6] = [
        ("/status", Method::Get),
        ("/config", Method::Get),
        ("/config", Method::Put),
        ("/counter", Method::Delete),
        ("/update", Method::Post),
        ("/restart", Method::Post),
    ];

    /// The ESP-IDF HTTP server. Requests are served for as long as it lives.
    #[derive(Default)]
    pub struct EspPortalServer {
        server: Option<EspHttpServer<'static>>,
    }

    fn read_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> Result<Vec<u8>> {
        let len = usize::try_from(req.content_len().unwrap_or(0))?;
        if len > MAX_BODY_LEN {
            return Err(anyhow!("request body too large"));
        }

        let mut body = vec![0_u8; len];
        if len > 0 {
            req.read_exact(&mut body)
                .map_err(|e| anyhow!("Failed to read request body: {e:?}"))?;
        }
        Ok(body)
    }

    fn write_response(req: Request<&mut EspHttpConnection<'_>>, response: &Response) -> Result<()> {
        let body = serde_json::to_vec(&response.body)?;
        req.into_response(
            response.status,
            None,
            &[("Content-Type", "application/json; charset=utf-8")],
        )?
        .write_all(&body)?;
        Ok(())
    }

    impl<S: Storage> LocalServer<S> for EspPortalServer {
        fn serve(&mut self, portal: Portal<S>) -> Result<()> {
            let mut server = EspHttpServer::new(&Configuration {
                stack_size: 16 * 1024,
                ..Default::default()
            })?;
            let portal = Arc::new(portal);

            for (path, method) in ROUTES {
                let portal = portal.clone();
                server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
                    let body = read_body(&mut req)?;
                    let response = portal.handle(method, path, &body);
                    write_response(req, &response)?;

                    if response.restart {
                        thread::failure();
                    }
                    Ok(())
                })?;
            }

            let uploads = portal.clone();
            server.fn_handler::<anyhow::Error, _>("/firmware", Method::Post, move |mut req| {
                let sha256 = req.header(SHA256_HEADER).map(str::to_owned);
                let mut slot = EspSlot::default();
                let response = uploads.accept_firmware(&mut slot, sha256.as_deref(), |buf| {
                    req.read(buf)
                        .map_err(|e| anyhow!("Failed to read upload: {e:?}"))
                });
                drop(slot);
                write_response(req, &response)?;

                if response.restart {
                    thread::failure();
                }
                Ok(())
            })?;

            self.server = Some(server);
            Ok(())
        }
    }
}
