use embedded_svc::http::Method;
use log::{debug, warn};
use serde_json::{json, Value};
use std::{error::Error, fmt, ops::ControlFlow, time::Duration};

use crate::time::Deadline;

/// Why a single HTTP exchange failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitError {
    /// No complete answer within the timeout.
    Timeout,
    /// The endpoint could not be reached.
    ConnectionRefused,
    /// The endpoint answered with a non-success status.
    ServerError(u16),
    /// The value has no JSON representation.
    NotANumber,
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitError::Timeout => write!(f, "request timed out"),
            TransmitError::ConnectionRefused => write!(f, "connection refused"),
            TransmitError::ServerError(status) => write!(f, "server answered {status}"),
            TransmitError::NotANumber => write!(f, "value is not a finite number"),
        }
    }
}

impl Error for TransmitError {}

/// One HTTP exchange, body streamed to `sink`.
///
/// `sink` may return [`ControlFlow::Break`] to stop reading; the exchange
/// then still reports the status it got.
pub trait HttpTransport {
    /// Performs a single request without retrying.
    ///
    /// # Errors
    /// Returns a [`TransmitError`] if no status line arrived within `timeout`.
    fn exchange(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<u16, TransmitError>;
}

/// Posts readings and arbitrary JSON to the telemetry endpoint.
pub struct TelemetryClient<T: HttpTransport> {
    transport: T,
    base_url: String,
    timeout: Duration,
    version: &'static str,
}

impl<T: HttpTransport> TelemetryClient<T> {
    /// # Arguments
    /// * `transport` - The HTTP transport.
    /// * `base_url` - The device's service URL, see [`crate::wifi::ConnectivityManager::base_url`].
    /// * `timeout` - Timeout of the convenience calls.
    /// * `version` - Firmware version reported by [`TelemetryClient::ping`].
    #[must_use]
    pub fn new(transport: T, base_url: &str, timeout: Duration, version: &'static str) -> Self {
        Self {
            transport,
            base_url: base_url.to_owned(),
            timeout,
            version,
        }
    }

    /// Posts `{"<sensor_type>": value}` to `{base}/values`.
    ///
    /// # Errors
    /// Returns [`TransmitError::NotANumber`] without sending anything if
    /// `value` is NaN or infinite, otherwise a [`TransmitError`] if the post fails.
    pub fn post_sensor_value(&mut self, sensor_type: &str, value: f32) -> Result<String, TransmitError> {
        if !value.is_finite() {
            warn!("Refusing to post {sensor_type} = {value}");
            return Err(TransmitError::NotANumber);
        }

        let mut payload = serde_json::Map::new();
        payload.insert(sensor_type.to_owned(), json!(value));

        let url = format!("{}/values", self.base_url);
        self.transmit(&url, &Value::Object(payload), self.timeout)
    }

    /// Announces that the node is alive and which firmware it runs.
    ///
    /// # Errors
    /// Returns a [`TransmitError`] if the post fails.
    pub fn ping(&mut self) -> Result<String, TransmitError> {
        let url = format!("{}/ping", self.base_url);
        self.transmit(&url, &json!({ "version": self.version }), self.timeout)
    }

    /// Posts `payload` to `url` once and returns the response body.
    ///
    /// A reply that only arrives after `timeout` is discarded, and a body
    /// still streaming at the deadline is cut off, so the caller never waits
    /// past `timeout` for more than one chunk.
    ///
    /// # Errors
    /// Returns a [`TransmitError`] on timeout, refused connection or non-2xx status.
    pub fn transmit(&mut self, url: &str, payload: &Value, timeout: Duration) -> Result<String, TransmitError> {
        if timeout.is_zero() {
            return Err(TransmitError::Timeout);
        }

        let body = payload.to_string();
        let deadline = Deadline::after(timeout);
        let mut response = Vec::new();
        let status = self.transport.exchange(
            Method::Post,
            url,
            Some(body.as_bytes()),
            timeout,
            &mut |chunk| {
                if deadline.expired() {
                    return ControlFlow::Break(());
                }
                response.extend_from_slice(chunk);
                ControlFlow::Continue(())
            },
        )?;

        if deadline.expired() {
            warn!(
                "POST {url} answered after {}ms, past its {}ms timeout",
                deadline.elapsed().as_millis(),
                timeout.as_millis()
            );
            return Err(TransmitError::Timeout);
        }
        debug!("POST {url} -> {status}");

        if !(200..300).contains(&status) {
            return Err(TransmitError::ServerError(status));
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspTransport;

#[cfg(target_os = "espidf")]
mod esp {
    use embedded_svc::{
        http::{client::Client as HttpClient, Method, Status},
        io::{Read, Write},
    };
    use esp_idf_svc::{
        http::client::{Configuration, EspHttpConnection},
        io::EspIOError,
        sys::{ESP_ERR_HTTP_CONNECT, ESP_ERR_HTTP_CONNECTING},
    };
    use log::warn;
    use std::{ops::ControlFlow, time::Duration};

    use super::{HttpTransport, TransmitError};
    use crate::time::Deadline;

    const CHUNK_SIZE: usize = 1024;

    /// HTTP over the ESP-IDF client, one connection per exchange.
    #[derive(Default)]
    pub struct EspTransport;

    fn classify(e: &EspIOError) -> TransmitError {
        let code = e.0.code();
        if code == ESP_ERR_HTTP_CONNECT as i32 || code == ESP_ERR_HTTP_CONNECTING as i32 {
            TransmitError::ConnectionRefused
        } else {
            warn!("HTTP exchange failed: {e}");
            TransmitError::Timeout
        }
    }

    impl HttpTransport for EspTransport {
        fn exchange(
            &mut self,
            method: Method,
            url: &str,
            body: Option<&[u8]>,
            timeout: Duration,
            sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
        ) -> Result<u16, TransmitError> {
            // The client timeout bounds each socket operation, not the exchange.
            let deadline = Deadline::after(timeout);
            let connection = EspHttpConnection::new(&Configuration {
                timeout: Some(timeout),
                ..Default::default()
            })
            .map_err(|e| classify(&e.into()))?;
            let mut client = HttpClient::wrap(connection);

            let payload = body.unwrap_or(b"");
            let content_length_header = format!("{}", payload.len());
            let headers = [
                ("content-type", "application/json"),
                ("content-length", &*content_length_header),
            ];

            let mut request = client
                .request(method, url, &headers)
                .map_err(|e| classify(&e))?;
            request.write_all(payload).map_err(|e| classify(&e))?;
            request.flush().map_err(|e| classify(&e))?;

            let mut response = request.submit().map_err(|e| classify(&e))?;
            let status = response.status();

            let mut buf = [0_u8; CHUNK_SIZE];
            loop {
                if deadline.expired() {
                    warn!("{url} still streaming after {}ms, giving up", timeout.as_millis());
                    return Err(TransmitError::Timeout);
                }
                let read = response.read(&mut buf).map_err(|e| classify(&e))?;
                if read == 0 || sink(&buf[..read]).is_break() {
                    break;
                }
            }

            Ok(status)
        }
    }
}
