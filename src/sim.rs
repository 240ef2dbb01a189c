//! Scriptable stand-ins for the device's peripherals, for host builds.
//!
//! Every type is a cheap handle onto shared state, so a test keeps one clone
//! to script and inspect while the code under test owns another.

use anyhow::{anyhow, Result};
use embedded_hal::digital::v2::OutputPin;
use embedded_svc::http::Method;
use std::{
    collections::VecDeque,
    convert::Infallible,
    ops::ControlFlow,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use crate::{
    http::{HttpTransport, TransmitError},
    ota::{FirmwareSlot, ImageWriter},
    portal::{LocalServer, Portal, Response},
    power::{RestMode, Sleeper},
    storage::Storage,
    wifi::{ConnectError, Radio},
};

/// Size of the chunks a [`SimTransport`] hands to its sink.
const CHUNK_LEN: usize = 64;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PinState {
    high: bool,
    writes: usize,
}

/// An output pin that remembers its level.
#[derive(Clone, Debug, Default)]
pub struct SimPin {
    state: Arc<Mutex<PinState>>,
}

impl SimPin {
    #[must_use]
    pub fn is_high(&self) -> bool {
        lock(&self.state).high
    }

    /// Number of times the level was driven.
    #[must_use]
    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    fn drive(&self, high: bool) {
        let mut state = lock(&self.state);
        state.high = high;
        state.writes += 1;
    }
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SleeperState {
    rests: Vec<(RestMode, Duration)>,
    halted: bool,
}

/// Records sleeps instead of sleeping.
#[derive(Clone, Debug, Default)]
pub struct SimSleeper {
    state: Arc<Mutex<SleeperState>>,
}

impl SimSleeper {
    #[must_use]
    pub fn rests(&self) -> Vec<(RestMode, Duration)> {
        lock(&self.state).rests.clone()
    }

    #[must_use]
    pub fn halted(&self) -> bool {
        lock(&self.state).halted
    }
}

impl Sleeper for SimSleeper {
    fn sleep(&mut self, mode: RestMode, duration: Duration) -> Result<()> {
        lock(&self.state).rests.push((mode, duration));
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        lock(&self.state).halted = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RadioState {
    failure: Option<ConnectError>,
    joins: usize,
    access_point: Option<String>,
    advertised: Option<String>,
}

/// A radio that joins instantly, or fails the way it was told to.
#[derive(Clone, Debug, Default)]
pub struct SimRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimRadio {
    #[must_use]
    pub fn failing(error: ConnectError) -> Self {
        let radio = Self::default();
        radio.fail_with(Some(error));
        radio
    }

    /// Makes later joins fail with `error`, or succeed again with `None`.
    pub fn fail_with(&self, error: Option<ConnectError>) {
        lock(&self.state).failure = error;
    }

    /// Number of join attempts.
    #[must_use]
    pub fn joins(&self) -> usize {
        lock(&self.state).joins
    }

    /// Name of the hosted access point, if any.
    #[must_use]
    pub fn access_point(&self) -> Option<String> {
        lock(&self.state).access_point.clone()
    }

    /// Host name last announced over mDNS.
    #[must_use]
    pub fn advertised(&self) -> Option<String> {
        lock(&self.state).advertised.clone()
    }
}

impl Radio for SimRadio {
    fn join(&mut self, _ssid: &str, _secret: &str, _budget: Duration) -> Result<(), ConnectError> {
        let mut state = lock(&self.state);
        state.joins += 1;
        state.failure.map_or(Ok(()), Err)
    }

    fn host_access_point(&mut self, ssid: &str) -> Result<()> {
        lock(&self.state).access_point = Some(ssid.to_owned());
        Ok(())
    }

    fn advertise(&mut self, hostname: &str) -> Result<()> {
        lock(&self.state).advertised = Some(hostname.to_owned());
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Answer {
    Status(u16, Vec<u8>),
    Error(TransmitError),
    Unreachable,
}

/// A scripted answer to the next HTTP exchange.
#[derive(Clone, Debug)]
pub struct Reply {
    answer: Answer,
    delay: Duration,
    pace: Duration,
}

impl Reply {
    /// `200` with `body`.
    #[must_use]
    pub fn ok(body: &str) -> Self {
        Self::bytes(200, body.as_bytes().to_vec())
    }

    /// `status` with an empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::bytes(status, Vec::new())
    }

    #[must_use]
    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            answer: Answer::Status(status, body),
            delay: Duration::ZERO,
            pace: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn error(error: TransmitError) -> Self {
        Self {
            answer: Answer::Error(error),
            delay: Duration::ZERO,
            pace: Duration::ZERO,
        }
    }

    /// Nobody answers; the exchange times out after its full timeout.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            answer: Answer::Unreachable,
            delay: Duration::ZERO,
            pace: Duration::ZERO,
        }
    }

    /// Answers only after `delay`, whatever the exchange's timeout.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Streams the body one 64-byte chunk every `pace`, like a slow server.
    #[must_use]
    pub fn trickled(self, pace: Duration) -> Self {
        Self { pace, ..self }
    }
}

/// One exchange seen by [`SimTransport`].
#[derive(Clone, Debug)]
pub struct SentRequest {
    pub method: Method,
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct TransportState {
    replies: VecDeque<Reply>,
    requests: Vec<SentRequest>,
}

/// An HTTP transport answering from a queue of [`Reply`]s.
///
/// An exchange with nothing queued is refused.
#[derive(Clone, Debug, Default)]
pub struct SimTransport {
    state: Arc<Mutex<TransportState>>,
}

impl SimTransport {
    pub fn push(&self, reply: Reply) {
        lock(&self.state).replies.push_back(reply);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<SentRequest> {
        lock(&self.state).requests.clone()
    }
}

impl HttpTransport for SimTransport {
    fn exchange(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<u16, TransmitError> {
        let reply = {
            let mut state = lock(&self.state);
            state.requests.push(SentRequest {
                method,
                url: url.to_owned(),
                body: body.unwrap_or_default().to_vec(),
            });
            state.replies.pop_front()
        };
        let Some(reply) = reply else {
            return Err(TransmitError::ConnectionRefused);
        };

        if !reply.delay.is_zero() {
            thread::sleep(reply.delay);
        }

        match reply.answer {
            Answer::Status(status, body) => {
                for chunk in body.chunks(CHUNK_LEN) {
                    if !reply.pace.is_zero() {
                        thread::sleep(reply.pace);
                    }
                    if sink(chunk).is_break() {
                        break;
                    }
                }
                Ok(status)
            }
            Answer::Error(error) => Err(error),
            Answer::Unreachable => {
                thread::sleep(timeout);
                Err(TransmitError::Timeout)
            }
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    image: Option<Vec<u8>>,
    fail_writes: bool,
    begins: usize,
    aborts: usize,
    marked_valid: bool,
}

/// An inactive firmware slot in memory.
#[derive(Clone, Debug, Default)]
pub struct SimSlot {
    state: Arc<Mutex<SlotState>>,
}

impl SimSlot {
    /// The last completed image.
    #[must_use]
    pub fn image(&self) -> Option<Vec<u8>> {
        lock(&self.state).image.clone()
    }

    /// Makes every chunk write fail, as a worn flash would.
    pub fn fail_writes(&self) {
        lock(&self.state).fail_writes = true;
    }

    /// Number of images started.
    #[must_use]
    pub fn begins(&self) -> usize {
        lock(&self.state).begins
    }

    #[must_use]
    pub fn aborts(&self) -> usize {
        lock(&self.state).aborts
    }

    #[must_use]
    pub fn marked_valid(&self) -> bool {
        lock(&self.state).marked_valid
    }
}

/// An image being written into a [`SimSlot`].
pub struct SimWriter {
    slot: SimSlot,
    image: Vec<u8>,
}

impl ImageWriter for SimWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if lock(&self.slot.state).fail_writes {
            return Err(anyhow!("flash write failed"));
        }
        self.image.extend_from_slice(chunk);
        Ok(())
    }

    fn complete(self) -> Result<()> {
        lock(&self.slot.state).image = Some(self.image);
        Ok(())
    }

    fn abort(self) {
        lock(&self.slot.state).aborts += 1;
    }
}

impl FirmwareSlot for SimSlot {
    type Writer<'a> = SimWriter;

    fn begin(&mut self) -> Result<SimWriter> {
        lock(&self.state).begins += 1;
        Ok(SimWriter {
            slot: self.clone(),
            image: Vec::new(),
        })
    }

    fn mark_valid(&mut self) -> Result<()> {
        lock(&self.state).marked_valid = true;
        Ok(())
    }
}

/// A local server that keeps the portal and serves requests handed to it.
pub struct SimServer<S: Storage> {
    portal: Arc<Mutex<Option<Portal<S>>>>,
}

impl<S: Storage> Clone for SimServer<S> {
    fn clone(&self) -> Self {
        Self {
            portal: self.portal.clone(),
        }
    }
}

impl<S: Storage> Default for SimServer<S> {
    fn default() -> Self {
        Self {
            portal: Arc::new(Mutex::new(None)),
        }
    }
}

impl<S: Storage> SimServer<S> {
    #[must_use]
    pub fn is_serving(&self) -> bool {
        lock(&self.portal).is_some()
    }

    /// Sends a request to the served portal.
    ///
    /// # Errors
    /// Returns an error if nothing is being served.
    pub fn request(&self, method: Method, path: &str, body: &[u8]) -> Result<Response> {
        lock(&self.portal)
            .as_ref()
            .map(|portal| portal.handle(method, path, body))
            .ok_or_else(|| anyhow!("local server is not running"))
    }

    /// Uploads `image` to `POST /firmware` of the served portal, writing into `slot`.
    ///
    /// # Errors
    /// Returns an error if nothing is being served.
    pub fn upload<O: FirmwareSlot>(&self, image: &[u8], sha256: Option<&str>, slot: &mut O) -> Result<Response> {
        let mut rest = image;
        lock(&self.portal)
            .as_ref()
            .map(|portal| {
                portal.accept_firmware(slot, sha256, |buf| {
                    let len = rest.len().min(buf.len());
                    buf[..len].copy_from_slice(&rest[..len]);
                    rest = &rest[len..];
                    Ok(len)
                })
            })
            .ok_or_else(|| anyhow!("local server is not running"))
    }
}

impl<S: Storage> LocalServer<S> for SimServer<S> {
    fn serve(&mut self, portal: Portal<S>) -> Result<()> {
        *lock(&self.portal) = Some(portal);
        Ok(())
    }
}
