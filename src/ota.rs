use anyhow::{anyhow, ensure, Result};
use embedded_svc::http::Method;
use log::{info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{cmp::Ordering, ops::ControlFlow, time::Duration};

use crate::{
    http::{HttpTransport, TransmitError},
    time::Deadline,
};

/// Largest manifest accepted; anything bigger is not a manifest.
const MAX_MANIFEST_LEN: usize = 2048;

const UPLOAD_CHUNK_LEN: usize = 1024;

/// Result of one check-and-apply cycle.
///
/// # Variants
/// * `NoUpdateAvailable` - The server has nothing newer.
/// * `Applied` - A newer image is installed and selected; the device must reboot into it.
/// * `Failed` - The attempt failed; the running image is untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    NoUpdateAvailable,
    Applied { version: String },
    Failed(String),
}

/// Destination of a downloaded image.
pub trait ImageWriter {
    /// Appends a chunk of the image.
    ///
    /// # Errors
    /// Returns an error if the chunk cannot be written.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Finalises the image and selects it for the next boot.
    ///
    /// # Errors
    /// Returns an error if the image does not validate.
    fn complete(self) -> Result<()>;

    /// Discards a partial image.
    fn abort(self);
}

/// The inactive firmware slot.
pub trait FirmwareSlot {
    type Writer<'a>: ImageWriter
    where
        Self: 'a;

    /// Starts writing a new image into the inactive slot.
    ///
    /// # Errors
    /// Returns an error if no slot is available.
    fn begin(&mut self) -> Result<Self::Writer<'_>>;

    /// Marks the running image as good so the bootloader keeps it.
    ///
    /// # Errors
    /// Returns an error if the running slot cannot be updated.
    fn mark_valid(&mut self) -> Result<()>;
}

/// What the server says about available firmware.
#[derive(Debug, Deserialize)]
struct Manifest {
    version: String,
    url: Option<String>,
    sha256: Option<String>,
}

/// Compares two firmware versions.
///
/// Dotted numeric versions (optionally prefixed by `v`) compare by
/// component; anything else is only ever "equal" or "different", and a
/// different version counts as newer.
#[must_use]
pub fn is_newer(candidate: &str, current: &str) -> bool {
    fn components(version: &str) -> Option<Vec<u64>> {
        let version = version.trim();
        let version = version.strip_prefix('v').unwrap_or(version);
        version.split('.').map(|part| part.parse().ok()).collect()
    }

    match (components(candidate), components(current)) {
        (Some(mut candidate), Some(mut current)) => {
            let len = candidate.len().max(current.len());
            candidate.resize(len, 0);
            current.resize(len, 0);
            candidate.cmp(&current) == Ordering::Greater
        }
        _ => candidate.trim() != current.trim(),
    }
}

/// Fetches and installs firmware newer than the running one.
pub struct FirmwareUpdater<T: HttpTransport, O: FirmwareSlot> {
    transport: T,
    slot: O,
}

impl<T: HttpTransport, O: FirmwareSlot> FirmwareUpdater<T, O> {
    /// # Arguments
    /// * `transport` - Fetches the manifest and the image.
    /// * `slot` - The inactive firmware slot images are written to.
    #[must_use]
    pub fn new(transport: T, slot: O) -> Self {
        Self { transport, slot }
    }

    /// Looks for firmware newer than `current_version` at `{base_url}/firmware`
    /// (or `manifest_url`) and installs it.
    ///
    /// `timeout` covers the manifest and the image together; a transfer still
    /// running when it expires is cut off and the partial image discarded.
    /// Never retries. After [`UpdateOutcome::Applied`] the caller must reboot.
    pub fn check_and_apply(
        &mut self,
        base_url: &str,
        manifest_url: Option<&str>,
        current_version: &str,
        timeout: Duration,
    ) -> UpdateOutcome {
        let deadline = Deadline::after(timeout);
        let manifest_url = manifest_url.map_or_else(|| format!("{base_url}/firmware"), str::to_owned);

        let manifest = match self.fetch_manifest(&manifest_url, deadline) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return UpdateOutcome::NoUpdateAvailable,
            Err(e) => return Self::failed(&e),
        };

        if !is_newer(&manifest.version, current_version) {
            info!(
                "Running {current_version}, server offers {}: nothing to do",
                manifest.version
            );
            return UpdateOutcome::NoUpdateAvailable;
        }

        let image_url = manifest
            .url
            .clone()
            .unwrap_or_else(|| format!("{base_url}/firmware.bin"));
        info!(
            "Updating {current_version} -> {} from {image_url}",
            manifest.version
        );

        match self.install(&image_url, manifest.sha256.as_deref(), deadline) {
            Ok(written) => {
                info!("Installed {} ({written} bytes)", manifest.version);
                UpdateOutcome::Applied {
                    version: manifest.version,
                }
            }
            Err(e) => Self::failed(&e),
        }
    }

    /// Confirms the running image after a good cycle.
    ///
    /// # Errors
    /// Returns an error if the slot cannot be marked.
    pub fn confirm(&mut self) -> Result<()> {
        self.slot.mark_valid()
    }

    fn failed(e: &anyhow::Error) -> UpdateOutcome {
        warn!("Firmware update failed: {e:#}");
        UpdateOutcome::Failed(format!("{e:#}"))
    }

    fn fetch_manifest(&mut self, url: &str, deadline: Deadline) -> Result<Option<Manifest>> {
        ensure!(!deadline.expired(), "update budget spent before the manifest request");

        let mut body = Vec::new();
        let mut oversized = false;
        let mut timed_out = false;
        let status = self
            .transport
            .exchange(Method::Get, url, None, deadline.remaining(), &mut |chunk| {
                if deadline.expired() {
                    timed_out = true;
                    return ControlFlow::Break(());
                }
                if body.len() + chunk.len() > MAX_MANIFEST_LEN {
                    oversized = true;
                    return ControlFlow::Break(());
                }
                body.extend_from_slice(chunk);
                ControlFlow::Continue(())
            })
            .map_err(|e| anyhow!("manifest request to {url} failed: {e}"))?;
        ensure!(
            !timed_out && !deadline.expired(),
            "manifest request exceeded its timeout"
        );

        match status {
            304 | 404 => return Ok(None),
            200..=299 => {}
            status => return Err(TransmitError::ServerError(status).into()),
        }
        ensure!(!oversized, "manifest exceeds {MAX_MANIFEST_LEN} bytes");

        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn install(&mut self, url: &str, sha256: Option<&str>, deadline: Deadline) -> Result<u64> {
        ensure!(!deadline.expired(), "update budget spent before the image download");

        let mut image = StagedImage::new(self.slot.begin()?);
        let mut write_error = None;
        let mut timed_out = false;

        let exchanged = self.transport.exchange(
            Method::Get,
            url,
            None,
            deadline.remaining(),
            &mut |chunk| {
                if deadline.expired() {
                    timed_out = true;
                    return ControlFlow::Break(());
                }
                match image.push(chunk) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        write_error = Some(e);
                        ControlFlow::Break(())
                    }
                }
            },
        );

        let failure = match (exchanged, write_error) {
            (Err(e), _) => Some(anyhow!("image request to {url} failed: {e}")),
            (Ok(_), Some(e)) => Some(e.context("writing image")),
            (Ok(_), None) if timed_out || deadline.expired() => {
                Some(anyhow!("image download exceeded its timeout"))
            }
            (Ok(status), None) if !(200..300).contains(&status) => {
                Some(TransmitError::ServerError(status).into())
            }
            (Ok(_), None) => None,
        };

        match failure {
            Some(e) => {
                image.abort();
                Err(e)
            }
            None => image
                .commit(sha256)
                .map_err(|e| e.context(format!("image at {url}"))),
        }
    }
}

/// An image on its way into the inactive slot, hashed as it is written.
struct StagedImage<W: ImageWriter> {
    writer: W,
    hasher: Sha256,
    written: u64,
}

impl<W: ImageWriter> StagedImage<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write_chunk(chunk)?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Selects the image if it is non-empty and matches `sha256`; aborts it otherwise.
    fn commit(self, sha256: Option<&str>) -> Result<u64> {
        let verdict = if self.written == 0 {
            Err(anyhow!("image is empty"))
        } else {
            match sha256 {
                Some(expected) => {
                    let expected = expected.trim().to_ascii_lowercase();
                    let actual = format!("{:x}", self.hasher.finalize());
                    if actual == expected {
                        Ok(())
                    } else {
                        Err(anyhow!("sha256 mismatch (expected {expected}, got {actual})"))
                    }
                }
                None => Ok(()),
            }
        };

        match verdict {
            Ok(()) => {
                self.writer.complete()?;
                Ok(self.written)
            }
            Err(e) => {
                self.writer.abort();
                Err(e)
            }
        }
    }

    fn abort(self) {
        self.writer.abort();
    }
}

/// Streams an image handed over by someone on the local network into `slot`.
///
/// `read` fills the buffer it is given and returns how many bytes it wrote,
/// 0 once the image is complete. The image is selected for the next boot only
/// if it is non-empty and, when `sha256` is given, matches it.
///
/// # Returns
/// The number of bytes installed.
///
/// # Errors
/// Returns an error if reading, writing or verifying fails; the partial image
/// is then discarded and the running firmware stays selected.
pub fn receive_image<O: FirmwareSlot>(
    slot: &mut O,
    sha256: Option<&str>,
    mut read: impl FnMut(&mut [u8]) -> Result<usize>,
) -> Result<u64> {
    let mut image = StagedImage::new(slot.begin()?);
    let mut buf = [0_u8; UPLOAD_CHUNK_LEN];

    loop {
        let len = match read(&mut buf) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) => {
                image.abort();
                return Err(e.context("reading uploaded image"));
            }
        };
        if let Err(e) = image.push(&buf[..len]) {
            image.abort();
            return Err(e.context("writing uploaded image"));
        }
    }

    image.commit(sha256)
}

#[cfg(target_os = "espidf")]
pub use esp::EspSlot;

#[cfg(target_os = "espidf")]
mod esp {
    use anyhow::{anyhow, Result};
    use embedded_svc::io::Write;
    use esp_idf_svc::ota::{EspOta, EspOtaUpdate};

    use super::{FirmwareSlot, ImageWriter};

    /// The ESP-IDF OTA partitions.
    ///
    /// The OTA handle is only taken on first use, so a boot that never
    /// updates leaves it free for the local server's upload handler.
    #[derive(Default)]
    pub struct EspSlot {
        ota: Option<EspOta>,
    }

    impl EspSlot {
        fn ota(&mut self) -> Result<&mut EspOta> {
            if self.ota.is_none() {
                self.ota = Some(EspOta::new().map_err(|e| anyhow!("failed to acquire OTA: {e:?}"))?);
            }
            self.ota
                .as_mut()
                .ok_or_else(|| anyhow!("failed to acquire OTA"))
        }
    }

    impl ImageWriter for EspOtaUpdate<'_> {
        fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
            self.write_all(chunk)
                .map_err(|e| anyhow!("failed writing OTA data: {e:?}"))
        }

        fn complete(self) -> Result<()> {
            EspOtaUpdate::complete(self)
                .map_err(|e| anyhow!("failed finalizing OTA image: {e:?}"))?;
            Ok(())
        }

        fn abort(self) {
            if let Err(e) = EspOtaUpdate::abort(self) {
                log::warn!("Failed to abort OTA update: {e:?}");
            }
        }
    }

    impl FirmwareSlot for EspSlot {
        type Writer<'a> = EspOtaUpdate<'a>;

        fn begin(&mut self) -> Result<EspOtaUpdate<'_>> {
            self.ota()?
                .initiate_update()
                .map_err(|e| anyhow!("failed to initiate OTA update: {e:?}"))
        }

        fn mark_valid(&mut self) -> Result<()> {
            self.ota()?
                .mark_running_slot_valid()
                .map_err(|e| anyhow!("failed to mark running slot valid: {e:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Reply, SimSlot, SimTransport};
    use sha2::{Digest, Sha256};
    use std::time::Instant;

    const BASE: &str = "http://h/api/devices/d";

    fn updater(transport: &SimTransport, slot: &SimSlot) -> FirmwareUpdater<SimTransport, SimSlot> {
        FirmwareUpdater::new(transport.clone(), slot.clone())
    }

    #[test]
    fn versions_compare_numerically() {
        assert!(is_newer("1.10.0", "1.9.3"));
        assert!(is_newer("v2", "1.99"));
        assert!(!is_newer("1.2", "1.2.0"));
        assert!(!is_newer("1.2.0", "1.3.0"));
        assert!(is_newer("nightly-7", "nightly-6"));
        assert!(!is_newer("nightly-7", "nightly-7"));
    }

    #[test]
    fn not_modified_means_no_update() {
        let transport = SimTransport::default();
        transport.push(Reply::status(304));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_secs(5));
        assert_eq!(outcome, UpdateOutcome::NoUpdateAvailable);
        assert_eq!(transport.requests()[0].url, format!("{BASE}/firmware"));
        assert!(slot.image().is_none());
    }

    #[test]
    fn same_version_is_not_installed() {
        let transport = SimTransport::default();
        transport.push(Reply::ok(r#"{"version":"1.0.0"}"#));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_secs(5));
        assert_eq!(outcome, UpdateOutcome::NoUpdateAvailable);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn newer_image_is_verified_and_installed() {
        let image = b"\xE9firmware-image-bytes".to_vec();
        let digest = format!("{:x}", Sha256::digest(&image));
        let transport = SimTransport::default();
        transport.push(Reply::ok(&format!(
            r#"{{"version":"1.1.0","url":"http://cdn/fw.bin","sha256":"{digest}"}}"#
        )));
        transport.push(Reply::bytes(200, image.clone()));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_secs(5));
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                version: "1.1.0".to_owned()
            }
        );
        assert_eq!(transport.requests()[1].url, "http://cdn/fw.bin");
        assert_eq!(slot.image(), Some(image));
    }

    #[test]
    fn digest_mismatch_aborts_the_image() {
        let transport = SimTransport::default();
        transport.push(Reply::ok(&format!(
            r#"{{"version":"1.1.0","sha256":"{}"}}"#,
            "0".repeat(64)
        )));
        transport.push(Reply::bytes(200, b"image".to_vec()));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_secs(5));
        assert!(matches!(outcome, UpdateOutcome::Failed(reason) if reason.contains("sha256")));
        assert_eq!(transport.requests()[1].url, format!("{BASE}/firmware.bin"));
        assert!(slot.image().is_none());
        assert_eq!(slot.aborts(), 1);
    }

    #[test]
    fn unreachable_server_fails_without_retry() {
        let transport = SimTransport::default();
        transport.push(Reply::error(TransmitError::ConnectionRefused));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, Some("http://other/m.json"), "1.0.0", Duration::from_secs(5));
        assert!(matches!(outcome, UpdateOutcome::Failed(_)));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(transport.requests()[0].url, "http://other/m.json");
    }

    #[test]
    fn flash_write_error_fails_the_update() {
        let transport = SimTransport::default();
        transport.push(Reply::ok(r#"{"version":"2.0.0"}"#));
        transport.push(Reply::bytes(200, b"image".to_vec()));
        let slot = SimSlot::default();
        slot.fail_writes();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_secs(5));
        assert!(matches!(outcome, UpdateOutcome::Failed(_)));
        assert!(slot.image().is_none());
    }

    #[test]
    fn trickling_image_is_abandoned_at_the_deadline() {
        let transport = SimTransport::default();
        transport.push(Reply::ok(r#"{"version":"2.0.0"}"#));
        transport.push(Reply::bytes(200, vec![0xE9; 20 * 64]).trickled(Duration::from_millis(20)));
        let slot = SimSlot::default();

        let start = Instant::now();
        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(matches!(outcome, UpdateOutcome::Failed(reason) if reason.contains("timeout")));
        assert!(slot.image().is_none());
        assert_eq!(slot.aborts(), 1);
    }

    #[test]
    fn late_manifest_leaves_the_slot_alone() {
        let transport = SimTransport::default();
        transport.push(Reply::ok(r#"{"version":"2.0.0"}"#).delayed(Duration::from_millis(60)));
        transport.push(Reply::ok("image"));
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::from_millis(30));
        assert!(matches!(outcome, UpdateOutcome::Failed(_)));
        assert_eq!(slot.begins(), 0);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn zero_budget_touches_nothing() {
        let transport = SimTransport::default();
        let slot = SimSlot::default();

        let outcome = updater(&transport, &slot).check_and_apply(BASE, None, "1.0.0", Duration::ZERO);
        assert!(matches!(outcome, UpdateOutcome::Failed(_)));
        assert!(transport.requests().is_empty());
        assert_eq!(slot.begins(), 0);
    }

    fn reader(mut data: &[u8]) -> impl FnMut(&mut [u8]) -> Result<usize> + '_ {
        move |buf| {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            data = &data[len..];
            Ok(len)
        }
    }

    #[test]
    fn uploaded_image_is_streamed_and_verified() {
        let image = vec![0xA5; 3000];
        let digest = format!("{:X}", Sha256::digest(&image));
        let mut slot = SimSlot::default();

        assert_eq!(receive_image(&mut slot, Some(&digest), reader(&image)).unwrap(), 3000);
        assert_eq!(slot.image(), Some(image));
    }

    #[test]
    fn bad_uploads_are_discarded() {
        let mut slot = SimSlot::default();
        assert!(receive_image(&mut slot, None, reader(b"")).is_err());
        assert!(receive_image(&mut slot, Some(&"0".repeat(64)), reader(b"image")).is_err());
        assert!(receive_image(&mut slot, None, |_: &mut [u8]| Err(anyhow!("connection reset"))).is_err());
        assert!(slot.image().is_none());
        assert_eq!(slot.aborts(), 3);
    }

    #[test]
    fn confirm_marks_the_slot() {
        let transport = SimTransport::default();
        let slot = SimSlot::default();
        updater(&transport, &slot).confirm().unwrap();
        assert!(slot.marked_valid());
    }
}
