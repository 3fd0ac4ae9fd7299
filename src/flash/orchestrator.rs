//! The workflow state machine
//!
//! An [`Orchestrator`] owns the device link and runs at most one workflow at a time. Every public
//! operation claims the orchestrator on entry and is rejected with [`Error::Busy`] while another
//! one is running. The live [`WorkflowRun`] is published through a watch channel, so observers see
//! each status and progress change as it happens.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use super::link::Link;
use super::step::StepId;
use super::workflow::{WorkflowKind, WorkflowRun};
use super::{ErasePolicy, FlashConfig};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::fetch::{FetchError, FirmwareFetcher, FirmwareKey};
use crate::firmware::image::ImageHeader;
use crate::firmware::{identify_firmware, FirmwareBinary, FirmwareInfo};
use crate::transport::{DeviceInfo, Region, Transport, TransportError};

/// The firmware installed by [`Orchestrator::flash_english_firmware`].
pub const ENGLISH_FIRMWARE: FirmwareKey = FirmwareKey::V3_1_0_En;

/// Releases the running flag when a workflow ends, however it ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drives the flashing workflows against a device link.
pub struct Orchestrator<T, F> {
    transport: Mutex<T>,
    fetcher: F,
    config: FlashConfig,
    running: AtomicBool,
    cancel: CancelToken,
    run: watch::Sender<WorkflowRun>,
}

impl<T: Transport, F: FirmwareFetcher> Orchestrator<T, F> {
    pub fn new(transport: T, fetcher: F, config: FlashConfig) -> Self {
        let (run, _) = watch::channel(WorkflowRun::default());

        Orchestrator {
            transport: Mutex::new(transport),
            fetcher,
            config,
            running: AtomicBool::new(false),
            cancel: CancelToken::new(),
            run,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Returns a receiver that observes every change of the current run.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowRun> {
        self.run.subscribe()
    }

    /// Returns a copy of the current run.
    pub fn snapshot(&self) -> WorkflowRun {
        self.run.borrow().clone()
    }

    /// Whether a workflow is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The token that cancels the running workflow.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Requests cancellation of the running workflow.
    pub fn cancel(&self) {
        if self.is_running() {
            info!("Cancellation requested");
            self.cancel.cancel();
        }
    }

    /// Consumes the orchestrator and returns the device link.
    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }

    /// Reads the whole device flash.
    ///
    /// The returned image is the artifact the caller persists.
    pub async fn save_full_flash(&self) -> Result<FirmwareBinary, Error> {
        let _guard = self.claim()?;
        self.begin(WorkflowKind::SaveFullFlash);

        let mut transport = self.transport.lock().await;
        let mut link = Link::new(&mut *transport, self.config.io_timeout, self.cancel.clone());

        let result = self
            .step(StepId::ReadFlash, self.read_flash(&mut link))
            .await;

        if let Ok(image) = &result {
            info!(
                "Saved {} bytes of flash (sha256 {})",
                image.len(),
                image.sha256()
            );
        }

        self.finish(&mut link, result).await
    }

    /// Writes a complete flash image obtained from `source`.
    ///
    /// `source` yielding nothing means that no file was selected, which fails the run before any
    /// step starts.
    pub async fn write_full_flash<S>(&self, source: S) -> Result<(), Error>
    where
        S: FnOnce() -> Option<FirmwareBinary>,
    {
        let _guard = self.claim()?;
        self.begin(WorkflowKind::WriteFullFlash);

        let image = match source() {
            Some(image) => image,
            None => {
                let err = Error::NoFileSelected;
                error!("{}", err);
                self.update(|run| run.fail(&err));

                return Err(err);
            }
        };

        info!(
            "Writing {} byte image (sha256 {})",
            image.len(),
            image.sha256()
        );

        match ImageHeader::parse(&image) {
            Ok(header) => info!("Image header: {}", header),
            Err(err) => warn!("Image does not start with an ESP image header: {}", err),
        }

        let mut transport = self.transport.lock().await;
        let mut link = Link::new(&mut *transport, self.config.io_timeout, self.cancel.clone());

        let result = self.run_write(&mut link, &image).await;

        self.finish(&mut link, result).await
    }

    /// Downloads the official English firmware and installs it over OTA.
    pub async fn flash_english_firmware(&self) -> Result<FirmwareInfo, Error> {
        self.flash_official_firmware(ENGLISH_FIRMWARE).await
    }

    /// Downloads the official firmware `key` and installs it over OTA.
    ///
    /// The download must classify as the family the key promises, otherwise the run fails with
    /// [`Error::FirmwareMismatch`] before anything is sent to the device.
    pub async fn flash_official_firmware(&self, key: FirmwareKey) -> Result<FirmwareInfo, Error> {
        let _guard = self.claim()?;
        self.begin(WorkflowKind::OtaFlash);

        let mut transport = self.transport.lock().await;
        let mut link = Link::new(&mut *transport, self.config.io_timeout, self.cancel.clone());

        let result = self.run_ota(&mut link, key).await;

        self.finish(&mut link, result).await
    }

    /// Atomically claims the orchestrator for a new run.
    fn claim(&self) -> Result<RunGuard<'_>, Error> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                debug!("Rejecting operation, a workflow is already running");
                Error::Busy
            })?;

        Ok(RunGuard {
            running: &self.running,
        })
    }

    fn begin(&self, kind: WorkflowKind) {
        info!("Starting workflow: {}", kind);

        self.cancel.reset();
        self.run.send_replace(WorkflowRun::new(kind));
    }

    fn update<M: FnOnce(&mut WorkflowRun)>(&self, modify: M) {
        self.run.send_modify(modify);
    }

    fn ensure_not_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::CancelledByUser);
        }

        Ok(())
    }

    fn progress(&self, id: StepId, done: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f32 / total as f32
        };

        self.update(|run| run.set_progress(id, fraction));
    }

    /// Runs `body` as step `id`, recording its outcome.
    ///
    /// A cancelled body leaves the step running; [`Orchestrator::finish`] resolves it.
    async fn step<R, Fut>(&self, id: StepId, body: Fut) -> Result<R, Error>
    where
        Fut: Future<Output = Result<R, Error>>,
    {
        self.ensure_not_cancelled()?;

        debug!("Step started: {}", id);
        self.update(|run| run.start_step(id));

        match body.await {
            Ok(value) => {
                debug!("Step succeeded: {}", id);
                self.update(|run| run.succeed_step(id));

                Ok(value)
            }
            Err(Error::CancelledByUser) => Err(Error::CancelledByUser),
            Err(err) => {
                error!("Step failed: {}: {}", id, err);
                self.update(|run| run.fail_step(id, &err));

                Err(err)
            }
        }
    }

    fn skip(&self, id: StepId) {
        debug!("Step skipped: {}", id);
        self.update(|run| run.skip_step(id));
    }

    /// Settles the run after its last step, or after the first failure.
    async fn finish<R>(&self, link: &mut Link<'_, T>, result: Result<R, Error>) -> Result<R, Error> {
        match &result {
            Ok(_) => {
                link.close().await;
                self.update(|run| run.complete());
                info!("Workflow completed");
            }
            Err(Error::CancelledByUser) => {
                let in_flight = self.run.borrow().running_step().is_some();
                let clean_abort = in_flight && link.is_connected() && link.abort().await;

                link.close().await;
                self.update(|run| run.cancel(clean_abort));
                warn!("Workflow cancelled (clean abort: {})", clean_abort);
            }
            Err(err) => {
                link.close().await;
                self.update(|run| run.fail(err));
                error!("Workflow failed: {}", err);
            }
        }

        result
    }

    async fn connect(&self, link: &mut Link<'_, T>) -> Result<DeviceInfo, Error> {
        let device = link.connect().await?;

        info!(
            "Connected to {} ({} bytes of flash)",
            device.name, device.flash_size
        );

        Ok(device)
    }

    async fn read_flash(&self, link: &mut Link<'_, T>) -> Result<FirmwareBinary, Error> {
        let device = self.connect(link).await?;
        let total = device.flash_size;
        let chunk_size = self.config.chunk_size.max(1);
        let mut image = Vec::with_capacity(total);

        while image.len() < total {
            self.ensure_not_cancelled()?;

            let length = chunk_size.min(total - image.len());
            let chunk = link.read(image.len() as u32, length).await?;
            image.extend_from_slice(&chunk);

            self.progress(StepId::ReadFlash, image.len(), total);
        }

        Ok(FirmwareBinary::new(image))
    }

    async fn run_write(&self, link: &mut Link<'_, T>, image: &FirmwareBinary) -> Result<(), Error> {
        let device = self
            .step(StepId::Connect, async {
                let device = self.connect(link).await?;

                if image.len() > device.flash_size {
                    return Err(Error::ImageTooLarge {
                        size: image.len(),
                        capacity: device.flash_size,
                    });
                }

                Ok(device)
            })
            .await?;

        let target = Region::new(0, image.len());

        match self.config.erase_policy {
            ErasePolicy::EraseBeforeWrite => {
                self.step(StepId::Erase, link.erase(target)).await?;
            }
            ErasePolicy::Skip => {
                self.ensure_not_cancelled()?;
                self.skip(StepId::Erase);
            }
        }

        self.step(StepId::Write, self.write_chunks(link, StepId::Write, target, image))
            .await?;

        if self.config.verify_after_write {
            self.step(StepId::Verify, self.verify(link, target, image))
                .await?;
        } else {
            self.ensure_not_cancelled()?;
            self.skip(StepId::Verify);
        }

        info!("Wrote {} bytes to {}", image.len(), device.name);

        Ok(())
    }

    async fn run_ota(&self, link: &mut Link<'_, T>, key: FirmwareKey) -> Result<FirmwareInfo, Error> {
        let firmware = self
            .step(StepId::Fetch, async {
                let limit = self.config.fetch_timeout;

                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => Err(Error::CancelledByUser),
                    fetched = tokio::time::timeout(limit, self.fetcher.fetch(key)) => match fetched {
                        Ok(result) => Ok(result?),
                        Err(_) => Err(Error::from(FetchError::Timeout(limit))),
                    },
                }
            })
            .await?;

        let info = self
            .step(StepId::Classify, async {
                let info = identify_firmware(&firmware);
                let expected = key.expected_family();

                info!(
                    "Firmware {} identified as {} {}",
                    key, info.display_name, info.version
                );

                if info.family != expected {
                    return Err(Error::FirmwareMismatch {
                        expected,
                        found: info.family,
                    });
                }

                Ok(info)
            })
            .await?;

        let device = self
            .step(StepId::Handshake, async {
                let device = self.connect(link).await?;

                if firmware.len() > device.ota_region.length {
                    return Err(Error::ImageTooLarge {
                        size: firmware.len(),
                        capacity: device.ota_region.length,
                    });
                }

                Ok(device)
            })
            .await?;

        let target = Region::new(device.ota_region.offset, firmware.len());

        self.step(StepId::Transfer, async {
            link.erase(target).await?;
            self.write_chunks(link, StepId::Transfer, target, &firmware)
                .await
        })
        .await?;

        self.step(StepId::Apply, link.activate(target)).await?;

        info!("Installed {} into {}", key, target);

        Ok(info)
    }

    /// Writes `data` to `target` chunk by chunk, reporting progress on step `id`.
    async fn write_chunks(
        &self,
        link: &mut Link<'_, T>,
        id: StepId,
        target: Region,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut written = 0;

        for chunk in data.chunks(self.config.chunk_size.max(1)) {
            self.ensure_not_cancelled()?;

            link.write(target.offset + written as u32, chunk).await?;
            written += chunk.len();

            self.progress(id, written, data.len());
        }

        Ok(())
    }

    /// Reads `target` back and compares it with `data`.
    async fn verify(&self, link: &mut Link<'_, T>, target: Region, data: &[u8]) -> Result<(), Error> {
        let mut hasher = Sha256::new();
        let mut verified = 0;

        for expected in data.chunks(self.config.chunk_size.max(1)) {
            self.ensure_not_cancelled()?;

            let offset = target.offset + verified as u32;
            let actual = link.read(offset, expected.len()).await?;

            if let Some(index) = actual.iter().zip(expected).position(|(a, b)| a != b) {
                let offset = offset + index as u32;
                return Err(Error::from(TransportError::VerifyMismatch(offset)));
            }

            hasher.update(&actual);
            verified += actual.len();

            self.progress(StepId::Verify, verified, data.len());
        }

        info!(
            "Verified {} bytes (sha256 {:x})",
            verified,
            hasher.finalize()
        );

        Ok(())
    }
}
