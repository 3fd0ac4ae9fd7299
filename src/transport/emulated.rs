//! In-memory device emulator
//!
//! Emulates the reader's flash in memory, optionally backed by an image file on disk. It behaves
//! like NOR flash: erasing sets bytes to `0xFF` and writing can only clear bits. Faults can be
//! injected to exercise the failure, timeout and cancellation paths of the workflows.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, trace, warn};

use super::{Ack, DeviceInfo, Region, Transport, TransportError, TransportOp};

/// Value of an erased flash byte
pub const ERASED: u8 = 0xff;

#[derive(Debug, Clone)]
pub struct EmulatedDeviceConfig {
    pub name: String,
    /// Flash size in bytes
    pub flash_size: usize,
    /// Smallest erasable unit in bytes
    pub sector_size: usize,
    /// The application partition OTA images are written to
    pub ota_region: Region,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            name: "Xteink X4 (emulated ESP32-C3)".to_string(),
            flash_size: 16 * 1024 * 1024,
            sector_size: 4096,
            ota_region: Region::new(0x1_0000, 0x64_0000),
        }
    }
}

/// What an injected fault does.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// The call returns an error
    Fail,
    /// The call never completes
    Hang,
    /// A write acknowledges fewer bytes than it was given
    ShortWrite,
}

#[derive(Debug, Copy, Clone)]
struct Fault {
    /// Number of successful calls before the fault triggers
    after: usize,
    kind: FaultKind,
}

/// An emulated reader.
#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatedDeviceConfig,
    data: Vec<u8>,
    present: bool,
    connected: bool,
    clean_abort: bool,
    active_region: Option<Region>,
    faults: HashMap<TransportOp, Fault>,
    calls: HashMap<TransportOp, usize>,
    history: Vec<TransportOp>,
}

impl EmulatedDevice {
    /// Creates a device with fully erased flash.
    pub fn new(config: EmulatedDeviceConfig) -> EmulatedDevice {
        let data = vec![ERASED; config.flash_size];

        EmulatedDevice {
            config,
            data,
            present: true,
            connected: false,
            clean_abort: false,
            active_region: None,
            faults: HashMap::new(),
            calls: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Creates a device whose flash starts with `initial`. Bytes past the end of the flash are
    /// dropped.
    pub fn with_data(config: EmulatedDeviceConfig, initial: &[u8]) -> EmulatedDevice {
        let mut device = EmulatedDevice::new(config);
        let len = initial.len().min(device.data.len());

        if len < initial.len() {
            warn!(
                "Dropping {} bytes that do not fit in the {} byte flash",
                initial.len() - len,
                device.data.len()
            );
        }

        device.data[..len].copy_from_slice(&initial[..len]);
        device
    }

    /// Creates a device that is not plugged in.
    pub fn absent(config: EmulatedDeviceConfig) -> EmulatedDevice {
        let mut device = EmulatedDevice::new(config);
        device.present = false;
        device
    }

    /// Loads the flash contents from the image file at `path`.
    ///
    /// A missing file means that no device is attached, and yields an absent device. An image
    /// larger than the configured flash is rejected.
    pub fn load<P: AsRef<Path>>(
        path: P,
        config: EmulatedDeviceConfig,
    ) -> Result<EmulatedDevice, TransportError> {
        let path = path.as_ref();

        if !path.exists() {
            debug!("No device image at {}", path.display());
            return Ok(EmulatedDevice::absent(config));
        }

        let initial = fs::read(path)?;

        if initial.len() > config.flash_size {
            return Err(TransportError::OutOfRange(
                Region::new(0, initial.len()),
                config.flash_size,
            ));
        }

        debug!("Loaded {} byte device image from {}", initial.len(), path.display());

        Ok(EmulatedDevice::with_data(config, &initial))
    }

    /// Writes the flash contents to the image file at `path`.
    ///
    /// An absent device has no flash, so nothing is written.
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<(), TransportError> {
        if !self.present {
            debug!("No device attached, not saving {}", path.as_ref().display());
            return Ok(());
        }

        fs::write(path, &self.data)?;

        Ok(())
    }

    /// Injects a fault into `op` that triggers after `after` successful calls.
    pub fn inject_fault(&mut self, op: TransportOp, after: usize, kind: FaultKind) {
        self.faults.insert(op, Fault { after, kind });
    }

    /// Controls whether `abort` confirms a clean abort.
    pub fn set_clean_abort(&mut self, clean_abort: bool) {
        self.clean_abort = clean_abort;
    }

    pub fn config(&self) -> &EmulatedDeviceConfig {
        &self.config
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The region last activated for boot.
    pub fn active_region(&self) -> Option<Region> {
        self.active_region
    }

    /// Whether a device is attached.
    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Every call made on the device, in order.
    pub fn history(&self) -> &[TransportOp] {
        &self.history
    }

    /// Records the call and applies any injected fault.
    async fn enter(&mut self, op: TransportOp) -> Result<Option<FaultKind>, TransportError> {
        self.history.push(op);

        // Give other tasks on the same thread a chance to run, like a real link would
        tokio::task::yield_now().await;

        let count = self.calls.entry(op).or_insert(0);
        let fault = match self.faults.get(&op) {
            Some(fault) if *count >= fault.after => Some(fault.kind),
            _ => None,
        };
        *count += 1;

        match fault {
            Some(FaultKind::Fail) => Err(TransportError::Failed(op, "injected fault".to_string())),
            Some(FaultKind::Hang) => std::future::pending().await,
            other => Ok(other),
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::NoDevice);
        }

        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        Ok(())
    }

    fn check_range(&self, region: Region) -> Result<(), TransportError> {
        if region.end() > self.data.len() {
            return Err(TransportError::OutOfRange(region, self.data.len()));
        }

        Ok(())
    }
}

impl Transport for EmulatedDevice {
    async fn connect(&mut self) -> Result<DeviceInfo, TransportError> {
        self.enter(TransportOp::Connect).await?;

        if !self.present {
            return Err(TransportError::NoDevice);
        }

        self.connected = true;

        Ok(DeviceInfo {
            name: self.config.name.clone(),
            flash_size: self.data.len(),
            ota_region: self.config.ota_region,
        })
    }

    async fn read(&mut self, offset: u32, length: usize) -> Result<Vec<u8>, TransportError> {
        self.enter(TransportOp::Read).await?;
        self.ensure_connected()?;

        let region = Region::new(offset, length);
        self.check_range(region)?;

        trace!("Reading {}", region);

        Ok(self.data[offset as usize..region.end()].to_vec())
    }

    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<Ack, TransportError> {
        let fault = self.enter(TransportOp::Write).await?;
        self.ensure_connected()?;

        let region = Region::new(offset, data.len());
        self.check_range(region)?;

        let written = match fault {
            Some(FaultKind::ShortWrite) => data.len() / 2,
            _ => data.len(),
        };

        trace!("Writing {} ({} bytes accepted)", region, written);

        // Programming can only clear bits
        let target = &mut self.data[offset as usize..offset as usize + written];
        for (dst, src) in target.iter_mut().zip(data) {
            *dst &= *src;
        }

        Ok(Ack { written })
    }

    async fn erase(&mut self, region: Region) -> Result<(), TransportError> {
        self.enter(TransportOp::Erase).await?;
        self.ensure_connected()?;
        self.check_range(region)?;

        // Erase whole sectors covering the region
        let sector = self.config.sector_size.max(1);
        let start = (region.offset as usize / sector) * sector;
        let end = (region.end() + sector - 1) / sector * sector;
        let end = end.min(self.data.len());

        trace!("Erasing {:#010x}..{:#010x}", start, end);

        self.data[start..end].fill(ERASED);

        Ok(())
    }

    async fn activate(&mut self, region: Region) -> Result<(), TransportError> {
        self.enter(TransportOp::Activate).await?;
        self.ensure_connected()?;
        self.check_range(region)?;

        self.active_region = Some(region);

        Ok(())
    }

    async fn abort(&mut self) -> Result<bool, TransportError> {
        self.enter(TransportOp::Abort).await?;

        Ok(self.clean_abort)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.enter(TransportOp::Disconnect).await?;
        self.connected = false;

        Ok(())
    }
}
