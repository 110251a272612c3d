// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! I2C link through the NXP NFC kernel driver.
//!
//! The driver exposes the controller as a character device: one `read`
//! returns the bytes clocked out of the controller, one `write` issues one
//! I2C transfer. Power and download lines are driven through an ioctl.

use crate::error::{HalError, Result};
use crate::lock;
use crate::nci;
use crate::transport::{ResetMode, Transport, TransportConfig};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

nix::ioctl_write_int!(nfc_set_power, 0xe9, 0x01);

const POWER_OFF: u64 = 0;
const POWER_ON: u64 = 1;
const POWER_DOWNLOAD: u64 = 2;
const ABORT_READ: u64 = 3;

/// Settling time after toggling the power lines.
const POWER_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Download mode frames: 2-byte header carrying a 10-bit length, payload,
/// 2-byte CRC.
const DOWNLOAD_HEADER_SIZE: usize = 2;
const DOWNLOAD_CRC_SIZE: usize = 2;

/// Link to the controller over the kernel I2C driver.
#[derive(Default)]
pub struct I2cTransport {
    // The reader and writer use distinct descriptors so a blocking read
    // never holds up a write. Locks are only held to clone the handles, a
    // blocked read must not hold up `close`.
    reader: Mutex<Option<Arc<File>>>,
    writer: Mutex<Option<Arc<File>>>,
    config: Mutex<TransportConfig>,
    download_mode: AtomicBool,
}

impl I2cTransport {
    /// Create a closed link.
    pub fn new() -> Self {
        Default::default()
    }

    fn handle(slot: &Mutex<Option<Arc<File>>>) -> Result<Arc<File>> {
        lock(slot).clone().ok_or(HalError::NotOpen)
    }

    fn set_power(&self, level: u64) -> Result<()> {
        let file = Self::handle(&self.writer)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call; the request takes its argument by value.
        unsafe { nfc_set_power(file.as_raw_fd(), level as _) }
            .map_err(|errno| HalError::Io(errno.into()))?;
        Ok(())
    }
}

impl Transport for I2cTransport {
    fn open(&self, config: &TransportConfig) -> Result<()> {
        info!("opening {}", config.device_node.display());
        let writer = OpenOptions::new().read(true).write(true).open(&config.device_node)?;
        let reader = writer.try_clone()?;
        *lock(&self.writer) = Some(Arc::new(writer));
        *lock(&self.reader) = Some(Arc::new(reader));
        *lock(&self.config) = config.clone();
        self.download_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let file = Self::handle(&self.reader)?;
        let mut file = &*file;

        let (header_size, total) = if self.download_mode.load(Ordering::SeqCst) {
            let mut header = [0; DOWNLOAD_HEADER_SIZE];
            file.read_exact(&mut header)?;
            let length = (((header[0] & 0x03) as usize) << 8) | header[1] as usize;
            buf.get_mut(..DOWNLOAD_HEADER_SIZE)
                .ok_or(HalError::InvalidFrame("read buffer too small"))?
                .copy_from_slice(&header);
            (DOWNLOAD_HEADER_SIZE, DOWNLOAD_HEADER_SIZE + length + DOWNLOAD_CRC_SIZE)
        } else {
            let mut header = [0; nci::HEADER_SIZE];
            file.read_exact(&mut header)?;
            buf.get_mut(..nci::HEADER_SIZE)
                .ok_or(HalError::InvalidFrame("read buffer too small"))?
                .copy_from_slice(&header);
            let header = nci::PacketHeader::parse(&header)
                .map_err(|_| HalError::InvalidFrame("reserved message type"))?;
            (nci::HEADER_SIZE, nci::HEADER_SIZE + header.get_payload_length() as usize)
        };

        let payload = buf
            .get_mut(header_size..total)
            .ok_or(HalError::InvalidFrame("frame exceeds the read buffer"))?;
        file.read_exact(payload)?;
        Ok(total)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let fragment_size = {
            let config = lock(&self.config);
            if config.fragmentation && !self.download_mode.load(Ordering::SeqCst) {
                config.fragment_size.max(nci::HEADER_SIZE + 1)
            } else {
                usize::MAX
            }
        };

        let file = Self::handle(&self.writer)?;
        let mut file = &*file;
        for chunk in buf.chunks(fragment_size) {
            file.write_all(chunk)?;
        }
        Ok(buf.len())
    }

    fn reset(&self, mode: ResetMode) -> Result<()> {
        debug!("reset({:?})", mode);
        match mode {
            ResetMode::PowerOff => self.set_power(POWER_OFF)?,
            ResetMode::PowerOn => self.set_power(POWER_ON)?,
            ResetMode::PowerCycle => {
                self.set_power(POWER_OFF)?;
                std::thread::sleep(POWER_SETTLE_DELAY);
                self.set_power(POWER_ON)?;
            }
            ResetMode::FirmwareDownload => self.set_power(POWER_DOWNLOAD)?,
        }
        self.download_mode.store(mode == ResetMode::FirmwareDownload, Ordering::SeqCst);
        std::thread::sleep(POWER_SETTLE_DELAY);
        Ok(())
    }

    fn abort_read(&self) {
        if let Err(err) = self.set_power(ABORT_READ) {
            warn!("failed to abort the pending read: {}", err);
        }
    }

    fn close(&self) -> Result<()> {
        info!("closing I2C link");
        lock(&self.writer).take();
        lock(&self.reader).take();
        Ok(())
    }
}
