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

//! Physical link to the NFCC.

use crate::error::Result;
use crate::nci;
use std::path::PathBuf;

/// Power control operations supported by the link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// Drive VEN low.
    PowerOff,
    /// Drive VEN high, the controller boots in NCI mode.
    PowerOn,
    /// Power off then on again.
    PowerCycle,
    /// Assert the download request line before toggling VEN, the controller
    /// boots in firmware download mode.
    FirmwareDownload,
}

/// Settings used when opening the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Character device exposed by the kernel driver.
    pub device_node: PathBuf,
    /// Largest transfer size accepted by the bus in NCI mode.
    pub fragment_size: usize,
    /// Largest transfer size accepted by the bus in download mode.
    pub download_fragment_size: usize,
    /// Split writes larger than the fragment size.
    pub fragmentation: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            device_node: PathBuf::from("/dev/nxpnfc"),
            fragment_size: nci::MAX_FRAME_SIZE,
            download_fragment_size: nci::MAX_FRAME_SIZE,
            fragmentation: false,
        }
    }
}

/// Blocking byte link to the NFCC.
///
/// `read` and `write` block the calling thread; the HAL only calls them
/// from the reader thread and from blocking worker threads. A single read
/// may be in flight concurrently with a single write.
pub trait Transport: Send + Sync {
    /// Open the link. This is the only failure that prevents a session from
    /// starting.
    fn open(&self, config: &TransportConfig) -> Result<()>;

    /// Read a single frame into `buf`, returning its size.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Drive the power and download lines of the controller.
    fn reset(&self, mode: ResetMode) -> Result<()>;

    /// Unblock a pending `read`, which then returns an error.
    fn abort_read(&self) {}

    /// Close the link.
    fn close(&self) -> Result<()>;
}
