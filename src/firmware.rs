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

//! Controller firmware images and the download protocol.
//!
//! In download mode the controller exchanges frames made of a two byte
//! header carrying a 10-bit payload length, the payload and a CRC-16/CCITT
//! of header and payload. Every chunk of the image is acknowledged with a
//! one byte status frame.

use crate::error::{HalError, Result};
use crate::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use std::path::Path;

const MAGIC: [u8; 2] = *b"NF";
const BLOB_HEADER_SIZE: usize = 6;
const DOWNLOAD_HEADER_SIZE: usize = 2;
const DOWNLOAD_CRC_SIZE: usize = 2;
/// Largest payload the 10-bit length field can describe.
const DOWNLOAD_MAX_PAYLOAD: usize = 0x3ff;

/// Download status reported for an accepted chunk.
pub const DOWNLOAD_STATUS_OK: u8 = 0x00;
/// Download status reported for a chunk with a bad CRC.
pub const DOWNLOAD_STATUS_CRC_ERROR: u8 = 0x02;
/// Download status reported when writing to flash failed.
pub const DOWNLOAD_STATUS_WRITE_FAILED: u8 = 0x0e;

/// Version of a firmware, as reported in the manufacturer specific
/// information of CORE_RESET / CORE_INIT.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// ROM code version. Only firmware built for the same ROM runs on a chip.
    pub rom: u8,
    #[allow(missing_docs)]
    pub major: u8,
    #[allow(missing_docs)]
    pub minor: u8,
}

impl FirmwareVersion {
    /// Decode the `[hw, rom, major, minor]` manufacturer information.
    pub fn from_manufacturer_info(info: &[u8]) -> Option<Self> {
        match info {
            [_hw, rom, major, minor, ..] => {
                Some(FirmwareVersion { rom: *rom, major: *major, minor: *minor })
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}.{:02x}.{:02x}", self.rom, self.major, self.minor)
    }
}

/// Which image of a firmware package to download.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// The firmware the HAL runs with.
    Real,
    /// A minimal image flashed first to recover a chip whose RF settings are
    /// corrupted.
    Dummy,
}

/// Firmware bundled with the HAL.
pub trait FirmwareImage: Send + Sync {
    /// Version of the real image.
    fn version(&self) -> FirmwareVersion;

    /// Whether a dummy image is available.
    fn has_dummy(&self) -> bool;

    /// Download an image over `link`, which the caller has put in download
    /// mode. Writes are at most `fragment_size` bytes.
    fn download(&self, link: &dyn Transport, kind: ImageKind, fragment_size: usize) -> Result<()>;
}

/// Whether `image` can run on a chip currently running `chip`.
pub fn is_compatible(chip: FirmwareVersion, image: FirmwareVersion) -> bool {
    chip.rom == image.rom
}

/// Firmware package.
///
/// A package is a header `"NF", kind, rom, major, minor` followed by the
/// image body, kind 0 for the real image and 1 for a dummy image. Packages
/// are downloaded whole, the controller boot loader checks the header.
#[derive(Clone, Debug)]
pub struct FirmwareBlob {
    version: FirmwareVersion,
    real: Bytes,
    dummy: Option<Bytes>,
}

impl FirmwareBlob {
    /// Package `body` as the real image of `version`.
    pub fn new(version: FirmwareVersion, body: &[u8]) -> Self {
        FirmwareBlob { version, real: package(0, version, body), dummy: None }
    }

    /// Attach a dummy image.
    pub fn with_dummy(mut self, body: &[u8]) -> Self {
        self.dummy = Some(package(1, self.version, body));
        self
    }

    /// Parse a real image package.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match parse_header(bytes)? {
            (0, version, _) => {
                Ok(FirmwareBlob { version, real: Bytes::copy_from_slice(bytes), dummy: None })
            }
            _ => Err(HalError::Firmware("package does not hold a real image".into())),
        }
    }

    /// Load the real image package from `path` and, when given, the dummy
    /// image package from `dummy`.
    pub fn load(path: &Path, dummy: Option<&Path>) -> Result<Self> {
        let mut blob = FirmwareBlob::parse(&std::fs::read(path)?)?;
        info!("loaded firmware {} from {}", blob.version, path.display());
        if let Some(dummy) = dummy {
            let bytes = std::fs::read(dummy)?;
            match parse_header(&bytes)? {
                (1, _, _) => blob.dummy = Some(Bytes::from(bytes)),
                _ => {
                    return Err(HalError::Firmware(format!(
                        "{} is not a dummy image",
                        dummy.display()
                    )))
                }
            }
        }
        Ok(blob)
    }

    /// The real image package.
    pub fn to_bytes(&self) -> Bytes {
        self.real.clone()
    }

    fn package(&self, kind: ImageKind) -> Result<&Bytes> {
        match kind {
            ImageKind::Real => Ok(&self.real),
            ImageKind::Dummy => {
                self.dummy.as_ref().ok_or_else(|| HalError::Firmware("no dummy image".into()))
            }
        }
    }
}

fn package(kind: u8, version: FirmwareVersion, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BLOB_HEADER_SIZE + body.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(kind);
    buf.put_slice(&[version.rom, version.major, version.minor]);
    buf.put_slice(body);
    buf.freeze()
}

impl FirmwareImage for FirmwareBlob {
    fn version(&self) -> FirmwareVersion {
        self.version
    }

    fn has_dummy(&self) -> bool {
        self.dummy.is_some()
    }

    fn download(&self, link: &dyn Transport, kind: ImageKind, fragment_size: usize) -> Result<()> {
        let image = self.package(kind)?;
        let chunk_size = fragment_size
            .saturating_sub(DOWNLOAD_HEADER_SIZE + DOWNLOAD_CRC_SIZE)
            .clamp(1, DOWNLOAD_MAX_PAYLOAD);
        info!("downloading {:?} image, {} bytes in chunks of {}", kind, image.len(), chunk_size);

        let mut response = [0u8; 8];
        for (index, chunk) in image.chunks(chunk_size).enumerate() {
            link.write(&download_frame(chunk))?;
            let size = link.read(&mut response)?;
            let status = parse_download_frame(&response[..size])
                .and_then(|payload| payload.first().copied())
                .ok_or_else(|| {
                    HalError::Firmware(format!("malformed response to chunk {}", index))
                })?;
            if status != DOWNLOAD_STATUS_OK {
                return Err(HalError::Firmware(format!(
                    "chunk {} rejected with status {:#04x}",
                    index, status
                )));
            }
            debug!("chunk {} accepted", index);
        }
        Ok(())
    }
}

/// Split a package header, returning the image kind, version and body.
pub(crate) fn parse_header(bytes: &[u8]) -> Result<(u8, FirmwareVersion, &[u8])> {
    match bytes {
        [b'N', b'F', kind, rom, major, minor, body @ ..] => {
            Ok((*kind, FirmwareVersion { rom: *rom, major: *major, minor: *minor }, body))
        }
        _ => Err(HalError::Firmware("invalid package header".into())),
    }
}

/// CRC-16/CCITT-FALSE.
pub(crate) fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for byte in bytes {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Frame `payload` for download mode.
pub(crate) fn download_frame(payload: &[u8]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(DOWNLOAD_HEADER_SIZE + payload.len() + DOWNLOAD_CRC_SIZE);
    buf.put_u8(((payload.len() >> 8) & 0x03) as u8);
    buf.put_u8(payload.len() as u8);
    buf.put_slice(payload);
    let crc = crc16(&buf);
    buf.put_u16(crc);
    buf.freeze()
}

/// Validate a download mode frame and return its payload.
pub(crate) fn parse_download_frame(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < DOWNLOAD_HEADER_SIZE + DOWNLOAD_CRC_SIZE {
        return None;
    }
    let length = (((frame[0] & 0x03) as usize) << 8) | frame[1] as usize;
    if frame.len() != DOWNLOAD_HEADER_SIZE + length + DOWNLOAD_CRC_SIZE {
        return None;
    }
    let (body, crc) = frame.split_at(DOWNLOAD_HEADER_SIZE + length);
    if crc16(body).to_be_bytes() != crc {
        return None;
    }
    Some(&body[DOWNLOAD_HEADER_SIZE..])
}

/// Response acknowledging a chunk with `status`.
pub(crate) fn download_response(status: u8) -> Bytes {
    download_frame(&[status])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn download_framing() {
        let frame = download_frame(&[0xaa; 300]);
        assert_eq!(&frame[..2], &[0x01, 0x2c]);
        assert_eq!(parse_download_frame(&frame), Some(&[0xaa; 300][..]));

        let mut corrupted = frame.to_vec();
        corrupted[10] ^= 0x01;
        assert_eq!(parse_download_frame(&corrupted), None);
        assert_eq!(parse_download_frame(&frame[..frame.len() - 1]), None);
    }

    #[test]
    fn package_header() {
        let version = FirmwareVersion { rom: 0x01, major: 0x10, minor: 0x22 };
        let blob = FirmwareBlob::new(version, &[1, 2, 3]);
        let parsed = FirmwareBlob::parse(&blob.to_bytes()).unwrap();
        assert_eq!(parsed.version(), version);
        assert!(!parsed.has_dummy());
        assert!(FirmwareBlob::parse(b"XX\x00\x01\x02\x03").is_err());
        assert_eq!(version.to_string(), "01.10.22");
    }

    #[test]
    fn compatibility_follows_rom_version() {
        let chip = FirmwareVersion { rom: 0x01, major: 0x10, minor: 0x00 };
        assert!(is_compatible(chip, FirmwareVersion { rom: 0x01, major: 0x12, minor: 0x05 }));
        assert!(!is_compatible(chip, FirmwareVersion { rom: 0x02, major: 0x10, minor: 0x00 }));
    }
}
