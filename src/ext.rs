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

//! Extension commands.
//!
//! Vendor requests that read cached controller state or drive the
//! controller with HAL-originated commands. They are refused while a
//! bring-up sequence owns the controller.

use crate::error::{HalError, Result};
use crate::firmware::{FirmwareVersion, ImageKind};
use crate::lifecycle::{BringupSession, ChipFeatures, ChipInfo, Plan, Sequencer};
use crate::lock;
use crate::nci::{self, ConfigParam, ConfigParamId, NciVersion};
use bytes::Bytes;
use log::{info, warn};

/// Request accepted by [`crate::NciHal::ext_command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtRequest {
    /// Report what the HAL knows about the controller.
    GetConfigInfo,
    /// Whether the bundled firmware differs from the controller firmware.
    CheckFlashRequired,
    /// Download the bundled firmware now.
    TriggerFirmwareDownload,
    /// Send a raw NCI command and return its response.
    Transceive(Vec<u8>),
    /// Report the controller capabilities.
    GetFeatureList,
    /// Program the configured system clock.
    ConfigureClock,
    /// Re-apply the RF settings, re-flashing the controller if it rejects
    /// them.
    RepairRfSettings,
    /// Read or write an EEPROM item.
    Eeprom(EepromRequest),
}

/// Result of an extension command.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ExtResponse {
    ConfigInfo(ConfigInfo),
    FlashRequired(bool),
    Completed,
    Transceived(Bytes),
    FeatureList(ChipFeatures),
    Eeprom(Vec<u8>),
}

/// State reported by [`ExtRequest::GetConfigInfo`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigInfo {
    /// NCI layout negotiated during bring-up.
    pub nci_version: Option<NciVersion>,
    #[allow(missing_docs)]
    pub chip: Option<ChipInfo>,
    /// Version of the bundled firmware.
    pub bundled_firmware: Option<FirmwareVersion>,
    /// Number of parameters known to be stored in EEPROM.
    pub cached_params: usize,
}

/// EEPROM item addressed by an [`EepromRequest`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EepromItem {
    /// Flag recording that a firmware update completed.
    FlashUpdateDone,
    /// Enables the power tracker.
    PowerTrackerEnable,
    /// Any other parameter.
    Raw(ConfigParamId),
}

impl EepromItem {
    #[allow(missing_docs)]
    pub fn param_id(self) -> ConfigParamId {
        match self {
            EepromItem::FlashUpdateDone => ConfigParamId(0xa0ec),
            EepromItem::PowerTrackerEnable => ConfigParamId(0xa0f2),
            EepromItem::Raw(id) => id,
        }
    }
}

#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EepromMode {
    Get,
    Set,
}

/// Read or write of one EEPROM item. `buffer` holds the value to write.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EepromRequest {
    pub item: EepromItem,
    pub mode: EepromMode,
    pub buffer: Vec<u8>,
}

impl Sequencer {
    /// Execute `request`. `bringup` holds the state left by the last
    /// bring-up of the session.
    pub async fn ext_command(
        &self,
        bringup: &mut BringupSession,
        request: ExtRequest,
    ) -> Result<ExtResponse> {
        info!("extension command {:?}", request);
        match request {
            ExtRequest::GetConfigInfo => Ok(ExtResponse::ConfigInfo(ConfigInfo {
                nci_version: bringup.reset.as_ref().map(|_| bringup.nci_version),
                chip: self.session.chip(),
                bundled_firmware: self.firmware.as_ref().map(|firmware| firmware.version()),
                cached_params: lock(&self.cache).len(),
            })),
            ExtRequest::CheckFlashRequired => {
                let image = self.firmware.as_ref().map(|firmware| firmware.version());
                let chip = self.session.chip().map(|chip| chip.firmware);
                Ok(ExtResponse::FlashRequired(match (chip, image) {
                    (Some(chip), Some(image)) => chip != image,
                    _ => false,
                }))
            }
            ExtRequest::TriggerFirmwareDownload => {
                self.download_firmware(ImageKind::Real, self.download_fragment_size()).await?;
                self.reset_and_init(bringup).await?;
                Ok(ExtResponse::Completed)
            }
            ExtRequest::Transceive(cmd) => {
                let exchange = self.session.transceive(Bytes::from(cmd)).await?;
                Ok(ExtResponse::Transceived(Bytes::copy_from_slice(
                    exchange.response.as_bytes(),
                )))
            }
            ExtRequest::GetFeatureList => match self.session.chip() {
                Some(chip) => Ok(ExtResponse::FeatureList(chip.features())),
                None => Err(HalError::NotOpen),
            },
            ExtRequest::ConfigureClock => {
                let clock = self.session.config.clock.unwrap_or_default();
                self.send_config(nci::core_set_config_cmd(&clock.params())).await?;
                Ok(ExtResponse::Completed)
            }
            ExtRequest::RepairRfSettings => {
                bringup.restart(Plan::RfRepair);
                bringup.ignore_cache = true;
                self.run(bringup).await?;
                Ok(ExtResponse::Completed)
            }
            ExtRequest::Eeprom(request) => self.eeprom(request).await.map(ExtResponse::Eeprom),
        }
    }

    /// Read or write an EEPROM item through CORE_GET_CONFIG / CORE_SET_CONFIG.
    pub async fn eeprom(&self, request: EepromRequest) -> Result<Vec<u8>> {
        let id = request.item.param_id();
        match request.mode {
            EepromMode::Get => {
                let params = self.read_config(&[id]).await?;
                let param = params.into_iter().find(|param| param.id == id).ok_or_else(|| {
                    warn!("{} missing from CORE_GET_CONFIG_RSP", id);
                    HalError::InvalidFrame("requested parameter not returned")
                })?;
                lock(&self.cache).update(std::slice::from_ref(&param));
                Ok(param.value)
            }
            EepromMode::Set => {
                if request.buffer.is_empty() {
                    return Err(HalError::Config(format!("empty value for {}", id)));
                }
                let param = ConfigParam { id, value: request.buffer };
                self.send_config(nci::core_set_config_cmd(std::slice::from_ref(&param)))
                    .await?;
                lock(&self.cache).update(std::slice::from_ref(&param));
                Ok(param.value)
            }
        }
    }
}
