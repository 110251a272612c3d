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

//! Controller bring-up.
//!
//! Opening the HAL resets and initializes the controller and updates its
//! firmware when needed. Once the stack has initialized the controller,
//! post-init applies the configuration blocks, the RF blocks, re-initializes
//! the controller and caches the EEPROM resident settings.
//!
//! Every plan is a sequence of [`Step`]s. A failing step restarts the
//! sequence from CORE_RESET a bounded number of times, with a hardware reset
//! once the soft retries are exhausted.

use crate::config::{ConfigStore, HalConfig};
use crate::error::{HalError, Result};
use crate::firmware::{self, FirmwareImage, FirmwareVersion, ImageKind};
use crate::lock;
use crate::nci::{self, ConfigParam, ConfigParamId, Frame, MessageType, NciVersion, ResetInfo};
use crate::session::Session;
use crate::transport::ResetMode;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Restarts from CORE_RESET before the controller is hard reset.
pub const CORE_INIT_SOFT_RETRIES: u32 = 3;
/// Restarts from CORE_RESET before bring-up fails.
pub const CORE_INIT_MAX_RETRIES: u32 = 5;
/// Firmware re-flashes attempted to repair rejected RF settings.
pub const RF_RECOVERY_MAX: u32 = 3;
/// Number of `NXP_RF_CONF_BLK_<n>` blocks.
pub const RF_BLOCK_COUNT: usize = 20;

/// Configuration blocks applied after the clock and TVDD settings, in order.
const CONFIG_BLOCKS: [&str; 6] = [
    "NXP_ACT_PROP_EXTN",
    "NXP_CORE_STANDBY",
    "NXP_CORE_CONF_EXTN",
    "NXP_CORE_CONF",
    "NXP_CORE_MFCKEY_SETTING",
    "NXP_SET_CONFIG_ALWAYS",
];

/// Parameters read back per CORE_GET_CONFIG_CMD.
const GET_CONFIG_BATCH: usize = 16;

/// Controller family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChipType {
    Pn553,
    Pn557,
    Sn100,
    Sn220,
    Unknown(u8),
}

impl ChipType {
    /// Identify the family from the hardware version byte.
    pub fn from_hw_version(hw_version: u8) -> Self {
        match hw_version {
            0x41 | 0x51 => ChipType::Pn553,
            0x52 => ChipType::Pn557,
            0xa3 | 0xa4 => ChipType::Sn100,
            0x01 | 0x02 => ChipType::Sn220,
            other => ChipType::Unknown(other),
        }
    }

    /// Largest frame written in firmware download mode.
    pub fn download_fragment_size(self) -> usize {
        match self {
            ChipType::Sn100 | ChipType::Sn220 => 250,
            _ => nci::MAX_FRAME_SIZE,
        }
    }
}

/// Capabilities of the controller, reported through the extension path.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChipFeatures {
    pub chip_type: ChipType,
    pub nci_20: bool,
    pub download_fragment_size: usize,
}

/// Controller identity learnt during bring-up.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChipInfo {
    pub nci_version: NciVersion,
    pub hw_version: u8,
    pub firmware: FirmwareVersion,
    pub chip_type: ChipType,
}

impl ChipInfo {
    #[allow(missing_docs)]
    pub fn features(&self) -> ChipFeatures {
        ChipFeatures {
            chip_type: self.chip_type,
            nci_20: self.nci_version.is_v2(),
            download_fragment_size: self.chip_type.download_fragment_size(),
        }
    }
}

/// Identifies the controller from the information it reports at
/// initialization.
pub trait ChipDetector: Send + Sync {
    /// `manufacturer_info` is the `[hw, rom, major, minor, ...]` field of
    /// CORE_RESET_NTF or CORE_INIT_RSP.
    fn detect(&self, version: NciVersion, manufacturer_info: &[u8]) -> Option<ChipInfo>;
}

/// Detector for NXP controllers.
#[derive(Copy, Clone, Debug, Default)]
pub struct NxpChipDetector;

impl ChipDetector for NxpChipDetector {
    fn detect(&self, version: NciVersion, manufacturer_info: &[u8]) -> Option<ChipInfo> {
        let hw_version = *manufacturer_info.first()?;
        Some(ChipInfo {
            nci_version: version,
            hw_version,
            firmware: FirmwareVersion::from_manufacturer_info(manufacturer_info)?,
            chip_type: ChipType::from_hw_version(hw_version),
        })
    }
}

/// Sequence of steps run by the sequencer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Reset, initialize, update the firmware.
    Open,
    /// Apply the configuration once the stack initialized the controller.
    PostInit,
    /// Re-apply the RF settings.
    RfRepair,
}

/// A step of a bring-up plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Step {
    CoreReset,
    CoreInit,
    FirmwareCheck,
    ApplyConfig,
    ApplyRfBlocks,
    ReInit,
    CacheEeprom,
    Done,
}

impl Step {
    /// First step of `plan`.
    pub fn first(plan: Plan) -> Step {
        match plan {
            Plan::Open => Step::CoreReset,
            Plan::PostInit => Step::ApplyConfig,
            Plan::RfRepair => Step::ApplyRfBlocks,
        }
    }

    /// Step following a successful `self` in `plan`.
    pub fn next(self, plan: Plan) -> Step {
        match (self, plan) {
            (Step::CoreReset, _) => Step::CoreInit,
            (Step::CoreInit, Plan::Open) => Step::FirmwareCheck,
            (Step::CoreInit, Plan::PostInit) => Step::ApplyConfig,
            (Step::CoreInit, Plan::RfRepair) => Step::ApplyRfBlocks,
            (Step::FirmwareCheck, _) => Step::Done,
            (Step::ApplyConfig, _) => Step::ApplyRfBlocks,
            (Step::ApplyRfBlocks, _) => Step::ReInit,
            (Step::ReInit, Plan::RfRepair) => Step::Done,
            (Step::ReInit, _) => Step::CacheEeprom,
            (Step::CacheEeprom, _) | (Step::Done, _) => Step::Done,
        }
    }
}

/// State of the bring-up of one session.
#[derive(Clone, Debug)]
pub struct BringupSession {
    #[allow(missing_docs)]
    pub plan: Plan,
    /// Layout used for CORE_INIT_CMD.
    pub nci_version: NciVersion,
    /// Last reset information reported by the controller.
    pub reset: Option<ResetInfo>,
    #[allow(missing_docs)]
    pub chip: Option<ChipInfo>,
    /// Restarts from CORE_RESET in the current run.
    pub retry_core_init_cnt: u32,
    /// The CORE_INIT layout was switched after a syntax error.
    pub version_corrected: bool,
    /// A firmware download was attempted in the current run.
    pub fw_download_attempted: bool,
    /// Download the firmware whatever the versions.
    pub force_fw_download: bool,
    /// Firmware re-flashes done to repair RF settings in the current run.
    pub rf_recovery_cnt: u32,
    /// Configuration was written in the current run.
    pub config_applied: bool,
    /// Write the configuration even if the EEPROM cache holds it.
    pub ignore_cache: bool,
    applied: Vec<ConfigParamId>,
}

impl BringupSession {
    #[allow(missing_docs)]
    pub fn new(plan: Plan) -> Self {
        BringupSession {
            plan,
            nci_version: NciVersion::Version20,
            reset: None,
            chip: None,
            retry_core_init_cnt: 0,
            version_corrected: false,
            fw_download_attempted: false,
            force_fw_download: false,
            rf_recovery_cnt: 0,
            config_applied: false,
            ignore_cache: false,
            applied: vec![],
        }
    }

    /// Prepare a new run of `plan`, keeping what was learnt about the
    /// controller.
    pub fn restart(&mut self, plan: Plan) {
        self.plan = plan;
        self.retry_core_init_cnt = 0;
        self.fw_download_attempted = false;
        self.rf_recovery_cnt = 0;
        self.config_applied = false;
        self.ignore_cache = false;
        self.applied.clear();
    }
}

enum StepError {
    /// Restart from CORE_RESET.
    Retry(HalError),
    /// Give up.
    Fatal(HalError),
}

impl From<HalError> for StepError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::NotOpen | HalError::Shutdown => StepError::Fatal(err),
            err => StepError::Retry(err),
        }
    }
}

/// Values of configuration parameters known to be stored in the controller
/// EEPROM.
#[derive(Clone, Debug, Default)]
pub struct EepromCache {
    values: HashMap<ConfigParamId, Vec<u8>>,
}

impl EepromCache {
    /// Whether every parameter in `params` is stored with the same value.
    pub fn matches(&self, params: &[ConfigParam]) -> bool {
        !params.is_empty()
            && params.iter().all(|param| self.values.get(&param.id) == Some(&param.value))
    }

    #[allow(missing_docs)]
    pub fn update(&mut self, params: &[ConfigParam]) {
        for param in params {
            self.values.insert(param.id, param.value.clone());
        }
    }

    #[allow(missing_docs)]
    pub fn get(&self, id: ConfigParamId) -> Option<&[u8]> {
        self.values.get(&id).map(Vec::as_slice)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[allow(missing_docs)]
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Runs bring-up plans against a session.
pub(crate) struct Sequencer {
    pub session: Arc<Session>,
    pub store: Arc<dyn ConfigStore>,
    pub firmware: Option<Arc<dyn FirmwareImage>>,
    pub detector: Arc<dyn ChipDetector>,
    pub cache: Arc<Mutex<EepromCache>>,
}

impl Sequencer {
    fn config(&self) -> &HalConfig {
        &self.session.config
    }

    /// Run `bringup.plan` to completion. Frames received meanwhile are not
    /// delivered to the upper layer.
    pub async fn run(&self, bringup: &mut BringupSession) -> Result<()> {
        self.session.set_bringup_active(true);
        let result = self.run_steps(bringup).await;
        self.session.set_bringup_active(false);
        match &result {
            Ok(()) => info!("{:?} bring-up complete", bringup.plan),
            Err(err) => error!("{:?} bring-up failed: {}", bringup.plan, err),
        }
        result
    }

    async fn run_steps(&self, bringup: &mut BringupSession) -> Result<()> {
        let mut step = Step::first(bringup.plan);
        loop {
            debug!("bring-up step {:?}", step);
            match self.execute(step, bringup).await {
                Ok(Step::Done) => return Ok(()),
                Ok(next) => step = next,
                Err(StepError::Fatal(err)) => return Err(err),
                Err(StepError::Retry(err)) => {
                    bringup.retry_core_init_cnt += 1;
                    let retries = bringup.retry_core_init_cnt;
                    if retries > CORE_INIT_MAX_RETRIES {
                        error!("{:?} failed after {} retries: {}", step, retries - 1, err);
                        return Err(err);
                    }
                    warn!("{:?} failed: {}, restarting (retry {})", step, err, retries);
                    if retries > CORE_INIT_SOFT_RETRIES {
                        self.hard_reset().await?;
                    }
                    step = Step::CoreReset;
                }
            }
        }
    }

    async fn execute(
        &self,
        step: Step,
        bringup: &mut BringupSession,
    ) -> std::result::Result<Step, StepError> {
        let plan = bringup.plan;
        match step {
            Step::CoreReset => {
                self.core_reset(bringup).await?;
                Ok(step.next(plan))
            }
            Step::CoreInit => self.core_init(bringup).await,
            Step::FirmwareCheck => self.firmware_check(bringup).await,
            Step::ApplyConfig => {
                self.apply_config(bringup).await?;
                Ok(step.next(plan))
            }
            Step::ApplyRfBlocks => {
                self.apply_rf_blocks(bringup).await?;
                Ok(step.next(plan))
            }
            Step::ReInit => {
                if bringup.config_applied {
                    info!("configuration changed, re-initializing");
                    self.reset_and_init(bringup).await?;
                }
                Ok(step.next(plan))
            }
            Step::CacheEeprom => {
                self.cache_eeprom(bringup).await;
                Ok(step.next(plan))
            }
            Step::Done => Ok(Step::Done),
        }
    }

    async fn hard_reset(&self) -> Result<()> {
        warn!("hard resetting the controller");
        let link = self.session.transport.link().clone();
        tokio::task::spawn_blocking(move || link.reset(ResetMode::PowerCycle))
            .await
            .map_err(|_| HalError::Failed)?
    }

    async fn core_reset(&self, bringup: &mut BringupSession) -> Result<()> {
        let exchange =
            self.session.send_and_wait(nci::core_reset_cmd(nci::ResetType::KeepConfig)).await?;
        let info = nci::parse_reset(&exchange.response, exchange.notification.as_ref())?;
        info!("controller reset, NCI {:?}", info.version);
        if !bringup.version_corrected {
            bringup.nci_version = info.version;
        }
        bringup.reset = Some(info);
        Ok(())
    }

    async fn core_init(
        &self,
        bringup: &mut BringupSession,
    ) -> std::result::Result<Step, StepError> {
        match self.session.send_and_wait(nci::core_init_cmd(bringup.nci_version)).await {
            Ok(exchange) => {
                self.identify(bringup, &exchange.response);
                Ok(Step::CoreInit.next(bringup.plan))
            }
            Err(HalError::Status(nci::Status::SyntaxError | nci::Status::SemanticError))
                if !bringup.version_corrected =>
            {
                let version = bringup.nci_version.flipped();
                warn!("CORE_INIT rejected, retrying with the NCI {:?} layout", version);
                bringup.nci_version = version;
                bringup.version_corrected = true;
                Ok(Step::CoreReset)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn firmware_check(
        &self,
        bringup: &mut BringupSession,
    ) -> std::result::Result<Step, StepError> {
        let next = Step::FirmwareCheck.next(bringup.plan);
        let Some(image) = self.firmware.as_ref().map(|firmware| firmware.version()) else {
            return Ok(next);
        };
        let Some(chip) = bringup.chip.as_ref().map(|chip| chip.firmware) else {
            warn!("controller firmware unknown, skipping the update check");
            return Ok(next);
        };

        let required =
            bringup.force_fw_download || self.config().fw_update_always || chip != image;
        if !required {
            debug!("firmware {} is up to date", chip);
            return Ok(next);
        }
        if bringup.fw_download_attempted {
            return Ok(next);
        }

        info!("updating firmware {} to {}", chip, image);
        bringup.fw_download_attempted = true;
        match self.download_firmware(ImageKind::Real, self.download_fragment_size()).await
        {
            Ok(()) => {
                bringup.force_fw_download = false;
                Ok(Step::CoreReset)
            }
            Err(err) if firmware::is_compatible(chip, image) => {
                warn!("firmware download failed: {}, continuing with {}", err, chip);
                Ok(Step::CoreReset)
            }
            Err(err) => {
                error!("firmware download failed and {} cannot run {}", chip, image);
                Err(StepError::Fatal(err))
            }
        }
    }

    /// Largest frame written in download mode to the detected controller.
    pub fn download_fragment_size(&self) -> usize {
        let configured = self.config().transport.download_fragment_size;
        match self.session.chip() {
            Some(chip) => configured.min(chip.chip_type.download_fragment_size()),
            None => configured,
        }
    }

    /// Download an image with the reader thread stopped. The controller is
    /// power cycled back into NCI mode whatever the outcome.
    pub async fn download_firmware(&self, kind: ImageKind, fragment_size: usize) -> Result<()> {
        let firmware =
            self.firmware.clone().ok_or_else(|| HalError::Firmware("no firmware".into()))?;
        let _guard = self.session.submit.lock().await;

        let result = match self.session.pause_reads().await {
            Ok(()) => {
                let link = self.session.transport.link().clone();
                tokio::task::spawn_blocking(move || {
                    link.reset(ResetMode::FirmwareDownload)?;
                    let downloaded = firmware.download(&*link, kind, fragment_size);
                    let reset = link.reset(ResetMode::PowerCycle);
                    downloaded.and(reset)
                })
                .await
                .map_err(|_| HalError::Failed)
                .and_then(|result| result)
            }
            Err(err) => Err(err),
        };
        self.session.resume_reads();

        match &result {
            Ok(()) => info!("{:?} firmware downloaded", kind),
            Err(err) => warn!("{:?} firmware download failed: {}", kind, err),
        }
        result
    }

    async fn apply_config(&self, bringup: &mut BringupSession) -> Result<()> {
        if let Some(clock) = self.config().clock {
            self.apply_command(bringup, "clock", nci::core_set_config_cmd(&clock.params()))
                .await?;
        }
        if let Some(tvdd) = self.config().tvdd {
            self.apply_block(bringup, &format!("NXP_EXT_TVDD_CFG_{}", tvdd)).await?;
        }
        for name in CONFIG_BLOCKS {
            self.apply_block(bringup, name).await?;
        }
        Ok(())
    }

    async fn apply_rf_blocks(
        &self,
        bringup: &mut BringupSession,
    ) -> std::result::Result<(), StepError> {
        for index in 1..=RF_BLOCK_COUNT {
            let name = format!("NXP_RF_CONF_BLK_{}", index);
            loop {
                match self.apply_block(bringup, &name).await {
                    Ok(()) => break,
                    Err(HalError::Status(nci::Status::InvalidParam)) => {
                        warn!("{} rejected", name);
                        self.rf_config_recovery(bringup).await?;
                        // The cache no longer reflects the re-flashed EEPROM.
                        bringup.ignore_cache = true;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Re-flash the controller, dummy image first, after it rejected RF
    /// settings.
    async fn rf_config_recovery(
        &self,
        bringup: &mut BringupSession,
    ) -> std::result::Result<(), StepError> {
        if bringup.rf_recovery_cnt >= RF_RECOVERY_MAX {
            error!("RF settings still rejected after {} recoveries", bringup.rf_recovery_cnt);
            return Err(StepError::Fatal(HalError::Status(nci::Status::InvalidParam)));
        }
        let Some(firmware) = self.firmware.clone() else {
            error!("RF settings rejected and no firmware to recover with");
            return Err(StepError::Fatal(HalError::Status(nci::Status::InvalidParam)));
        };

        bringup.rf_recovery_cnt += 1;
        bringup.force_fw_download = true;
        info!("RF recovery {} of {}", bringup.rf_recovery_cnt, RF_RECOVERY_MAX);

        let fragment_size = self.download_fragment_size();
        if firmware.has_dummy() {
            self.download_firmware(ImageKind::Dummy, fragment_size)
                .await
                .map_err(StepError::Fatal)?;
        }
        self.download_firmware(ImageKind::Real, fragment_size).await.map_err(StepError::Fatal)?;
        bringup.force_fw_download = false;

        self.reset_and_init(bringup).await?;
        Ok(())
    }

    async fn apply_block(&self, bringup: &mut BringupSession, name: &str) -> Result<()> {
        match self.store.bytes(name) {
            Some(bytes) => self.apply_command(bringup, name, Bytes::from(bytes)).await,
            None => Ok(()),
        }
    }

    /// Send a configuration command unless the EEPROM already holds the
    /// parameters it sets.
    async fn apply_command(
        &self,
        bringup: &mut BringupSession,
        name: &str,
        bytes: Bytes,
    ) -> Result<()> {
        let frame = match Frame::parse(bytes) {
            Ok(frame) if frame.message_type() == MessageType::Command => frame,
            _ => {
                warn!("{} is not a valid NCI command, skipped", name);
                return Ok(());
            }
        };

        let params = nci::set_config_params(&frame);
        if let Some(params) = &params {
            if !bringup.ignore_cache && lock(&self.cache).matches(params) {
                debug!("{} already stored in EEPROM", name);
                return Ok(());
            }
        }

        debug!("applying {}", name);
        self.send_config(Bytes::copy_from_slice(frame.as_bytes())).await?;
        bringup.config_applied = true;
        if let Some(params) = params {
            bringup.applied.extend(params.iter().map(|param| param.id));
        }
        Ok(())
    }

    /// Send a configuration command, failing if any configuration frame is
    /// rejected meanwhile.
    pub async fn send_config(&self, cmd: Bytes) -> Result<()> {
        {
            let mut state = lock(&self.session.control);
            state.config_access = true;
            state.config_success = true;
        }
        let result = self.session.send_and_wait(cmd).await;
        let success = {
            let mut state = lock(&self.session.control);
            state.config_access = false;
            state.config_success
        };
        result?;
        if !success {
            return Err(HalError::Failed);
        }
        Ok(())
    }

    /// Identify the controller from the manufacturer information of its
    /// last reset, or of `init_response` for NCI 1.x controllers.
    fn identify(&self, bringup: &mut BringupSession, init_response: &Frame) {
        let manufacturer_info = match bringup.reset.as_ref() {
            Some(reset) if !reset.manufacturer_info.is_empty() => {
                Some(reset.manufacturer_info.clone())
            }
            _ => nci::core_init_manufacturer_info(init_response),
        };
        match manufacturer_info.and_then(|info| self.detector.detect(bringup.nci_version, &info)) {
            Some(chip) => {
                info!("{:?} running firmware {}", chip.chip_type, chip.firmware);
                self.session.set_chip(chip.clone());
                bringup.chip = Some(chip);
            }
            None => warn!("controller could not be identified"),
        }
    }

    /// CORE_RESET then CORE_INIT, keeping the negotiated layout. The
    /// controller is identified again since its firmware may have changed.
    pub async fn reset_and_init(&self, bringup: &mut BringupSession) -> Result<()> {
        self.core_reset(bringup).await?;
        let exchange =
            self.session.send_and_wait(nci::core_init_cmd(bringup.nci_version)).await?;
        self.identify(bringup, &exchange.response);
        Ok(())
    }

    /// Read back the parameters written in this run and cache them.
    async fn cache_eeprom(&self, bringup: &mut BringupSession) {
        let mut ids = std::mem::take(&mut bringup.applied);
        ids.sort();
        ids.dedup();

        for batch in ids.chunks(GET_CONFIG_BATCH) {
            match self.read_config(batch).await {
                Ok(params) => lock(&self.cache).update(&params),
                Err(err) => {
                    warn!("failed to read back the configuration: {}", err);
                    return;
                }
            }
        }
        debug!("{} parameters cached", lock(&self.cache).len());
    }

    /// Read parameters with CORE_GET_CONFIG_CMD.
    pub async fn read_config(&self, ids: &[ConfigParamId]) -> Result<Vec<ConfigParam>> {
        let exchange = self.session.send_and_wait(nci::core_get_config_cmd(ids)).await?;
        nci::get_config_params(&exchange.response)
    }
}
