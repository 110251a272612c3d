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

//! HAL entry points used by the NFC stack.

use crate::config::{ConfigStore, HalConfig, NfcConfig};
use crate::control::HalStatus;
use crate::error::{HalError, NfcStatus, Result};
use crate::ext::{EepromItem, EepromMode, EepromRequest, ExtRequest, ExtResponse};
use crate::firmware::FirmwareImage;
use crate::lifecycle::{BringupSession, ChipDetector, EepromCache, NxpChipDetector, Plan, Sequencer};
use crate::lock;
use crate::nci::{self, ResetType};
use crate::session::Session;
use crate::transport::{ResetMode, Transport};
use bytes::Bytes;
use log::{info, warn};
use std::sync::{Arc, Mutex};

/// Events reported to the NFC stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HalEvent {
    OpenCplt,
    CloseCplt,
    PostInitCplt,
    PreDiscoverCplt,
    /// The transport failed and the controller was power cycled.
    Error,
    /// Part of the stack event interface. The core never raises it, control
    /// of the controller is only taken internally during bring-up.
    RequestControl,
    /// See [`HalEvent::RequestControl`].
    ReleaseControl,
    EnableI2cFragmentation,
}

/// Receiver of the asynchronous HAL output. Both methods are called from the
/// control task of the session, one at a time.
pub trait HalCallback: Send + Sync {
    /// An event completed.
    fn on_event(&self, event: HalEvent, status: NfcStatus);
    /// A frame from the controller.
    fn on_data(&self, data: &[u8]);
}

/// How the controller is left when the HAL closes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseType {
    /// Power the controller off.
    Disable,
    /// Keep the controller powered for off-host card emulation.
    HostSwitchedOff,
}

/// NCI HAL for one controller.
pub struct NciHal {
    link: Arc<dyn Transport>,
    store: Arc<dyn ConfigStore>,
    firmware: Option<Arc<dyn FirmwareImage>>,
    detector: Arc<dyn ChipDetector>,
    config: HalConfig,
    cache: Arc<Mutex<EepromCache>>,
    session: Mutex<Option<Arc<Session>>>,
    /// Serializes open, post-init, close and extension commands.
    lifecycle: tokio::sync::Mutex<()>,
}

impl NciHal {
    /// HAL driving the controller behind `link`, configured from `store`.
    pub fn new(link: Arc<dyn Transport>, store: Arc<dyn ConfigStore>) -> Self {
        let config = HalConfig::from_store(&*store);
        NciHal {
            link,
            store,
            firmware: None,
            detector: Arc::new(NxpChipDetector),
            config,
            cache: Default::default(),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Firmware to keep the controller updated with.
    pub fn with_firmware(mut self, firmware: Arc<dyn FirmwareImage>) -> Self {
        self.firmware = Some(firmware);
        self
    }

    /// Replace the controller identification.
    pub fn with_detector(mut self, detector: Arc<dyn ChipDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Replace the settings read from the configuration store.
    pub fn with_config(mut self, config: HalConfig) -> Self {
        self.config = config;
        self
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    #[allow(missing_docs)]
    pub fn status(&self) -> HalStatus {
        match lock(&self.session).as_ref() {
            Some(session) => session.status(),
            None => HalStatus::Closed,
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        lock(&self.session).clone().ok_or(HalError::NotOpen)
    }

    fn sequencer(&self, session: &Arc<Session>) -> Sequencer {
        Sequencer {
            session: session.clone(),
            store: self.store.clone(),
            firmware: self.firmware.clone(),
            detector: self.detector.clone(),
            cache: self.cache.clone(),
        }
    }

    /// Open the transport and bring the controller up. OPEN_CPLT reports the
    /// outcome of the bring-up; an error is also returned when the transport
    /// cannot be opened, in which case no event is sent.
    pub async fn open(&self, callback: Arc<dyn HalCallback>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        info!("open");

        let previous = lock(&self.session).take();
        if let Some(previous) = previous {
            warn!("HAL already open, closing the previous session");
            if let Err(err) = previous.teardown().await {
                warn!("failed to close the previous session: {}", err);
            }
        }

        let session = Session::start(self.link.clone(), &self.config, callback).await?;
        let mut bringup = BringupSession::new(Plan::Open);
        match self.sequencer(&session).run(&mut bringup).await {
            Ok(()) => {
                session.store_bringup(bringup);
                *lock(&self.session) = Some(session.clone());
                session.post_event(HalEvent::OpenCplt, NfcStatus::Ok);
                Ok(())
            }
            Err(err) => {
                session.post_event(HalEvent::OpenCplt, NfcStatus::from(&err));
                if let Err(err) = session.teardown().await {
                    warn!("failed to close the transport: {}", err);
                }
                Err(err)
            }
        }
    }

    /// Write an NCI frame from the stack, returning the number of bytes
    /// written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.len() < nci::HEADER_SIZE || data.len() > nci::MAX_FRAME_SIZE {
            return Err(HalError::InvalidFrame("invalid frame length"));
        }
        let session = self.session()?;
        if session.bringup_active() {
            return Err(HalError::BringupInProgress);
        }
        session.write_from_stack(Bytes::copy_from_slice(data)).await
    }

    /// Apply the configuration once the stack initialized the controller.
    /// POST_INIT_CPLT reports the outcome.
    pub async fn core_initialized(&self, _data: &[u8]) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let session = self.session()?;
        info!("core initialized");

        let mut bringup =
            session.take_bringup().unwrap_or_else(|| BringupSession::new(Plan::PostInit));
        bringup.restart(Plan::PostInit);
        let result = self.sequencer(&session).run(&mut bringup).await;
        session.store_bringup(bringup);

        session.post_event(HalEvent::PostInitCplt, NfcStatus::from(&result));
        if result.is_ok() && self.config.transport.fragmentation {
            session.post_event(HalEvent::EnableI2cFragmentation, NfcStatus::Ok);
        }
        result
    }

    /// Acknowledged with PRE_DISCOVER_CPLT.
    pub async fn pre_discover(&self) -> Result<()> {
        let session = self.session()?;
        session.post_event(HalEvent::PreDiscoverCplt, NfcStatus::Ok);
        Ok(())
    }

    /// Reset the controller and close the transport. Fails without touching
    /// the transport when the HAL is not open.
    pub async fn close(&self, close_type: CloseType) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(session) = lock(&self.session).take() else {
            warn!("close while not open");
            return Err(HalError::Failed);
        };
        info!("close({:?})", close_type);

        if let Err(err) = session.send_and_wait(nci::core_reset_cmd(ResetType::KeepConfig)).await {
            warn!("CORE_RESET before close failed: {}", err);
        }
        if close_type == CloseType::Disable {
            let link = self.link.clone();
            match tokio::task::spawn_blocking(move || link.reset(ResetMode::PowerOff)).await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => warn!("failed to power the controller off: {}", err),
                Err(_) => warn!("power off did not complete"),
            }
        }

        session.post_event(HalEvent::CloseCplt, NfcStatus::Ok);
        session.teardown().await
    }

    /// Power cycle the controller. OPEN_CPLT reports the outcome.
    pub async fn power_cycle(&self) -> Result<()> {
        let session = self.session()?;
        info!("power cycle");
        let link = self.link.clone();
        let result = tokio::task::spawn_blocking(move || link.reset(ResetMode::PowerCycle))
            .await
            .map_err(|_| HalError::Failed)
            .and_then(|result| result);
        session.post_event(HalEvent::OpenCplt, NfcStatus::from(&result));
        result
    }

    /// Restore the controller default configuration and forget the cached
    /// EEPROM content.
    pub async fn factory_reset(&self) -> Result<()> {
        info!("factory reset");
        lock(&self.cache).clear();
        match self.session() {
            Ok(session) => {
                session.send_and_wait(nci::core_reset_cmd(ResetType::ResetConfig)).await?;
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Settings for the NFC stack.
    pub fn get_config(&self) -> NfcConfig {
        NfcConfig::from_store(&*self.store)
    }

    /// Run an extension command. Refused while a bring-up owns the
    /// controller.
    pub async fn ext_command(&self, request: ExtRequest) -> Result<ExtResponse> {
        let session = self.session()?;
        if session.bringup_active() {
            return Err(HalError::BringupInProgress);
        }
        let _guard = self.lifecycle.lock().await;

        let mut bringup =
            session.take_bringup().unwrap_or_else(|| BringupSession::new(Plan::PostInit));
        let result = self.sequencer(&session).ext_command(&mut bringup, request).await;
        session.store_bringup(bringup);
        result
    }

    /// Read or write an EEPROM item.
    pub async fn request_eeprom(
        &self,
        item: EepromItem,
        mode: EepromMode,
        buffer: &[u8],
    ) -> Result<Vec<u8>> {
        let request = EepromRequest { item, mode, buffer: buffer.to_vec() };
        match self.ext_command(ExtRequest::Eeprom(request)).await? {
            ExtResponse::Eeprom(value) => Ok(value),
            _ => Err(HalError::Failed),
        }
    }
}
