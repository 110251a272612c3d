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

//! One open HAL session.

use crate::config::HalConfig;
use crate::control::{self, ControlMessage, ControlState, HalStatus};
use crate::error::{HalError, NfcStatus, Result};
use crate::hal::{HalCallback, HalEvent};
use crate::lifecycle::{BringupSession, ChipInfo};
use crate::lock;
use crate::reader::TransportContext;
use crate::transport::Transport;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// State owned by an open session: the transport with its reader thread, the
/// control state and the control task.
pub(crate) struct Session {
    pub transport: TransportContext,
    pub control: Mutex<ControlState>,
    /// Serializes command submissions, held for a full command round trip.
    /// Shared so that a stack command can keep it until its response.
    pub submit: Arc<tokio::sync::Mutex<()>>,
    pub config: HalConfig,
    events: mpsc::UnboundedSender<ControlMessage>,
    task: Mutex<Option<JoinHandle<()>>>,
    bringup: Mutex<Option<BringupSession>>,
    chip: Mutex<Option<ChipInfo>>,
}

impl Session {
    /// Open the transport, start the reader thread and the control task, and
    /// request the first read.
    pub async fn start(
        link: Arc<dyn Transport>,
        config: &HalConfig,
        callback: Arc<dyn HalCallback>,
    ) -> Result<Arc<Session>> {
        let (events, rx) = mpsc::unbounded_channel();

        let transport = {
            let sink_events = events.clone();
            let transport_config = config.transport.clone();
            tokio::task::spawn_blocking(move || {
                TransportContext::init(
                    link,
                    &transport_config,
                    Box::new(move |bytes| {
                        let _ = sink_events.send(ControlMessage::ReadComplete(bytes));
                    }),
                )
            })
            .await
            .map_err(|_| HalError::Failed)??
        };

        let session = Arc::new(Session {
            transport,
            control: Mutex::new(ControlState {
                hal_status: HalStatus::Open,
                config_success: true,
                callback: Some(callback),
                ..Default::default()
            }),
            submit: Arc::new(tokio::sync::Mutex::new(())),
            config: config.clone(),
            events,
            task: Mutex::new(None),
            bringup: Mutex::new(None),
            chip: Mutex::new(None),
        });

        let task = tokio::spawn(control::run(Arc::downgrade(&session), rx));
        *lock(&session.task) = Some(task);

        session.transport.read()?;
        info!("session started");
        Ok(session)
    }

    /// Queue a message for the control task.
    pub fn post(&self, message: ControlMessage) {
        if self.events.send(message).is_err() {
            warn!("control task is gone, message dropped");
        }
    }

    /// Queue an event for the upper layer.
    pub fn post_event(&self, event: HalEvent, status: NfcStatus) {
        self.post(ControlMessage::Event(event, status));
    }

    pub fn status(&self) -> HalStatus {
        lock(&self.control).hal_status
    }

    pub fn bringup_active(&self) -> bool {
        lock(&self.control).bringup_active
    }

    pub fn set_bringup_active(&self, active: bool) {
        lock(&self.control).bringup_active = active;
    }

    pub fn take_bringup(&self) -> Option<BringupSession> {
        lock(&self.bringup).take()
    }

    pub fn store_bringup(&self, bringup: BringupSession) {
        *lock(&self.bringup) = Some(bringup);
    }

    pub fn chip(&self) -> Option<ChipInfo> {
        lock(&self.chip).clone()
    }

    pub fn set_chip(&self, chip: ChipInfo) {
        *lock(&self.chip) = Some(chip);
    }

    /// Stop reading from the link, so that it can be used directly.
    pub async fn pause_reads(self: &Arc<Self>) -> Result<()> {
        lock(&self.control).read_paused = true;
        let session = self.clone();
        tokio::task::spawn_blocking(move || session.transport.read_abort())
            .await
            .map_err(|_| HalError::Failed)?
    }

    /// Hand the link back to the reader thread.
    pub fn resume_reads(&self) {
        let mut state = lock(&self.control);
        state.read_paused = false;
        if state.hal_status == HalStatus::Open {
            match self.transport.read() {
                Ok(()) | Err(HalError::Busy) => (),
                Err(err) => warn!("failed to resume reading: {}", err),
            }
        }
    }

    /// Mark the session closed, stop the reader thread, close the link and
    /// stop the control task. Messages posted before the call are delivered.
    pub async fn teardown(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = lock(&self.control);
            state.hal_status = HalStatus::Closed;
            // Waiters observe a closed channel and fail with `Shutdown`.
            state.pending = Default::default();
            state.stack_response = None;
        }

        let session = self.clone();
        let closed = tokio::task::spawn_blocking(move || session.transport.shutdown())
            .await
            .map_err(|_| HalError::Failed)?;

        self.post(ControlMessage::Exit);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("control task panicked");
            }
        }

        *lock(&self.control) = ControlState::default();
        lock(&self.bringup).take();
        debug!("session torn down");
        closed
    }
}
