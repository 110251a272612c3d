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

//! Control state and frame dispatch.
//!
//! All deferred work of a session is posted to a single control task and
//! processed in order: frames read by the reader thread, events for the
//! upper layer and synthesized frames.

use crate::error::{HalError, NfcStatus};
use crate::hal::{HalCallback, HalEvent};
use crate::lock;
use crate::nci::{self, Frame, MessageType};
use crate::session::Session;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

/// Whether the HAL session is open.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HalStatus {
    #[default]
    Closed,
    Open,
}

/// Messages processed by the control task.
#[derive(Debug)]
pub(crate) enum ControlMessage {
    /// A frame was read from the transport.
    ReadComplete(Bytes),
    /// Asynchronous event for the upper layer.
    Event(HalEvent, NfcStatus),
    /// Frame for the upper layer that did not come from the transport.
    Data(Bytes),
    /// Stop the control task.
    Exit,
}

/// Completions of the command currently submitted through `send_and_wait`.
#[derive(Debug, Default)]
pub(crate) struct PendingCommand {
    pub response: Option<oneshot::Sender<Frame>>,
    pub notification: Option<oneshot::Sender<Frame>>,
}

/// Mutable state of a session, guarded by the session control lock.
#[derive(Default)]
pub(crate) struct ControlState {
    pub hal_status: HalStatus,
    /// Last command written to the transport.
    pub cmd: Bytes,
    /// Last response received for a HAL-originated command.
    pub rsp: Option<Frame>,
    /// A HAL-originated command waits for its response.
    pub hal_ext_enabled: bool,
    /// The pending command completes on a notification.
    pub wait_for_notification: bool,
    pub pending: PendingCommand,
    /// Completed by the response to the last command written by the stack.
    pub stack_response: Option<oneshot::Sender<Frame>>,
    /// Configuration commands are being sent.
    pub config_access: bool,
    /// Cleared by any failure status received while `config_access` is set.
    pub config_success: bool,
    /// The bring-up sequencer owns the controller.
    pub bringup_active: bool,
    /// Reads are not re-armed, the link is used for firmware download.
    pub read_paused: bool,
    pub callback: Option<Arc<dyn HalCallback>>,
}

impl Session {
    /// Route a frame read from the transport, then request the next read.
    pub(crate) fn on_frame_received(&self, bytes: Bytes) {
        let forward = match Frame::parse(bytes.clone()) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => {
                warn!("dropping malformed frame {:02x?}: {}", &bytes[..], err);
                None
            }
        };

        if let Some((callback, frame)) = forward {
            callback.on_data(frame.as_bytes());
        }

        let state = lock(&self.control);
        if state.read_paused || state.hal_status != HalStatus::Open {
            return;
        }
        match self.transport.read() {
            Ok(()) | Err(HalError::Busy) => (),
            Err(err) => warn!("failed to request the next read: {}", err),
        }
    }

    /// Complete the pending command with `frame`, or return the callback the
    /// frame must be delivered to.
    fn dispatch(&self, frame: Frame) -> Option<(Arc<dyn HalCallback>, Frame)> {
        let mut state = lock(&self.control);

        if let Some(status) = frame.status() {
            if status != nci::Status::Ok && state.config_access {
                warn!("configuration rejected with status {:?}", status);
                state.config_success = false;
            }
        }

        let answers_cmd = frame.is_response_to(&state.cmd);
        match frame.message_type() {
            MessageType::Response if state.hal_ext_enabled && answers_cmd => {
                if nci::awaits_notification(&state.cmd, &frame) {
                    state.wait_for_notification = true;
                }
                state.rsp = Some(frame.clone());
                match state.pending.response.take() {
                    Some(sender) => {
                        let _ = sender.send(frame);
                    }
                    None => debug!("no command waits for {:02x?}", frame.as_bytes()),
                }
                None
            }
            MessageType::Notification if state.wait_for_notification => {
                state.wait_for_notification = false;
                if let Some(sender) = state.pending.notification.take() {
                    let _ = sender.send(frame);
                }
                None
            }
            _ if state.bringup_active => {
                debug!("bring-up in progress, dropping {:02x?}", frame.as_bytes());
                None
            }
            _ if state.hal_status == HalStatus::Open => {
                if state.hal_ext_enabled && frame.message_type() == MessageType::Response {
                    warn!(
                        "response {:02x?} does not match command {:02x?}, forwarding",
                        frame.as_bytes(),
                        &state.cmd[..]
                    );
                } else if answers_cmd {
                    if let Some(sender) = state.stack_response.take() {
                        let _ = sender.send(frame.clone());
                    }
                }
                state.callback.clone().map(|callback| (callback, frame))
            }
            _ => None,
        }
    }

    fn deliver_event(&self, event: HalEvent, status: NfcStatus) {
        let callback = lock(&self.control).callback.clone();
        match callback {
            Some(callback) => {
                info!("event {:?} status {:?}", event, status);
                callback.on_event(event, status);
            }
            None => debug!("no callback for {:?}", event),
        }
    }

    fn deliver_data(&self, data: Bytes) {
        let callback = lock(&self.control).callback.clone();
        if let Some(callback) = callback {
            callback.on_data(&data);
        }
    }
}

/// Control task of a session. Holds a weak reference so that a dropped
/// session also ends the task.
pub(crate) async fn run(session: Weak<Session>, mut rx: mpsc::UnboundedReceiver<ControlMessage>) {
    debug!("control task started");
    while let Some(message) = rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match message {
            ControlMessage::ReadComplete(bytes) => session.on_frame_received(bytes),
            ControlMessage::Event(event, status) => session.deliver_event(event, status),
            ControlMessage::Data(data) => session.deliver_data(data),
            ControlMessage::Exit => break,
        }
    }
    debug!("control task exiting");
}
