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

//! Command submission.
//!
//! Writes are executed on blocking worker threads and retried a bounded
//! number of times. A HAL-originated command registers one-shot
//! completions with the control state before it is written; the control
//! task completes them when the matching response, and for NCI 2.0 resets
//! the notification, is read back.

use crate::control::{ControlMessage, HalStatus, PendingCommand};
use crate::error::{HalError, NfcStatus, Result};
use crate::hal::HalEvent;
use crate::lock;
use crate::nci::{self, Frame, MessageType};
use crate::session::Session;
use crate::transport::ResetMode;
use bytes::Bytes;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Number of attempts made to write a frame before the transport is
/// considered broken.
pub const MAX_RETRY_COUNT: u32 = 5;

/// Frames exchanged for one HAL-originated command.
#[derive(Clone, Debug)]
pub(crate) struct Exchange {
    pub response: Frame,
    /// Notification completing the command, for NCI 2.0 CORE_RESET.
    pub notification: Option<Frame>,
}

impl Session {
    /// Write `data` to the transport. The caller holds the submission lock.
    pub(crate) async fn write_unlocked(self: &Arc<Self>, data: Bytes) -> Result<usize> {
        lock(&self.control).cmd = data.clone();
        let delay = self.config.write_retry_delay();

        for attempt in 1..=MAX_RETRY_COUNT {
            let session = self.clone();
            let frame = data.clone();
            let result = tokio::task::spawn_blocking(move || session.transport.link().write(&frame))
                .await
                .map_err(|_| HalError::Failed)?;
            match result {
                Ok(written) if written == data.len() => {
                    debug!("wrote {:02x?}", &data[..]);
                    return Ok(written);
                }
                Ok(written) => {
                    warn!("short write {}/{} (attempt {})", written, data.len(), attempt)
                }
                Err(err) => warn!("write failed (attempt {}): {}", attempt, err),
            }
            if attempt < MAX_RETRY_COUNT {
                tokio::time::sleep(delay).await;
            }
        }

        error!("write failed {} times, resetting the controller", MAX_RETRY_COUNT);
        self.recover_from_write_failure().await;
        Err(HalError::WriteExhausted(MAX_RETRY_COUNT))
    }

    /// Write a frame from the stack. A command keeps the submission lock until
    /// its response is read back, so HAL commands never interleave with it.
    pub(crate) async fn write_from_stack(self: &Arc<Self>, data: Bytes) -> Result<usize> {
        let guard = self.submit.clone().lock_owned().await;

        let response = match Frame::parse(data.clone()) {
            Ok(frame) if frame.message_type() == MessageType::Command => {
                let (tx, rx) = oneshot::channel();
                lock(&self.control).stack_response = Some(tx);
                Some(rx)
            }
            _ => None,
        };

        let written = match self.write_unlocked(data.clone()).await {
            Ok(written) => written,
            Err(err) => {
                lock(&self.control).stack_response = None;
                return Err(err);
            }
        };

        if let Some(response) = response {
            let timeout = self.config.response_timeout;
            tokio::spawn(async move {
                if let Err(err) = wait(response, timeout).await {
                    debug!("no response to stack command {:02x?}: {}", &data[..], err);
                }
                drop(guard);
            });
        }
        Ok(written)
    }

    async fn recover_from_write_failure(self: &Arc<Self>) {
        let session = self.clone();
        match tokio::task::spawn_blocking(move || {
            session.transport.link().reset(ResetMode::PowerCycle)
        })
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(err)) => error!("controller reset failed: {}", err),
            Err(_) => error!("controller reset did not complete"),
        }

        let notify = {
            let state = lock(&self.control);
            state.hal_status == HalStatus::Open
                && state.callback.is_some()
                && !state.bringup_active
        };
        if notify {
            self.post(ControlMessage::Data(Bytes::from_static(
                &nci::CORE_RESET_NTF_UNRECOVERABLE,
            )));
            self.post_event(HalEvent::Error, NfcStatus::ErrTransport);
        }
    }

    /// Write `cmd` and wait for its response, and for its notification when
    /// the response announces one. The response is returned whatever its
    /// status.
    pub(crate) async fn transceive(self: &Arc<Self>, cmd: Bytes) -> Result<Exchange> {
        let _guard = self.submit.lock().await;

        let (response_tx, response_rx) = oneshot::channel();
        let (notification_tx, notification_rx) = oneshot::channel();
        {
            let mut state = lock(&self.control);
            if state.hal_status != HalStatus::Open {
                return Err(HalError::NotOpen);
            }
            state.hal_ext_enabled = true;
            state.wait_for_notification = false;
            state.rsp = None;
            state.pending = PendingCommand {
                response: Some(response_tx),
                notification: Some(notification_tx),
            };
        }

        let result = self.exchange(cmd, response_rx, notification_rx).await;

        let mut state = lock(&self.control);
        state.hal_ext_enabled = false;
        state.wait_for_notification = false;
        state.pending = Default::default();
        result
    }

    async fn exchange(
        self: &Arc<Self>,
        cmd: Bytes,
        response: oneshot::Receiver<Frame>,
        notification: oneshot::Receiver<Frame>,
    ) -> Result<Exchange> {
        self.write_unlocked(cmd.clone()).await?;

        let timeout = self.config.response_timeout;
        let response = wait(response, timeout).await.map_err(|err| {
            warn!("no response to {:02x?}: {}", &cmd[..], err);
            err
        })?;

        let notification = if nci::awaits_notification(&cmd, &response) {
            Some(wait(notification, timeout).await.map_err(|err| {
                warn!("no notification after {:02x?}: {}", response.as_bytes(), err);
                err
            })?)
        } else {
            None
        };

        Ok(Exchange { response, notification })
    }

    /// Send a HAL-originated command and wait for its completion. Fails on a
    /// non-OK response status.
    pub(crate) async fn send_and_wait(self: &Arc<Self>, cmd: Bytes) -> Result<Exchange> {
        let exchange = self.transceive(cmd).await?;
        match exchange.response.status() {
            Some(nci::Status::Ok) | None => Ok(exchange),
            Some(status) => Err(HalError::Status(status)),
        }
    }
}

async fn wait(rx: oneshot::Receiver<Frame>, timeout: Duration) -> Result<Frame> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(frame)) => Ok(frame),
        Ok(Err(_)) => Err(HalError::Shutdown),
        Err(_) => Err(HalError::ResponseTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HalConfig;
    use crate::emulator::{Emulator, EmulatorOptions, RecordingCallback};
    use crate::nci::{NciVersion, ResetType};

    async fn start(options: EmulatorOptions) -> (Arc<Emulator>, Arc<Session>, Arc<RecordingCallback>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let emulator = Arc::new(Emulator::new(options));
        let callback = Arc::new(RecordingCallback::default());
        let config = HalConfig { response_timeout: Duration::from_millis(300), ..Default::default() };
        let session = Session::start(emulator.clone(), &config, callback.clone()).await.unwrap();
        (emulator, session, callback)
    }

    #[tokio::test]
    async fn write_retries_are_bounded() {
        let (emulator, session, callback) =
            start(EmulatorOptions { fail_writes: true, ..Default::default() }).await;

        let result = session.transceive(nci::core_init_cmd(NciVersion::Version20)).await;
        assert!(matches!(result, Err(HalError::WriteExhausted(MAX_RETRY_COUNT))));
        assert_eq!(emulator.stats().write_attempts, MAX_RETRY_COUNT);
        assert_eq!(emulator.stats().resets, vec![ResetMode::PowerCycle]);

        assert!(
            callback.wait_for_data(&nci::CORE_RESET_NTF_UNRECOVERABLE, Duration::from_secs(1)).await
        );
        assert_eq!(
            callback.wait_for_event(HalEvent::Error, Duration::from_secs(1)).await,
            Some(NfcStatus::ErrTransport)
        );
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_response_reaches_stack() {
        let (emulator, session, callback) =
            start(EmulatorOptions { silent: true, ..Default::default() }).await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                session.transceive(Bytes::from_static(&[0x2f, 0x02, 0x00])).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        emulator.inject(&[0x40, 0x01, 0x01, 0x00]);
        emulator.inject(&[0x4f, 0x02, 0x01, 0x00]);

        let exchange = pending.await.unwrap().unwrap();
        assert_eq!(exchange.response.as_bytes(), &[0x4f, 0x02, 0x01, 0x00]);
        assert!(callback.wait_for_data(&[0x40, 0x01, 0x01, 0x00], Duration::from_secs(1)).await);
        assert!(!callback.data().iter().any(|data| data == &[0x4f, 0x02, 0x01, 0x00]));
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn generic_error_fails_configuration() {
        let (emulator, session, callback) = start(EmulatorOptions::default()).await;
        lock(&session.control).config_access = true;

        emulator.inject(&[0x60, 0x07, 0x01, 0x03]);
        assert!(callback.wait_for_data(&[0x60, 0x07, 0x01, 0x03], Duration::from_secs(1)).await);
        assert!(!lock(&session.control).config_success);
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn reset_completes_on_notification() {
        let (_emulator, session, callback) = start(EmulatorOptions::default()).await;

        let exchange = session.send_and_wait(nci::core_reset_cmd(ResetType::KeepConfig)).await.unwrap();
        assert_eq!(exchange.response.payload(), &[0x00]);
        let info = nci::parse_reset(&exchange.response, exchange.notification.as_ref()).unwrap();
        assert_eq!(info.version, NciVersion::Version20);

        // Frames answering HAL commands never reach the upper layer.
        assert!(callback.data().is_empty());
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_response_times_out() {
        let (_emulator, session, _callback) =
            start(EmulatorOptions { silent: true, ..Default::default() }).await;

        let result = session.send_and_wait(nci::core_reset_cmd(ResetType::KeepConfig)).await;
        assert!(matches!(result, Err(HalError::ResponseTimeout(_))));
        assert!(!lock(&session.control).hal_ext_enabled);
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_command_reports_status() {
        let (emulator, session, _callback) = start(EmulatorOptions::default()).await;
        emulator.update_options(|options| {
            options.rejected_params.insert(nci::ConfigParamId(0x32), u32::MAX);
        });

        let cmd = nci::core_set_config_cmd(&[nci::ConfigParam {
            id: nci::ConfigParamId(0x32),
            value: vec![0x60],
        }]);
        let result = session.send_and_wait(cmd).await;
        assert!(matches!(result, Err(HalError::Status(nci::Status::InvalidParam))));
        session.teardown().await.unwrap();
    }
}
