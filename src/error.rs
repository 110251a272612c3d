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

//! Errors returned by the HAL core.

use crate::nci;
use std::time::Duration;
use thiserror::Error;

/// Result type
pub type Result<T> = std::result::Result<T, HalError>;

/// Errors that can be encountered while driving the NFCC.
#[derive(Error, Debug)]
pub enum HalError {
    /// Generic failure, reported when no finer cause applies.
    #[error("operation failed")]
    Failed,
    /// A read request is already pending on the transport.
    #[error("transport busy: a read is already pending")]
    Busy,
    /// The HAL session is not open.
    #[error("HAL is not open")]
    NotOpen,
    /// The bring-up sequence owns the controller.
    #[error("bring-up in progress")]
    BringupInProgress,
    /// The session was torn down while the operation was waiting.
    #[error("HAL session shut down")]
    Shutdown,
    /// Error reported by the physical transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// All write attempts failed.
    #[error("transport write failed after {0} attempts")]
    WriteExhausted(u32),
    /// No response arrived within the response timeout.
    #[error("no response from the controller within {0:?}")]
    ResponseTimeout(Duration),
    /// The controller answered with a non-OK status.
    #[error("controller returned status {0:?}")]
    Status(nci::Status),
    /// Bytes that do not form a valid NCI frame.
    #[error("invalid NCI frame: {0}")]
    InvalidFrame(&'static str),
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Firmware image or download failure.
    #[error("firmware error: {0}")]
    Firmware(String),
}

/// Status reported to the upper layer alongside asynchronous events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NfcStatus {
    Ok,
    Failed,
    ErrTransport,
    ErrCmdTimeout,
    Refused,
}

impl From<&HalError> for NfcStatus {
    fn from(err: &HalError) -> Self {
        match err {
            HalError::Io(_) | HalError::WriteExhausted(_) => NfcStatus::ErrTransport,
            HalError::ResponseTimeout(_) => NfcStatus::ErrCmdTimeout,
            HalError::Busy | HalError::BringupInProgress => NfcStatus::Refused,
            _ => NfcStatus::Failed,
        }
    }
}

impl<T> From<&Result<T>> for NfcStatus {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => NfcStatus::Ok,
            Err(err) => err.into(),
        }
    }
}
