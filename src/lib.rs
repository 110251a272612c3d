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

//! NCI transaction engine for NXP NFC controllers.
//!
//! The crate drives an NFCC over a blocking byte link: a dedicated reader
//! thread drains frames from the controller, a control task dispatches them
//! either to the command waiting for a response or to the upper layer, and
//! the bring-up sequencer resets, initialises, updates and configures the
//! controller when the HAL is opened.
//!
//! The entry point is [`NciHal`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod emulator;
pub mod error;
pub mod ext;
pub mod firmware;
pub mod hal;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod i2c;
pub mod lifecycle;
pub mod nci;
pub mod reader;
pub mod transport;

mod control;
mod session;
mod writer;

pub use control::HalStatus;
pub use error::{HalError, NfcStatus, Result};
pub use hal::{CloseType, HalCallback, HalEvent, NciHal};
pub use writer::MAX_RETRY_COUNT;

/// Lock a mutex protecting plain state. A panic while the lock was held
/// leaves the state usable, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
