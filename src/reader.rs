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

//! Transport context and reader thread.
//!
//! The reader thread owns the read side of the link. It sleeps until a read
//! is requested, performs exactly one blocking read, and hands the frame to
//! the sink. The next read is only requested once the frame has been
//! processed, so at most one read is ever in flight.

use crate::error::{HalError, Result};
use crate::lock;
use crate::nci;
use crate::transport::{Transport, TransportConfig};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Delay added after each consecutive failed read.
const READ_BACKOFF_STEP: Duration = Duration::from_millis(10);
/// Upper bound of the delay between failed reads.
const READ_BACKOFF_MAX: Duration = Duration::from_millis(150);
/// Interval between attempts to unblock a pending read.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Attempts made to unblock a pending read before giving up.
const ABORT_ATTEMPTS: u32 = 200;

/// Receives every frame read from the link.
pub type FrameSink = Box<dyn Fn(Bytes) + Send + 'static>;

/// State of the read request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// No read requested.
    Idle,
    /// A read is requested, the reader thread has not started it yet.
    ReadRequested,
    /// The reader thread is blocked in the link.
    ReadAttempted,
}

struct ReaderState {
    read: ReadState,
    abort_requested: bool,
    running: bool,
}

struct Shared {
    state: Mutex<ReaderState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        lock(&self.state)
    }
}

/// Link owned by an open session, with its reader thread.
pub struct TransportContext {
    link: Arc<dyn Transport>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransportContext {
    /// Open the link and start the reader thread. Frames are passed to
    /// `sink` from the reader thread.
    pub fn init(
        link: Arc<dyn Transport>,
        config: &TransportConfig,
        sink: FrameSink,
    ) -> Result<TransportContext> {
        link.open(config)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ReaderState {
                read: ReadState::Idle,
                abort_requested: false,
                running: true,
            }),
            wake: Condvar::new(),
        });

        let thread = {
            let link = link.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("nci-reader".to_owned())
                .spawn(move || reader_loop(link, shared, sink))
        };
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                error!("failed to start the reader thread: {}", err);
                let _ = link.close();
                return Err(err.into());
            }
        };

        info!("transport initialized");
        Ok(TransportContext { link, shared, thread: Mutex::new(Some(thread)) })
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn Transport> {
        &self.link
    }

    /// Request the next read. Fails with [`HalError::Busy`] when a read is
    /// already requested or in flight.
    pub fn read(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.running {
            return Err(HalError::Shutdown);
        }
        if state.read != ReadState::Idle {
            return Err(HalError::Busy);
        }
        state.read = ReadState::ReadRequested;
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Current state of the read request.
    pub fn read_state(&self) -> ReadState {
        self.shared.lock().read
    }

    /// Cancel the pending read. Returns once the reader thread no longer
    /// uses the link. Blocks the calling thread.
    pub fn read_abort(&self) -> Result<()> {
        let mut state = self.shared.lock();
        match state.read {
            ReadState::Idle => return Ok(()),
            ReadState::ReadRequested => {
                state.read = ReadState::Idle;
                return Ok(());
            }
            ReadState::ReadAttempted => state.abort_requested = true,
        }
        drop(state);

        for _ in 0..ABORT_ATTEMPTS {
            self.link.abort_read();
            let state = self.shared.lock();
            let (state, _) = self
                .shared
                .wake
                .wait_timeout_while(state, ABORT_POLL_INTERVAL, |s| {
                    s.read == ReadState::ReadAttempted
                })
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.read != ReadState::ReadAttempted {
                debug!("pending read aborted");
                return Ok(());
            }
        }
        warn!("pending read could not be aborted");
        Err(HalError::Busy)
    }

    /// Stop the reader thread and close the link. Blocks the calling thread
    /// until the reader thread exits.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.running = false;
            self.shared.wake.notify_all();
        }

        if let Some(thread) = lock(&self.thread).take() {
            let mut attempts = 0;
            while !thread.is_finished() && attempts < ABORT_ATTEMPTS {
                self.link.abort_read();
                std::thread::sleep(ABORT_POLL_INTERVAL);
                attempts += 1;
            }
            if thread.is_finished() {
                if thread.join().is_err() {
                    error!("reader thread panicked");
                }
            } else {
                warn!("reader thread did not exit, detaching it");
            }
        }

        self.link.close()
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.running = false;
        self.shared.wake.notify_all();
    }
}

fn reader_loop(link: Arc<dyn Transport>, shared: Arc<Shared>, sink: FrameSink) {
    let mut buffer = [0u8; nci::MAX_FRAME_SIZE];
    let mut backoff = Duration::ZERO;

    debug!("reader thread started");
    loop {
        {
            let mut state = shared.lock();
            while state.running && state.read != ReadState::ReadRequested {
                state = shared.wake.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if !state.running {
                break;
            }
            state.read = ReadState::ReadAttempted;
        }

        let result = link.read(&mut buffer);

        let mut state = shared.lock();
        if state.abort_requested {
            state.abort_requested = false;
            state.read = ReadState::Idle;
            shared.wake.notify_all();
            if let Ok(size) = result {
                warn!("discarding {} bytes read while aborting", size);
            }
            backoff = Duration::ZERO;
            continue;
        }

        match result {
            Ok(size) if size >= nci::HEADER_SIZE => {
                state.read = ReadState::Idle;
                shared.wake.notify_all();
                drop(state);
                backoff = Duration::ZERO;
                debug!("read {} bytes", size);
                sink(Bytes::copy_from_slice(&buffer[..size]));
            }
            result => {
                if !state.running {
                    break;
                }
                match result {
                    Ok(size) => warn!("short read of {} bytes", size),
                    Err(err) => warn!("read failed: {}", err),
                }
                // Keep the request armed and retry after a growing delay.
                backoff = (backoff + READ_BACKOFF_STEP).min(READ_BACKOFF_MAX);
                state.read = ReadState::ReadRequested;
                let _ = shared
                    .wake
                    .wait_timeout(state, backoff)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
    }
    debug!("reader thread exiting");
}
