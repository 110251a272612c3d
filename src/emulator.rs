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

//! Emulated NFCC.
//!
//! Implements [`Transport`] in process: commands written to the link are
//! answered the way an NXP controller does, and answers are returned by
//! the next reads. Faults can be injected to exercise the recovery paths.

use crate::error::{HalError, NfcStatus, Result};
use crate::firmware::{self, FirmwareVersion, ImageKind};
use crate::hal::{HalCallback, HalEvent};
use crate::lock;
use crate::nci::{
    self, gid, oid, ConfigParam, ConfigParamId, ConfigStatus, Frame, MessageType, NciVersion,
    ResetTrigger, ResetType, Status,
};
use crate::transport::{ResetMode, Transport, TransportConfig};
use bytes::Bytes;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Manufacturer ID reported in CORE_RESET_NTF and CORE_INIT_RSP.
const MANUFACTURER_ID_NXP: u8 = 0x04;

/// Behaviour of the emulated controller.
#[derive(Clone, Debug)]
pub struct EmulatorOptions {
    /// Version reported at reset.
    pub nci_version: NciVersion,
    /// CORE_INIT_CMD layout accepted, when different from `nci_version`.
    pub accepts_init_version: Option<NciVersion>,
    /// Hardware version reported in the manufacturer information.
    pub hw_version: u8,
    /// Firmware initially flashed.
    pub firmware: FirmwareVersion,
    /// Opening the link fails.
    pub fail_open: bool,
    /// Every write fails.
    pub fail_writes: bool,
    /// Number of reads that fail before reads succeed again.
    pub failing_reads: u32,
    /// Parameters rejected with STATUS_INVALID_PARAM, with the number of
    /// times they are rejected. `u32::MAX` rejects them forever.
    pub rejected_params: HashMap<ConfigParamId, u32>,
    /// Firmware download chunks are rejected.
    pub fail_downloads: bool,
    /// Commands are never answered.
    pub silent: bool,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        EmulatorOptions {
            nci_version: NciVersion::Version20,
            accepts_init_version: None,
            hw_version: 0x51,
            firmware: FirmwareVersion { rom: 0x01, major: 0x10, minor: 0x00 },
            fail_open: false,
            fail_writes: false,
            failing_reads: 0,
            rejected_params: HashMap::new(),
            fail_downloads: false,
            silent: false,
        }
    }
}

/// Firmware image completely downloaded to the emulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRecord {
    #[allow(missing_docs)]
    pub kind: ImageKind,
    #[allow(missing_docs)]
    pub version: FirmwareVersion,
}

/// Counters exposed for assertions.
#[derive(Clone, Debug, Default)]
#[allow(missing_docs)]
pub struct EmulatorStats {
    pub opens: u32,
    pub closes: u32,
    pub write_attempts: u32,
    pub physical_reads: u32,
    pub max_concurrent_reads: u32,
    pub resets: Vec<ResetMode>,
    /// NCI commands received, in order.
    pub commands: Vec<Bytes>,
    pub downloads: Vec<DownloadRecord>,
}

impl EmulatorStats {
    /// Number of commands received with the given group and opcode.
    pub fn count_commands(&self, gid: u8, oid: u8) -> usize {
        self.commands
            .iter()
            .filter(|cmd| {
                Frame::parse((*cmd).clone())
                    .map_or(false, |frame| frame.is(MessageType::Command, gid, oid))
            })
            .count()
    }
}

/// State of an emulated controller.
struct State {
    options: EmulatorOptions,
    firmware: FirmwareVersion,
    config_parameters: HashMap<ConfigParamId, Vec<u8>>,
    open: bool,
    rx_queue: VecDeque<Bytes>,
    reads_in_flight: u32,
    abort: bool,
    download_mode: bool,
    download_buffer: Vec<u8>,
    download_failed: bool,
    stats: EmulatorStats,
}

/// Emulated NXP controller.
pub struct Emulator {
    state: Mutex<State>,
    rx_ready: Condvar,
}

impl Emulator {
    /// Create a powered controller.
    pub fn new(options: EmulatorOptions) -> Emulator {
        Emulator {
            state: Mutex::new(State {
                firmware: options.firmware,
                options,
                config_parameters: HashMap::new(),
                open: false,
                rx_queue: VecDeque::new(),
                reads_in_flight: 0,
                abort: false,
                download_mode: false,
                download_buffer: vec![],
                download_failed: false,
                stats: Default::default(),
            }),
            rx_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    #[allow(missing_docs)]
    pub fn stats(&self) -> EmulatorStats {
        self.lock().stats.clone()
    }

    /// Change the behaviour of the controller.
    pub fn update_options(&self, update: impl FnOnce(&mut EmulatorOptions)) {
        update(&mut self.lock().options);
    }

    /// Queue a frame sent by the controller on its own.
    pub fn inject(&self, frame: &[u8]) {
        self.lock().rx_queue.push_back(Bytes::copy_from_slice(frame));
        self.rx_ready.notify_all();
    }

    /// Value of a configuration parameter.
    pub fn config_parameter(&self, id: ConfigParamId) -> Option<Vec<u8>> {
        self.lock().config_parameters.get(&id).cloned()
    }

    /// Firmware currently flashed.
    pub fn firmware_version(&self) -> FirmwareVersion {
        self.lock().firmware
    }

    fn send(&self, state: &mut State, frame: Bytes) {
        debug!("emulator > {:02x?}", &frame[..]);
        state.rx_queue.push_back(frame);
        self.rx_ready.notify_all();
    }

    fn send_control(&self, state: &mut State, packet: impl Into<nci::ControlPacket>) {
        self.send(state, nci::serialize(packet));
    }

    fn send_status(&self, state: &mut State, gid: u8, oid: u8, status: Status) {
        self.send(state, nci::control_packet(MessageType::Response, gid, oid, &[status.into()]));
    }

    fn receive_command(&self, state: &mut State, bytes: &[u8]) {
        use nci::packets::ControlPacketChild::*;
        use nci::packets::CorePacketChild::*;

        state.stats.commands.push(Bytes::copy_from_slice(bytes));
        if state.options.silent {
            return;
        }
        let frame = match Frame::parse(Bytes::copy_from_slice(bytes)) {
            Ok(frame) if frame.message_type() == MessageType::Command => frame,
            Ok(_) => return,
            Err(err) => {
                debug!("emulator: ignoring malformed frame: {}", err);
                return;
            }
        };

        // [NCI] 3.2.2 Exception Handling for Control Messages
        // A command with an invalid layout is answered with STATUS_SYNTAX_ERROR.
        let packet = match nci::ControlPacket::parse(bytes) {
            Ok(packet) => packet,
            Err(_) => {
                self.send_status(state, frame.gid(), frame.oid(), Status::SyntaxError);
                return;
            }
        };
        match packet.specialize() {
            CorePacket(packet) => match packet.specialize() {
                CoreResetCommand(cmd) => self.core_reset(state, cmd),
                CoreInitCommand(cmd) => self.core_init(state, cmd),
                CoreSetConfigCommand(cmd) => self.core_set_config(state, cmd),
                CoreGetConfigCommand(cmd) => self.core_get_config(state, cmd),
                _ => self.send_status(state, frame.gid(), frame.oid(), Status::Ok),
            },
            _ => self.send_status(state, frame.gid(), frame.oid(), Status::Ok),
        }
    }

    fn manufacturer_info(state: &State) -> Vec<u8> {
        vec![state.options.hw_version, state.firmware.rom, state.firmware.major, state.firmware.minor]
    }

    fn core_reset(&self, state: &mut State, cmd: nci::packets::CoreResetCommand) {
        info!("emulator: core_reset({:?})", cmd.get_reset_type());
        let config_status = match cmd.get_reset_type() {
            ResetType::KeepConfig => ConfigStatus::ConfigKept,
            ResetType::ResetConfig => {
                state.config_parameters.clear();
                ConfigStatus::ConfigReset
            }
        };
        let version = state.options.nci_version;

        if version.is_v2() {
            self.send_control(
                state,
                nci::packets::CoreResetResponseBuilder {
                    status: Status::Ok,
                    version_information: vec![],
                },
            );
            let manufacturer_specific_information = Self::manufacturer_info(state);
            self.send_control(
                state,
                nci::packets::CoreResetNotificationBuilder {
                    trigger: ResetTrigger::ResetCommand,
                    config_status,
                    nci_version: version,
                    manufacturer_id: MANUFACTURER_ID_NXP,
                    manufacturer_specific_information,
                },
            );
        } else {
            self.send_control(
                state,
                nci::packets::CoreResetResponseBuilder {
                    status: Status::Ok,
                    version_information: vec![version.into(), config_status.into()],
                },
            );
        }
    }

    fn core_init(&self, state: &mut State, cmd: nci::packets::CoreInitCommand) {
        let layout = state.options.accepts_init_version.unwrap_or(state.options.nci_version);
        let expected_len = if layout.is_v2() { 2 } else { 0 };
        info!("emulator: core_init({:02x?})", &cmd.get_feature_enable()[..]);

        if cmd.get_feature_enable().len() != expected_len {
            self.send_status(state, gid::CORE, oid::CORE_INIT, Status::SyntaxError);
            return;
        }

        // NFCC Features.
        let mut parameters = vec![0x00, 0x00, 0x00, 0x00];
        if layout.is_v2() {
            // Max Logical Connections, Max Routing Table Size, Max Control
            // Packet Payload Size, Max Data Packet Payload Size, Number of
            // Credits, Max NFC-V RF Frame Size, RF Interfaces.
            parameters
                .extend_from_slice(&[0x02, 0x00, 0x02, 0xff, 0xff, 0x00, 0x00, 0x02, 0x01, 0x01, 0x00]);
        } else {
            // RF Interfaces, Max Logical Connections, Max Routing Table Size,
            // Max Control Packet Payload Size, Max Size for Large Parameters,
            // Manufacturer ID, Manufacturer Specific Information.
            parameters.extend_from_slice(&[0x01, 0x01, 0x02, 0x00, 0x02, 0xff, 0x00, 0xff]);
            parameters.push(MANUFACTURER_ID_NXP);
            parameters.extend_from_slice(&Self::manufacturer_info(state));
        }
        self.send_control(
            state,
            nci::packets::CoreInitResponseBuilder { status: Status::Ok, parameters },
        );
    }

    fn core_set_config(&self, state: &mut State, cmd: nci::packets::CoreSetConfigCommand) {
        let params =
            match nci::parse_config_params(cmd.get_parameter_count(), &cmd.get_parameters()[..]) {
                Ok(params) => params,
                Err(_) => {
                    self.send_status(state, gid::CORE, oid::CORE_SET_CONFIG, Status::SyntaxError);
                    return;
                }
            };

        let mut invalid_parameters = vec![];
        for param in params {
            match state.options.rejected_params.get_mut(&param.id) {
                Some(count) if *count > 0 => {
                    if *count != u32::MAX {
                        *count -= 1;
                    }
                    invalid_parameters.push(param.id);
                }
                _ => {
                    state.config_parameters.insert(param.id, param.value);
                }
            }
        }

        // If the DH tries to set a parameter that is not applicable for the
        // NFCC, the NFCC SHALL respond with a CORE_SET_CONFIG_RSP with a Status
        // field of STATUS_INVALID_PARAM and including one or more invalid
        // Parameter ID(s).
        if !invalid_parameters.is_empty() {
            info!("emulator: rejecting configuration parameters {:?}", invalid_parameters);
        }
        self.send_control(
            state,
            nci::packets::CoreSetConfigResponseBuilder {
                status: if invalid_parameters.is_empty() {
                    Status::Ok
                } else {
                    Status::InvalidParam
                },
                parameter_count: invalid_parameters.len() as u8,
                parameter_ids: nci::encode_config_ids(&invalid_parameters),
            },
        );
    }

    fn core_get_config(&self, state: &mut State, cmd: nci::packets::CoreGetConfigCommand) {
        let ids =
            match nci::parse_config_ids(cmd.get_parameter_count(), &cmd.get_parameter_ids()[..]) {
                Ok(ids) => ids,
                Err(_) => {
                    self.send_status(state, gid::CORE, oid::CORE_GET_CONFIG, Status::SyntaxError);
                    return;
                }
            };

        let missing: Vec<_> = ids
            .iter()
            .filter(|id| !state.config_parameters.contains_key(*id))
            .map(|id| ConfigParam { id: *id, value: vec![] })
            .collect();

        // If the DH tries to retrieve any parameter(s) that are not available
        // in the NFCC, the NFCC SHALL respond with a CORE_GET_CONFIG_RSP with a
        // Status field of STATUS_INVALID_PARAM, containing each unavailable
        // Parameter ID with a Parameter Len field of value zero.
        let (status, parameters) = if missing.is_empty() {
            let parameters = ids
                .iter()
                .map(|id| ConfigParam {
                    id: *id,
                    value: state.config_parameters.get(id).cloned().unwrap_or_default(),
                })
                .collect();
            (Status::Ok, parameters)
        } else {
            (Status::InvalidParam, missing)
        };
        self.send_control(
            state,
            nci::packets::CoreGetConfigResponseBuilder {
                status,
                parameter_count: parameters.len() as u8,
                parameters: nci::encode_config_params(&parameters),
            },
        );
    }

    fn receive_download_frame(&self, state: &mut State, bytes: &[u8]) {
        let status = match firmware::parse_download_frame(bytes) {
            None => firmware::DOWNLOAD_STATUS_CRC_ERROR,
            Some(_) if state.options.fail_downloads => firmware::DOWNLOAD_STATUS_WRITE_FAILED,
            Some(payload) => {
                state.download_buffer.extend_from_slice(payload);
                firmware::DOWNLOAD_STATUS_OK
            }
        };
        if status != firmware::DOWNLOAD_STATUS_OK {
            state.download_failed = true;
        }
        self.send(state, firmware::download_response(status));
    }

    /// Leave download mode, booting the downloaded image when complete.
    fn finish_download(state: &mut State) {
        state.download_mode = false;
        let buffer = std::mem::take(&mut state.download_buffer);
        if state.download_failed || buffer.is_empty() {
            return;
        }
        match firmware::parse_header(&buffer) {
            Ok((kind, version, _)) => {
                let kind = if kind == 0 { ImageKind::Real } else { ImageKind::Dummy };
                info!("emulator: {:?} firmware {} flashed", kind, version);
                if kind == ImageKind::Real {
                    state.firmware = version;
                }
                state.stats.downloads.push(DownloadRecord { kind, version });
            }
            Err(err) => info!("emulator: discarding downloaded image: {}", err),
        }
    }
}

impl Transport for Emulator {
    fn open(&self, _config: &TransportConfig) -> Result<()> {
        let mut state = self.lock();
        if state.options.fail_open {
            return Err(HalError::Io(io::Error::new(io::ErrorKind::NotFound, "no device")));
        }
        state.open = true;
        state.stats.opens += 1;
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        state.stats.physical_reads += 1;
        if state.options.failing_reads > 0 {
            state.options.failing_reads -= 1;
            return Err(HalError::Io(io::Error::new(io::ErrorKind::Other, "read failed")));
        }

        state.reads_in_flight += 1;
        state.stats.max_concurrent_reads =
            state.stats.max_concurrent_reads.max(state.reads_in_flight);
        let result = loop {
            if !state.open {
                break Err(HalError::NotOpen);
            }
            if state.abort {
                state.abort = false;
                break Err(HalError::Io(io::ErrorKind::Interrupted.into()));
            }
            if let Some(frame) = state.rx_queue.pop_front() {
                match buf.get_mut(..frame.len()) {
                    Some(dest) => {
                        dest.copy_from_slice(&frame);
                        break Ok(frame.len());
                    }
                    None => break Err(HalError::InvalidFrame("frame exceeds the read buffer")),
                }
            }
            state = self.rx_ready.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        };
        state.reads_in_flight -= 1;
        if state.reads_in_flight == 0 {
            state.abort = false;
        }
        result
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        state.stats.write_attempts += 1;
        if state.options.fail_writes {
            return Err(HalError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        if !state.open {
            return Err(HalError::NotOpen);
        }
        debug!("emulator < {:02x?}", buf);
        if state.download_mode {
            self.receive_download_frame(&mut state, buf);
        } else {
            self.receive_command(&mut state, buf);
        }
        Ok(buf.len())
    }

    fn reset(&self, mode: ResetMode) -> Result<()> {
        let mut state = self.lock();
        info!("emulator: reset({:?})", mode);
        state.stats.resets.push(mode);
        if state.download_mode {
            Self::finish_download(&mut state);
        }
        // The controller reboots, nothing it had queued is sent.
        state.rx_queue.clear();
        if mode == ResetMode::FirmwareDownload {
            state.download_mode = true;
            state.download_failed = false;
        }
        Ok(())
    }

    fn abort_read(&self) {
        let mut state = self.lock();
        if state.reads_in_flight > 0 {
            state.abort = true;
            self.rx_ready.notify_all();
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.open = false;
        state.download_mode = false;
        state.stats.closes += 1;
        self.rx_ready.notify_all();
        Ok(())
    }
}

/// Callback recording everything the HAL reports.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<(HalEvent, NfcStatus)>>,
    data: Mutex<Vec<Vec<u8>>>,
}

impl RecordingCallback {
    /// Events received so far.
    pub fn events(&self) -> Vec<(HalEvent, NfcStatus)> {
        lock(&self.events).clone()
    }

    /// Frames received so far.
    pub fn data(&self) -> Vec<Vec<u8>> {
        lock(&self.data).clone()
    }

    /// Number of times `event` was received.
    pub fn count(&self, event: HalEvent) -> usize {
        lock(&self.events).iter().filter(|(e, _)| *e == event).count()
    }

    /// Wait until `event` is received, returning its status.
    pub async fn wait_for_event(&self, event: HalEvent, timeout: Duration) -> Option<NfcStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = lock(&self.events).iter().find(|(e, _)| *e == event).map(|(_, s)| *s);
            if status.is_some() || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until `frame` is received.
    pub async fn wait_for_data(&self, frame: &[u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if lock(&self.data).iter().any(|data| data == frame) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl HalCallback for RecordingCallback {
    fn on_event(&self, event: HalEvent, status: NfcStatus) {
        lock(&self.events).push((event, status));
    }

    fn on_data(&self, data: &[u8]) {
        lock(&self.data).push(data.to_vec());
    }
}
