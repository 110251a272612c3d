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

//! HAL lifecycle against the emulated controller.

use nxp_nci_hal::config::{ConfigFile, ConfigValue, HalConfig};
use nxp_nci_hal::emulator::{DownloadRecord, Emulator, EmulatorOptions, RecordingCallback};
use nxp_nci_hal::ext::{EepromItem, EepromMode, ExtRequest, ExtResponse};
use nxp_nci_hal::firmware::{FirmwareBlob, FirmwareVersion, ImageKind};
use nxp_nci_hal::lifecycle::{
    ChipType, CORE_INIT_MAX_RETRIES, CORE_INIT_SOFT_RETRIES, RF_RECOVERY_MAX,
};
use nxp_nci_hal::nci::{gid, oid, ConfigParamId, NciVersion};
use nxp_nci_hal::transport::ResetMode;
use nxp_nci_hal::{CloseType, HalError, HalEvent, HalStatus, NciHal, NfcStatus};
use std::sync::Arc;
use std::time::Duration;

const CHIP_FIRMWARE: FirmwareVersion = FirmwareVersion { rom: 0x01, major: 0x10, minor: 0x00 };
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// CORE_SET_CONFIG_CMD writing 0x60 to TOTAL_DURATION.
const CORE_CONF: [u8; 7] = [0x20, 0x02, 0x04, 0x01, 0x32, 0x01, 0x60];
/// CORE_SET_CONFIG_CMD writing a proprietary RF parameter.
const RF_BLOCK: [u8; 8] = [0x20, 0x02, 0x05, 0x01, 0xa0, 0x0d, 0x01, 0x55];
const RF_PARAM: ConfigParamId = ConfigParamId(0xa00d);

struct Fixture {
    emulator: Arc<Emulator>,
    hal: Arc<NciHal>,
    callback: Arc<RecordingCallback>,
}

fn fixture(
    options: EmulatorOptions,
    store: ConfigFile,
    firmware: Option<FirmwareBlob>,
    response_timeout: Duration,
) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let emulator = Arc::new(Emulator::new(options));
    let config = HalConfig { response_timeout, ..Default::default() };
    let mut hal = NciHal::new(emulator.clone(), Arc::new(store)).with_config(config);
    if let Some(firmware) = firmware {
        hal = hal.with_firmware(Arc::new(firmware));
    }
    Fixture { emulator, hal: Arc::new(hal), callback: Arc::new(RecordingCallback::default()) }
}

fn default_fixture() -> Fixture {
    fixture(Default::default(), ConfigFile::new(), None, Duration::from_millis(500))
}

impl Fixture {
    async fn open(&self) -> Result<(), HalError> {
        self.hal.open(self.callback.clone()).await
    }

    async fn open_status(&self) -> Option<NfcStatus> {
        self.callback.wait_for_event(HalEvent::OpenCplt, EVENT_TIMEOUT).await
    }

    /// Wait until the emulator received `frame`.
    async fn wait_for_command(&self, frame: &[u8]) -> bool {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.emulator.stats().commands.iter().any(|cmd| &cmd[..] == frame) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[tokio::test]
async fn open_then_write() {
    let fixture = default_fixture();
    fixture.open().await.unwrap();
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Ok));
    assert_eq!(fixture.hal.status(), HalStatus::Open);

    // The response to CORE_RESET and CORE_INIT stay within the HAL.
    assert!(fixture.callback.data().is_empty());

    // NCI 1.x CORE_INIT_CMD layout, rejected by an NCI 2.0 controller.
    assert_eq!(fixture.hal.write(&[0x20, 0x01, 0x00]).await.unwrap(), 3);
    assert!(fixture.callback.wait_for_data(&[0x40, 0x01, 0x01, 0x05], EVENT_TIMEOUT).await);
    assert_eq!(fixture.callback.count(HalEvent::OpenCplt), 1);

    fixture.hal.close(CloseType::Disable).await.unwrap();
    assert_eq!(fixture.hal.status(), HalStatus::Closed);
    assert_eq!(fixture.emulator.stats().closes, 1);
}

#[tokio::test]
async fn unsolicited_frames_reach_the_stack() {
    let fixture = default_fixture();
    fixture.open().await.unwrap();

    let ntf = [0x61, 0x05, 0x01, 0x00];
    fixture.emulator.inject(&ntf);
    assert!(fixture.callback.wait_for_data(&ntf, EVENT_TIMEOUT).await);

    fixture.hal.close(CloseType::HostSwitchedOff).await.unwrap();
    assert!(!fixture.emulator.stats().resets.contains(&ResetMode::PowerOff));
}

#[tokio::test]
async fn write_rejects_invalid_frames() {
    let fixture = default_fixture();
    assert!(matches!(fixture.hal.write(&[0x20, 0x00, 0x01, 0x00]).await, Err(HalError::NotOpen)));

    fixture.open().await.unwrap();
    assert!(matches!(fixture.hal.write(&[0x20, 0x00]).await, Err(HalError::InvalidFrame(_))));
    assert!(matches!(fixture.hal.write(&[0u8; 261]).await, Err(HalError::InvalidFrame(_))));
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn open_failure_sends_no_event() {
    let fixture = fixture(
        EmulatorOptions { fail_open: true, ..Default::default() },
        ConfigFile::new(),
        None,
        Duration::from_millis(500),
    );
    assert!(fixture.open().await.is_err());
    assert!(fixture.callback.events().is_empty());
    assert_eq!(fixture.hal.status(), HalStatus::Closed);
}

#[tokio::test]
async fn close_while_closed_fails() {
    let fixture = default_fixture();
    assert!(matches!(fixture.hal.close(CloseType::Disable).await, Err(HalError::Failed)));
    let stats = fixture.emulator.stats();
    assert_eq!(stats.opens, 0);
    assert_eq!(stats.closes, 0);
    assert!(fixture.callback.events().is_empty());

    fixture.open().await.unwrap();
    fixture.hal.close(CloseType::Disable).await.unwrap();
    assert!(matches!(fixture.hal.close(CloseType::Disable).await, Err(HalError::Failed)));
    assert_eq!(fixture.emulator.stats().closes, 1);
}

#[tokio::test]
async fn up_to_date_firmware_is_not_downloaded() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new(),
        Some(FirmwareBlob::new(CHIP_FIRMWARE, &[0x5a; 600])),
        Duration::from_millis(500),
    );

    for _ in 0..3 {
        fixture.open().await.unwrap();
        fixture.hal.core_initialized(&[]).await.unwrap();
        fixture.hal.close(CloseType::Disable).await.unwrap();
    }

    let stats = fixture.emulator.stats();
    assert!(stats.downloads.is_empty());
    assert!(!stats.resets.contains(&ResetMode::FirmwareDownload));
    assert_eq!(stats.opens, 3);
    assert_eq!(stats.closes, 3);
    assert_eq!(fixture.callback.count(HalEvent::OpenCplt), 3);
    assert_eq!(fixture.callback.count(HalEvent::CloseCplt), 3);
}

#[tokio::test]
async fn outdated_firmware_is_updated_once() {
    let image = FirmwareVersion { minor: 0x02, ..CHIP_FIRMWARE };
    let fixture = fixture(
        Default::default(),
        ConfigFile::new(),
        Some(FirmwareBlob::new(image, &[0x5a; 600])),
        Duration::from_millis(500),
    );

    fixture.open().await.unwrap();
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Ok));
    assert_eq!(fixture.emulator.firmware_version(), image);
    assert_eq!(
        fixture.emulator.stats().downloads,
        vec![DownloadRecord { kind: ImageKind::Real, version: image }]
    );
    fixture.hal.close(CloseType::Disable).await.unwrap();

    fixture.open().await.unwrap();
    assert_eq!(fixture.emulator.stats().downloads.len(), 1);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn failed_update_of_compatible_firmware_continues() {
    let image = FirmwareVersion { major: 0x11, ..CHIP_FIRMWARE };
    let fixture = fixture(
        EmulatorOptions { fail_downloads: true, ..Default::default() },
        ConfigFile::new(),
        Some(FirmwareBlob::new(image, &[0x5a; 100])),
        Duration::from_millis(500),
    );

    fixture.open().await.unwrap();
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Ok));
    assert_eq!(fixture.emulator.firmware_version(), CHIP_FIRMWARE);
    let resets = fixture.emulator.stats().resets;
    assert_eq!(resets.iter().filter(|mode| **mode == ResetMode::FirmwareDownload).count(), 1);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn failed_update_of_incompatible_firmware_fails_open() {
    let image = FirmwareVersion { rom: 0x02, ..CHIP_FIRMWARE };
    let fixture = fixture(
        EmulatorOptions { fail_downloads: true, ..Default::default() },
        ConfigFile::new(),
        Some(FirmwareBlob::new(image, &[0x5a; 100])),
        Duration::from_millis(500),
    );

    assert!(fixture.open().await.is_err());
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Failed));
    assert_eq!(fixture.hal.status(), HalStatus::Closed);
    assert_eq!(fixture.emulator.stats().closes, 1);
}

#[tokio::test]
async fn init_layout_is_corrected_once() {
    let fixture = fixture(
        EmulatorOptions {
            nci_version: NciVersion::Version20,
            accepts_init_version: Some(NciVersion::Version11),
            ..Default::default()
        },
        ConfigFile::new(),
        None,
        Duration::from_millis(500),
    );

    fixture.open().await.unwrap();
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Ok));

    let stats = fixture.emulator.stats();
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_INIT), 2);
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_RESET), 2);
    let last_init = stats.commands.iter().rev().find(|cmd| cmd[0] == 0x20 && cmd[1] == 0x01);
    assert_eq!(last_init.map(|cmd| &cmd[..]), Some(&[0x20, 0x01, 0x00][..]));

    match fixture.hal.ext_command(ExtRequest::GetConfigInfo).await.unwrap() {
        ExtResponse::ConfigInfo(info) => {
            assert_eq!(info.nci_version, Some(NciVersion::Version11))
        }
        other => panic!("unexpected response {:?}", other),
    }
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn rejected_rf_settings_are_recovered() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new().set("NXP_RF_CONF_BLK_1", ConfigValue::Bytes(RF_BLOCK.to_vec())),
        Some(FirmwareBlob::new(CHIP_FIRMWARE, &[0x5a; 100]).with_dummy(&[0xa5; 50])),
        Duration::from_millis(500),
    );
    fixture.open().await.unwrap();
    fixture.emulator.update_options(|options| {
        options.rejected_params.insert(RF_PARAM, 1);
    });

    fixture.hal.core_initialized(&[]).await.unwrap();
    assert_eq!(
        fixture.callback.wait_for_event(HalEvent::PostInitCplt, EVENT_TIMEOUT).await,
        Some(NfcStatus::Ok)
    );
    let kinds: Vec<_> =
        fixture.emulator.stats().downloads.iter().map(|record| record.kind).collect();
    assert_eq!(kinds, vec![ImageKind::Dummy, ImageKind::Real]);
    assert_eq!(fixture.emulator.config_parameter(RF_PARAM), Some(vec![0x55]));
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn persistently_rejected_rf_settings_fail_post_init() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new().set("NXP_RF_CONF_BLK_1", ConfigValue::Bytes(RF_BLOCK.to_vec())),
        Some(FirmwareBlob::new(CHIP_FIRMWARE, &[0x5a; 100]).with_dummy(&[0xa5; 50])),
        Duration::from_millis(500),
    );
    fixture.open().await.unwrap();
    fixture.emulator.update_options(|options| {
        options.rejected_params.insert(RF_PARAM, u32::MAX);
    });

    assert!(fixture.hal.core_initialized(&[]).await.is_err());
    assert_eq!(
        fixture.callback.wait_for_event(HalEvent::PostInitCplt, EVENT_TIMEOUT).await,
        Some(NfcStatus::Failed)
    );
    let downloads = fixture.emulator.stats().downloads;
    assert_eq!(downloads.len(), 2 * RF_RECOVERY_MAX as usize);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn cached_configuration_is_not_rewritten() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new().set("NXP_CORE_CONF", ConfigValue::Bytes(CORE_CONF.to_vec())),
        None,
        Duration::from_millis(500),
    );
    fixture.open().await.unwrap();

    fixture.hal.core_initialized(&[]).await.unwrap();
    let stats = fixture.emulator.stats();
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_SET_CONFIG), 1);
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_GET_CONFIG), 1);
    let resets = stats.count_commands(gid::CORE, oid::CORE_RESET);

    fixture.hal.core_initialized(&[]).await.unwrap();
    let stats = fixture.emulator.stats();
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_SET_CONFIG), 1);
    // Nothing written, no re-initialization.
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_RESET), resets);
    assert_eq!(fixture.callback.count(HalEvent::PostInitCplt), 2);

    // A factory reset invalidates the cache.
    fixture.hal.factory_reset().await.unwrap();
    fixture.hal.core_initialized(&[]).await.unwrap();
    let stats = fixture.emulator.stats();
    assert_eq!(stats.count_commands(gid::CORE, oid::CORE_SET_CONFIG), 2);
    assert_eq!(fixture.emulator.config_parameter(ConfigParamId(0x32)), Some(vec![0x60]));
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn extension_commands() {
    let fixture = default_fixture();
    assert!(matches!(
        fixture.hal.ext_command(ExtRequest::GetFeatureList).await,
        Err(HalError::NotOpen)
    ));
    fixture.open().await.unwrap();

    match fixture.hal.ext_command(ExtRequest::GetFeatureList).await.unwrap() {
        ExtResponse::FeatureList(features) => {
            assert_eq!(features.chip_type, ChipType::Pn553);
            assert!(features.nci_20);
        }
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(
        fixture.hal.ext_command(ExtRequest::CheckFlashRequired).await.unwrap(),
        ExtResponse::FlashRequired(false)
    );

    let value = fixture
        .hal
        .request_eeprom(EepromItem::PowerTrackerEnable, EepromMode::Set, &[0x01])
        .await
        .unwrap();
    assert_eq!(value, vec![0x01]);
    assert_eq!(fixture.emulator.config_parameter(ConfigParamId(0xa0f2)), Some(vec![0x01]));
    let value = fixture
        .hal
        .request_eeprom(EepromItem::PowerTrackerEnable, EepromMode::Get, &[])
        .await
        .unwrap();
    assert_eq!(value, vec![0x01]);
    assert!(matches!(
        fixture.hal.request_eeprom(EepromItem::FlashUpdateDone, EepromMode::Get, &[]).await,
        Err(HalError::Status(_))
    ));

    match fixture.hal.ext_command(ExtRequest::Transceive(vec![0x2f, 0x02, 0x00])).await.unwrap() {
        ExtResponse::Transceived(rsp) => assert_eq!(&rsp[..], &[0x4f, 0x02, 0x01, 0x00]),
        other => panic!("unexpected response {:?}", other),
    }
    // Responses to extension commands stay within the HAL.
    assert!(fixture.callback.data().is_empty());
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn requests_are_refused_during_bringup() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new().set("NXP_CORE_CONF", ConfigValue::Bytes(CORE_CONF.to_vec())),
        None,
        Duration::from_millis(100),
    );
    fixture.open().await.unwrap();
    fixture.emulator.update_options(|options| options.silent = true);

    let hal = fixture.hal.clone();
    let post_init = tokio::spawn(async move { hal.core_initialized(&[]).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(
        fixture.hal.ext_command(ExtRequest::GetConfigInfo).await,
        Err(HalError::BringupInProgress)
    ));
    assert!(matches!(
        fixture.hal.write(&[0x20, 0x00, 0x01, 0x00]).await,
        Err(HalError::BringupInProgress)
    ));

    assert!(post_init.await.unwrap().is_err());
    assert_eq!(
        fixture.callback.wait_for_event(HalEvent::PostInitCplt, EVENT_TIMEOUT).await,
        Some(NfcStatus::ErrCmdTimeout)
    );
    fixture.emulator.update_options(|options| options.silent = false);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn power_cycle_and_pre_discover() {
    let fixture = fixture(
        Default::default(),
        ConfigFile::new().set("DEFAULT_ROUTE", ConfigValue::Num(0x02)),
        None,
        Duration::from_millis(500),
    );
    assert!(matches!(fixture.hal.power_cycle().await, Err(HalError::NotOpen)));
    assert!(matches!(fixture.hal.pre_discover().await, Err(HalError::NotOpen)));
    assert_eq!(fixture.hal.get_config().default_route, 0x02);

    fixture.open().await.unwrap();
    fixture.hal.pre_discover().await.unwrap();
    assert_eq!(
        fixture.callback.wait_for_event(HalEvent::PreDiscoverCplt, EVENT_TIMEOUT).await,
        Some(NfcStatus::Ok)
    );

    fixture.hal.power_cycle().await.unwrap();
    assert!(fixture.emulator.stats().resets.contains(&ResetMode::PowerCycle));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.callback.count(HalEvent::OpenCplt), 2);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn unresponsive_controller_fails_open_after_bounded_retries() {
    let fixture = fixture(
        EmulatorOptions { silent: true, ..Default::default() },
        ConfigFile::new(),
        None,
        Duration::from_millis(100),
    );

    assert!(matches!(fixture.open().await, Err(HalError::ResponseTimeout(_))));
    assert_eq!(fixture.open_status().await, Some(NfcStatus::ErrCmdTimeout));
    assert_eq!(fixture.hal.status(), HalStatus::Closed);

    let stats = fixture.emulator.stats();
    assert_eq!(
        stats.count_commands(gid::CORE, oid::CORE_RESET),
        CORE_INIT_MAX_RETRIES as usize + 1
    );
    let power_cycles = stats.resets.iter().filter(|mode| **mode == ResetMode::PowerCycle).count();
    assert_eq!(power_cycles, (CORE_INIT_MAX_RETRIES - CORE_INIT_SOFT_RETRIES) as usize);
}

#[tokio::test]
async fn stack_command_holds_off_extension_commands() {
    let fixture = default_fixture();
    fixture.open().await.unwrap();
    fixture.emulator.update_options(|options| options.silent = true);

    assert_eq!(fixture.hal.write(&[0x20, 0x01, 0x00]).await.unwrap(), 3);
    let hal = fixture.hal.clone();
    let ext = tokio::spawn(async move {
        hal.ext_command(ExtRequest::Transceive(vec![0x2f, 0x02, 0x00])).await
    });

    // Not written before the stack command is answered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fixture.emulator.stats().commands.iter().any(|cmd| &cmd[..] == [0x2f, 0x02, 0x00]));

    fixture.emulator.inject(&[0x40, 0x01, 0x01, 0x05]);
    assert!(fixture.callback.wait_for_data(&[0x40, 0x01, 0x01, 0x05], EVENT_TIMEOUT).await);
    assert!(fixture.wait_for_command(&[0x2f, 0x02, 0x00]).await);

    fixture.emulator.inject(&[0x4f, 0x02, 0x01, 0x00]);
    match ext.await.unwrap().unwrap() {
        ExtResponse::Transceived(rsp) => assert_eq!(&rsp[..], &[0x4f, 0x02, 0x01, 0x00]),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(fixture.callback.data(), vec![vec![0x40, 0x01, 0x01, 0x05]]);

    fixture.emulator.update_options(|options| options.silent = false);
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn concurrent_eeprom_requests_are_serialized() {
    let fixture = default_fixture();
    fixture.open().await.unwrap();

    let tracker = ConfigParamId(0xa0f3);
    let (first, second) = tokio::join!(
        fixture.hal.request_eeprom(EepromItem::PowerTrackerEnable, EepromMode::Set, &[0x01]),
        fixture.hal.request_eeprom(EepromItem::Raw(tracker), EepromMode::Set, &[0x02]),
    );
    assert_eq!(first.unwrap(), vec![0x01]);
    assert_eq!(second.unwrap(), vec![0x02]);
    assert_eq!(fixture.emulator.config_parameter(ConfigParamId(0xa0f2)), Some(vec![0x01]));
    assert_eq!(fixture.emulator.config_parameter(tracker), Some(vec![0x02]));
    fixture.hal.close(CloseType::Disable).await.unwrap();
}

#[tokio::test]
async fn triggered_download_refreshes_chip_identity() {
    let image = FirmwareVersion { major: 0x11, ..CHIP_FIRMWARE };
    let fixture = fixture(
        EmulatorOptions { fail_downloads: true, ..Default::default() },
        ConfigFile::new(),
        Some(FirmwareBlob::new(image, &[0x5a; 600])),
        Duration::from_millis(500),
    );
    fixture.open().await.unwrap();
    assert_eq!(fixture.open_status().await, Some(NfcStatus::Ok));
    assert_eq!(
        fixture.hal.ext_command(ExtRequest::CheckFlashRequired).await.unwrap(),
        ExtResponse::FlashRequired(true)
    );

    fixture.emulator.update_options(|options| options.fail_downloads = false);
    assert_eq!(
        fixture.hal.ext_command(ExtRequest::TriggerFirmwareDownload).await.unwrap(),
        ExtResponse::Completed
    );
    assert_eq!(fixture.emulator.firmware_version(), image);

    assert_eq!(
        fixture.hal.ext_command(ExtRequest::CheckFlashRequired).await.unwrap(),
        ExtResponse::FlashRequired(false)
    );
    match fixture.hal.ext_command(ExtRequest::GetConfigInfo).await.unwrap() {
        ExtResponse::ConfigInfo(info) => assert_eq!(info.chip.map(|chip| chip.firmware), Some(image)),
        other => panic!("unexpected response {:?}", other),
    }
    fixture.hal.close(CloseType::Disable).await.unwrap();
}
