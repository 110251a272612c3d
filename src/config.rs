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

//! HAL configuration.
//!
//! Settings come from a `libnfc-nxp.conf` style file:
//!
//! ```text
//! # comment
//! NXP_NFC_DEV_NODE="/dev/nxpnfc"
//! NXP_EXT_RSP_TIMEOUT_MS=2500
//! NXP_CORE_CONF={20, 02, 05, 01,
//!         32, 01, 60}
//! ```
//!
//! Invalid values never prevent the HAL from starting: they are replaced by
//! their default and a warning is logged.

use crate::error::{HalError, Result};
use crate::nci::{ConfigParam, ConfigParamId};
use crate::transport::TransportConfig;
use log::{debug, warn};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default response timeout of HAL-originated commands.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2500);

const RESPONSE_TIMEOUT_RANGE: RangeInclusive<u64> = 100..=10_000;
const FRAGMENT_SIZE_RANGE: RangeInclusive<u64> = 32..=260;
const CLOCK_FREQUENCY_RANGE: RangeInclusive<u64> = 0..=8;
const TVDD_RANGE: RangeInclusive<u64> = 1..=3;

/// Proprietary parameter selecting the system clock source.
pub const CLOCK_SOURCE_PARAM: ConfigParamId = ConfigParamId(0xa003);
/// Proprietary parameter selecting the PLL input frequency.
pub const CLOCK_FREQUENCY_PARAM: ConfigParamId = ConfigParamId(0xa002);

/// Read access to named configuration values.
pub trait ConfigStore: Send + Sync {
    /// Numeric value of `name`.
    fn num(&self, name: &str) -> Option<u64>;
    /// Byte array value of `name`.
    fn bytes(&self, name: &str) -> Option<Vec<u8>>;
    /// String value of `name`.
    fn string(&self, name: &str) -> Option<String>;
}

/// A configuration value.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ConfigValue {
    Num(u64),
    Bytes(Vec<u8>),
    Str(String),
}

/// Configuration parsed from a file.
#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    values: HashMap<String, ConfigValue>,
}

impl ConfigFile {
    /// Empty configuration: every setting takes its default.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set `name`, replacing any previous value.
    pub fn set(mut self, name: &str, value: ConfigValue) -> Self {
        self.values.insert(name.to_owned(), value);
        self
    }

    /// Load and parse the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| HalError::Config(format!("{}: {}", path.display(), err)))?;
        Ok(ConfigFile::parse(&text))
    }

    /// Parse configuration text. Malformed entries are skipped.
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        let mut lines = text.lines().enumerate();

        while let Some((index, line)) = lines.next() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                warn!("config line {}: expected NAME=value", index + 1);
                continue;
            };
            let name = name.trim();
            let mut value = value.trim().to_owned();

            // Byte arrays may span several lines.
            if value.starts_with('{') {
                while !value.contains('}') {
                    match lines.next() {
                        Some((_, next)) => {
                            value.push(' ');
                            value.push_str(strip_comment(next).trim());
                        }
                        None => break,
                    }
                }
            }

            match parse_value(&value) {
                Some(value) => {
                    values.insert(name.to_owned(), value);
                }
                None => warn!("config line {}: invalid value for {}", index + 1, name),
            }
        }

        debug!("parsed {} configuration entries", values.len());
        ConfigFile { values }
    }
}

impl ConfigStore for ConfigFile {
    fn num(&self, name: &str) -> Option<u64> {
        match self.values.get(name)? {
            ConfigValue::Num(num) => Some(*num),
            _ => None,
        }
    }

    fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        match self.values.get(name)? {
            ConfigValue::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn string(&self, name: &str) -> Option<String> {
        match self.values.get(name)? {
            ConfigValue::Str(string) => Some(string.clone()),
            _ => None,
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (index, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..index],
            _ => (),
        }
    }
    line
}

fn parse_value(value: &str) -> Option<ConfigValue> {
    if let Some(rest) = value.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some(ConfigValue::Str(rest[..end].to_owned()));
    }
    if let Some(rest) = value.strip_prefix('{') {
        let end = rest.find('}')?;
        let bytes = rest[..end]
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|item| !item.is_empty())
            .map(|item| {
                let item = item.trim_start_matches("0x").trim_start_matches("0X");
                u8::from_str_radix(item, 16).ok()
            })
            .collect::<Option<Vec<_>>>()?;
        return Some(ConfigValue::Bytes(bytes));
    }
    let num = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => value.parse().ok()?,
    };
    Some(ConfigValue::Num(num))
}

fn num_in_range(
    store: &dyn ConfigStore,
    name: &str,
    range: RangeInclusive<u64>,
    default: u64,
) -> u64 {
    match store.num(name) {
        Some(value) if range.contains(&value) => value,
        Some(value) => {
            warn!("{}={} out of range {:?}, using {}", name, value, range, default);
            default
        }
        None => default,
    }
}

fn flag(store: &dyn ConfigStore, name: &str) -> bool {
    store.num(name).map_or(false, |value| value != 0)
}

/// Source of the controller system clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockSource {
    /// External crystal.
    Xtal,
    /// Internal PLL fed by the host clock.
    Pll,
}

impl ClockSource {
    fn to_byte(self) -> u8 {
        match self {
            ClockSource::Xtal => 0x01,
            ClockSource::Pll => 0x02,
        }
    }
}

/// System clock settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    #[allow(missing_docs)]
    pub source: ClockSource,
    /// Index of the PLL input frequency.
    pub frequency: u8,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig { source: ClockSource::Pll, frequency: 0 }
    }
}

impl ClockConfig {
    /// Parameters programming the clock.
    pub fn params(&self) -> Vec<ConfigParam> {
        vec![
            ConfigParam { id: CLOCK_SOURCE_PARAM, value: vec![self.source.to_byte()] },
            ConfigParam { id: CLOCK_FREQUENCY_PARAM, value: vec![self.frequency] },
        ]
    }
}

/// Runtime settings of the HAL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HalConfig {
    #[allow(missing_docs)]
    pub transport: TransportConfig,
    /// Shorter delay between write attempts.
    pub transport_improvement: bool,
    /// Time a HAL-originated command waits for its response.
    pub response_timeout: Duration,
    /// Download the bundled firmware on every open.
    pub fw_update_always: bool,
    /// Clock settings, applied when configured.
    pub clock: Option<ClockConfig>,
    /// TVDD configuration block to apply, when configured.
    pub tvdd: Option<u8>,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            transport: Default::default(),
            transport_improvement: false,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            fw_update_always: false,
            clock: None,
            tvdd: None,
        }
    }
}

impl HalConfig {
    /// Read the settings from `store`, replacing invalid values by their
    /// default.
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let defaults = HalConfig::default();

        let device_node = store
            .string("NXP_NFC_DEV_NODE")
            .filter(|node| !node.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.transport.device_node);
        let fragment_size = num_in_range(
            store,
            "NXP_I2C_FRAGMENT_SIZE",
            FRAGMENT_SIZE_RANGE,
            defaults.transport.fragment_size as u64,
        ) as usize;

        let clock_source = match store.num("NXP_SYS_CLK_SRC_SEL") {
            Some(1) => Some(ClockSource::Xtal),
            Some(2) => Some(ClockSource::Pll),
            Some(other) => {
                warn!("NXP_SYS_CLK_SRC_SEL={} is invalid, using PLL", other);
                Some(ClockSource::Pll)
            }
            None => None,
        };
        let clock = match (clock_source, store.num("NXP_SYS_CLK_FREQ_SEL")) {
            (None, None) => None,
            (source, _) => Some(ClockConfig {
                source: source.unwrap_or(ClockSource::Pll),
                frequency: num_in_range(store, "NXP_SYS_CLK_FREQ_SEL", CLOCK_FREQUENCY_RANGE, 0)
                    as u8,
            }),
        };

        let tvdd = store
            .num("NXP_EXT_TVDD_CFG")
            .map(|_| num_in_range(store, "NXP_EXT_TVDD_CFG", TVDD_RANGE, 1) as u8);

        HalConfig {
            transport: TransportConfig {
                device_node,
                fragment_size,
                download_fragment_size: defaults.transport.download_fragment_size,
                fragmentation: flag(store, "NXP_I2C_FRAGMENTATION_ENABLED"),
            },
            transport_improvement: flag(store, "NXP_TRANSPORT_IMPROVEMENT"),
            response_timeout: Duration::from_millis(num_in_range(
                store,
                "NXP_EXT_RSP_TIMEOUT_MS",
                RESPONSE_TIMEOUT_RANGE,
                DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            )),
            fw_update_always: flag(store, "NXP_FW_UPDATE_ALWAYS"),
            clock,
            tvdd,
        }
    }

    /// Delay between two write attempts.
    pub fn write_retry_delay(&self) -> Duration {
        if self.transport_improvement {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(5)
        }
    }
}

/// Settings reported to the NFC stack.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct NfcConfig {
    pub nfa_poll_bail_out_mode: bool,
    pub max_iso_dep_transceive_length: u32,
    pub default_off_host_route: u8,
    pub default_off_host_route_felica: u8,
    pub default_system_code_route: u8,
    pub default_system_code_power_state: u8,
    pub default_route: u8,
    pub off_host_sim_pipe_id: u8,
    pub off_host_route_uicc: Vec<u8>,
    pub off_host_route_ese: Vec<u8>,
    pub default_iso_dep_route: u8,
    pub presence_check_algorithm: u8,
}

impl Default for NfcConfig {
    fn default() -> Self {
        NfcConfig {
            nfa_poll_bail_out_mode: true,
            max_iso_dep_transceive_length: 0xfeff,
            default_off_host_route: 0x81,
            default_off_host_route_felica: 0x81,
            default_system_code_route: 0x00,
            default_system_code_power_state: 0x3b,
            default_route: 0x00,
            off_host_sim_pipe_id: 0x0a,
            off_host_route_uicc: vec![0x81],
            off_host_route_ese: vec![0x81],
            default_iso_dep_route: 0x81,
            presence_check_algorithm: 0x00,
        }
    }
}

impl NfcConfig {
    /// Read the settings from `store`, missing ones take their default.
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let defaults = NfcConfig::default();
        let byte = |name: &str, default: u8| -> u8 {
            match store.num(name) {
                Some(value) if value <= u8::MAX as u64 => value as u8,
                Some(value) => {
                    warn!("{}={:#x} does not fit a byte, using {:#04x}", name, value, default);
                    default
                }
                None => default,
            }
        };

        NfcConfig {
            nfa_poll_bail_out_mode: store
                .num("NFA_POLL_BAIL_OUT_MODE")
                .map_or(defaults.nfa_poll_bail_out_mode, |value| value != 0),
            max_iso_dep_transceive_length: store
                .num("ISO_DEP_MAX_TRANSCEIVE")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(defaults.max_iso_dep_transceive_length),
            default_off_host_route: byte("DEFAULT_OFFHOST_ROUTE", defaults.default_off_host_route),
            default_off_host_route_felica: byte(
                "DEFAULT_NFC_F_ROUTE",
                defaults.default_off_host_route_felica,
            ),
            default_system_code_route: byte(
                "DEFAULT_SYS_CODE_ROUTE",
                defaults.default_system_code_route,
            ),
            default_system_code_power_state: byte(
                "DEFAULT_SYS_CODE_PWR_STATE",
                defaults.default_system_code_power_state,
            ),
            default_route: byte("DEFAULT_ROUTE", defaults.default_route),
            off_host_sim_pipe_id: byte("OFF_HOST_SIM_PIPE_ID", defaults.off_host_sim_pipe_id),
            off_host_route_uicc: store
                .bytes("OFFHOST_ROUTE_UICC")
                .unwrap_or(defaults.off_host_route_uicc),
            off_host_route_ese: store
                .bytes("OFFHOST_ROUTE_ESE")
                .unwrap_or(defaults.off_host_route_ese),
            default_iso_dep_route: byte("DEFAULT_ISODEP_ROUTE", defaults.default_iso_dep_route),
            presence_check_algorithm: byte(
                "PRESENCE_CHECK_ALGORITHM",
                defaults.presence_check_algorithm,
            ),
        }
    }
}
