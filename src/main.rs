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

//! Bring an NXP controller up and log the NCI traffic until interrupted.

use anyhow::{Context, Result};
use argh::FromArgs;
use log::info;
use nxp_nci_hal::config::{ConfigFile, HalConfig};
use nxp_nci_hal::emulator::{Emulator, EmulatorOptions};
use nxp_nci_hal::firmware::FirmwareBlob;
use nxp_nci_hal::transport::Transport;
use nxp_nci_hal::{CloseType, HalCallback, HalEvent, NciHal, NfcStatus};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(FromArgs, Debug)]
/// NXP NCI HAL.
struct Opt {
    #[argh(option, default = "PathBuf::from(\"/vendor/etc/libnfc-nxp.conf\")")]
    /// configuration file.
    config: PathBuf,
    #[argh(option)]
    /// character device of the controller, overrides the configuration.
    device: Option<PathBuf>,
    #[argh(option)]
    /// firmware package to keep the controller updated with.
    firmware: Option<PathBuf>,
    #[argh(option)]
    /// dummy firmware package used for RF settings recovery.
    dummy_firmware: Option<PathBuf>,
    #[argh(switch)]
    /// run against an emulated controller.
    emulate: bool,
}

/// Logs everything the HAL reports.
struct LogCallback;

impl HalCallback for LogCallback {
    fn on_event(&self, event: HalEvent, status: NfcStatus) {
        info!("event {:?} ({:?})", event, status);
    }

    fn on_data(&self, data: &[u8]) {
        info!("data {:02x?}", data);
    }
}

fn link(opt: &Opt) -> Result<Arc<dyn Transport>> {
    if opt.emulate {
        return Ok(Arc::new(Emulator::new(EmulatorOptions::default())));
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Ok(Arc::new(nxp_nci_hal::i2c::I2cTransport::new()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        anyhow::bail!("no controller transport on this platform, use --emulate")
    }
}

async fn run() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
    );

    let opt: Opt = argh::from_env();
    let store = if opt.emulate && !opt.config.exists() {
        ConfigFile::new()
    } else {
        ConfigFile::load(&opt.config)
            .with_context(|| format!("failed to read {}", opt.config.display()))?
    };
    let store = Arc::new(store);

    let mut config = HalConfig::from_store(&*store);
    if let Some(device) = &opt.device {
        config.transport.device_node = device.clone();
    }

    let mut hal = NciHal::new(link(&opt)?, store).with_config(config);
    if let Some(path) = &opt.firmware {
        let firmware = FirmwareBlob::load(path, opt.dummy_firmware.as_deref())
            .with_context(|| format!("failed to load {}", path.display()))?;
        hal = hal.with_firmware(Arc::new(firmware));
    }

    hal.open(Arc::new(LogCallback)).await.context("open failed")?;
    hal.core_initialized(&[]).await.context("post-init failed")?;
    info!("controller ready, ^C to stop");

    tokio::signal::ctrl_c().await?;
    hal.close(CloseType::Disable).await.context("close failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}
