//! CLI command implementations.
//!
//! Each command takes an open [`Device`] and writes its report to `out`.

pub mod delay;
pub mod events;
pub mod hex_utils;
pub mod read;
pub mod regions;
pub mod scan;
pub mod version;
pub mod write;

use anyhow::Result;
use memgate::Device;

use crate::config::Config;

/// Open the control channel.
///
/// With `local` the service runs inside this process on top of the Win32
/// process APIs. Otherwise the control device is opened, loading the service
/// first when a loader is configured.
#[cfg(target_os = "windows")]
pub fn open_device(config: &Config, reload: bool, local: bool) -> Result<Device> {
    use std::sync::Arc;

    use anyhow::bail;
    use memgate::{CommandLoader, DeviceConnector, LocalConnector};
    use memgate_service::{ControlService, WindowsHost};
    use tracing::{debug, warn};

    if local {
        if reload {
            warn!("--reload is ignored for an in-process service");
        }
        let service = Arc::new(ControlService::new(WindowsHost::new()));
        return Ok(Device::create(&LocalConnector::new(service))?);
    }

    match &config.loader {
        Some(loader) => {
            let loader = CommandLoader::new(&loader.program).args(&loader.args);
            Ok(memgate::connect(&DeviceConnector, &loader, reload)?)
        }
        None if reload => bail!("--reload needs a [loader] section in the config"),
        None => {
            debug!("no loader configured, opening device directly");
            Ok(Device::create(&DeviceConnector)?)
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub fn open_device(_config: &Config, _reload: bool, _local: bool) -> Result<Device> {
    anyhow::bail!("The memgate control device is only available on Windows")
}
