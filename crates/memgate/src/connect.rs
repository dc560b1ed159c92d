//! Opening the control channel and bringing the service up when needed.

use std::process::Command;

use tracing::{info, warn};

use crate::channel::Channel;
use crate::device::Device;
use crate::error::{Error, Result};

/// Opens channels to the control service.
pub trait Connector {
    fn open(&self) -> Result<Box<dyn Channel>>;
}

/// Loads (or reloads) the privileged service.
pub trait DriverLoader {
    fn load(&self) -> Result<()>;
}

/// Connect to the service, loading it if it is missing or stale.
///
/// With `reload` the service is reloaded up front and any later failure is
/// final. Without it, a missing device triggers one load and a version
/// mismatch triggers one reload before the check is repeated.
pub fn connect(connector: &dyn Connector, loader: &dyn DriverLoader, reload: bool) -> Result<Device> {
    if reload {
        info!("reloading service");
        loader.load()?;
    }

    let channel = match connector.open() {
        Ok(channel) => channel,
        Err(e) if e.is_not_found() && !reload => {
            info!("control device not found, loading service");
            loader.load()?;
            connector.open()?
        }
        Err(e) => return Err(e),
    };

    match Device::from_channel(channel) {
        Err(Error::VersionMismatch { expected, actual }) if !reload => {
            warn!(
                "service version {} does not match {}, reloading",
                actual, expected
            );
            loader.load()?;
            Device::create(connector)
        }
        other => other,
    }
}

/// Connects to the control device.
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConnector;

#[cfg(target_os = "windows")]
impl Connector for DeviceConnector {
    fn open(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(crate::channel::DeviceChannel::open()?))
    }
}

/// Runs an external command that installs and starts the service.
///
/// A non-zero exit code is reported as a Win32 error with that value.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    program: String,
    args: Vec<String>,
}

impl CommandLoader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl DriverLoader for CommandLoader {
    fn load(&self) -> Result<()> {
        info!("running loader: {} {}", self.program, self.args.join(" "));
        let status = Command::new(&self.program).args(&self.args).status()?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(Error::dword(code as u32)),
            None => Err(Error::dword(crate::error::win32::ERROR_GEN_FAILURE)),
        }
    }
}

/// A loader for services that cannot be loaded on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoader;

impl DriverLoader for NoLoader {
    fn load(&self) -> Result<()> {
        Err(Error::dword(crate::error::win32::ERROR_NOT_SUPPORTED))
    }
}
