use std::io::Write;

use anyhow::Result;
use memgate::Device;
use memgate_proto::Version;

pub fn run(device: &Device, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Service version: {}", device.version())?;
    writeln!(out, "Client version:  {}", Version::CURRENT)?;
    Ok(())
}
