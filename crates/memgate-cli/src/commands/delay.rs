use std::io::Write;

use anyhow::Result;
use memgate::Device;

pub fn run(device: &Device, offset: i32, out: &mut impl Write) -> Result<()> {
    device.set_injection_delay(offset)?;
    writeln!(out, "Injection delay set to {}", offset)?;
    Ok(())
}
