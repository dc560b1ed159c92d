use std::io::Write;

use anyhow::{Result, bail};
use memgate::Device;

use super::hex_utils::{format_hex_address, hexdump};

/// Read `size` bytes at the end of a pointer chain and print a hexdump.
pub fn run(
    device: &Device,
    pid: u64,
    address: u64,
    offsets: &[u64],
    size: usize,
    out: &mut impl Write,
) -> Result<()> {
    if size == 0 {
        bail!("Size must be greater than zero");
    }
    let mut bytes = vec![0u8; size];
    device.read(pid, address, offsets, &mut bytes)?;

    writeln!(
        out,
        "Hexdump at {} ({} bytes):",
        format_hex_address(address),
        size
    )?;
    for line in hexdump(address, &bytes) {
        writeln!(out, "{}", line)?;
    }
    Ok(())
}
