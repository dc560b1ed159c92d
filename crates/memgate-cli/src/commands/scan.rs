use std::io::Write;
use std::time::Instant;

use anyhow::Result;
use memgate::{Device, Scanner, Signature};
use tracing::info;

use super::hex_utils::format_hex_address;

/// Scan a live process and print each hit, lowest address first.
pub fn run(
    device: &Device,
    scanner: &Scanner,
    pid: u64,
    signature: &Signature,
    min: u64,
    max: u64,
    out: &mut impl Write,
) -> Result<()> {
    let start = Instant::now();
    let mut hits = Vec::new();
    scanner.scan_process(device, pid, signature, min, max, |address| {
        hits.push(address)
    })?;
    hits.sort_unstable();
    info!(
        "scanned pid {} for '{}' in {:?}",
        pid,
        signature,
        start.elapsed()
    );

    for address in &hits {
        writeln!(out, "{}", format_hex_address(*address))?;
    }
    writeln!(out, "{} hits", hits.len())?;
    Ok(())
}
