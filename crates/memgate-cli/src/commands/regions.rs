use std::io::Write;

use anyhow::Result;
use memgate::{Device, RecordRef};
use memgate_proto::RegionDescriptor;
use memgate_proto::records::memory::*;

use super::hex_utils::format_hex_address;

fn kind_name(kind: u32) -> &'static str {
    match kind {
        MEM_PRIVATE => "private",
        MEM_MAPPED => "mapped",
        MEM_IMAGE => "image",
        _ => "-",
    }
}

fn protect_name(protect: u32) -> String {
    let base = match protect & 0xFF {
        PAGE_NOACCESS => "---",
        PAGE_READONLY => "r--",
        PAGE_READWRITE => "rw-",
        PAGE_WRITECOPY => "rc-",
        PAGE_EXECUTE => "--x",
        PAGE_EXECUTE_READ => "r-x",
        PAGE_EXECUTE_READWRITE => "rwx",
        _ => "???",
    };
    if protect & PAGE_GUARD != 0 {
        format!("{}+guard", base)
    } else {
        base.to_string()
    }
}

/// One line per region: base, end, size, protection and type.
pub fn describe(region: &RecordRef<'_, RegionDescriptor>) -> String {
    format!(
        "{:>16} {:>16} {:>12} {:<9} {}",
        format_hex_address(region.base_address),
        format_hex_address(region.end_address()),
        format_hex_address(region.region_size),
        protect_name(region.protect),
        kind_name(region.kind)
    )
}

pub fn run(device: &Device, pid: u64, min: u64, max: u64, out: &mut impl Write) -> Result<()> {
    let regions = device.query_regions(pid, min, max)?;
    writeln!(
        out,
        "{:>16} {:>16} {:>12} {:<9} {}",
        "base", "end", "size", "protect", "type"
    )?;
    let mut total = 0u64;
    for region in &regions {
        writeln!(out, "{}", describe(&region))?;
        total += region.region_size;
    }
    writeln!(
        out,
        "{} regions, {} bytes",
        regions.len(),
        format_hex_address(total)
    )?;
    Ok(())
}
