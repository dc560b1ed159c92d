use std::io::Write;

use anyhow::Result;
use memgate::Device;

use super::hex_utils::format_hex_address;

pub fn run(
    device: &Device,
    pid: u64,
    address: u64,
    offsets: &[u64],
    bytes: &[u8],
    out: &mut impl Write,
) -> Result<()> {
    device.write(pid, address, offsets, bytes)?;
    writeln!(
        out,
        "Wrote {} bytes at {}",
        bytes.len(),
        format_hex_address(address)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;
    use memgate_service::SimRegion;

    #[test]
    fn test_writes_target_memory() {
        let (service, device) = testing::device();
        let host = service.host();
        host.spawn(5, r"C:\t.exe");
        host.map(5, SimRegion::private(0x40_0000, vec![0; 0x1000])).unwrap();

        let mut out = Vec::new();
        run(&device, 5, 0x40_0100, &[], &[0xDE, 0xAD], &mut out).unwrap();
        assert_eq!(host.peek(5, 0x40_0100, 2), Some(vec![0xDE, 0xAD]));
    }

    #[test]
    fn test_unknown_process_fails() {
        let (_service, device) = testing::device();
        let mut out = Vec::new();
        assert!(run(&device, 99, 0x40_0000, &[], &[1], &mut out).is_err());
    }
}
