//! Hex parsing and formatting helpers.

use std::fmt::Write;

use anyhow::{Result, bail};

/// Parse a hex address, with or without a 0x prefix.
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid hex address: {}", e))
}

pub fn format_hex_address(addr: u64) -> String {
    format!("0x{:X}", addr)
}

/// Parse whitespace-separated hex bytes such as `"DE AD BE EF"`.
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let bytes = s
        .split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16)
                .map_err(|e| anyhow::anyhow!("Invalid hex byte '{}': {}", token, e))
        })
        .collect::<Result<Vec<u8>>>()?;
    if bytes.is_empty() {
        bail!("No bytes given");
    }
    Ok(bytes)
}

/// Render `bytes` in hexdump format, 16 bytes per line.
///
/// ```text
/// 0x00400000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
/// ```
pub fn hexdump(address: u64, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!("0x{:08X}: ", address + (i * 16) as u64);
            for j in 0..16 {
                if j == 8 {
                    line.push(' ');
                }
                match chunk.get(j) {
                    Some(byte) => {
                        let _ = write!(line, "{:02X} ", byte);
                    }
                    None => line.push_str("   "),
                }
            }
            line.push_str(" |");
            for byte in chunk {
                line.push(if (0x20..0x7F).contains(byte) {
                    *byte as char
                } else {
                    '.'
                });
            }
            for _ in chunk.len()..16 {
                line.push(' ');
            }
            line.push('|');
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_address() {
        assert_eq!(parse_hex_address("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address("DEADBEEF").unwrap(), 0xDEADBEEF);
        assert!(parse_hex_address("0xZZZ").is_err());
    }

    #[test]
    fn test_format_hex_address() {
        assert_eq!(format_hex_address(0x1000), "0x1000");
        assert_eq!(format_hex_address(0), "0x0");
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("DE ad 00").unwrap(), vec![0xDE, 0xAD, 0x00]);
        assert!(parse_hex_bytes("").is_err());
        assert!(parse_hex_bytes("DEAD").is_err());
    }

    #[test]
    fn test_hexdump_layout() {
        let lines = hexdump(0x40_0000, b"Hello World\0\0\0\0\0AB");
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "0x00400000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|"
        );
        assert!(lines[1].starts_with("0x00400010: 41 42 "));
        assert!(lines[1].ends_with("|AB              |"));
    }
}
