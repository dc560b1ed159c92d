use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A byte pattern with a per-nibble mask.
///
/// Text form is whitespace-separated two-character tokens, each character a
/// hex digit or `?`: `"48 8D ?? 4?"`. A lone `?` stands for a whole byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Pattern bytes, already masked.
    pattern: Vec<u8>,
    mask: Vec<u8>,
}

fn nibble(c: char) -> Option<(u8, u8)> {
    if c == '?' {
        return Some((0, 0));
    }
    c.to_digit(16).map(|digit| (digit as u8, 0xF))
}

fn parse_token(token: &str) -> Result<(u8, u8)> {
    if token == "?" {
        return Ok((0, 0));
    }
    let invalid = || Error::InvalidSignature(format!("invalid token '{}'", token));
    let mut chars = token.chars();
    let (Some(high), Some(low), None) = (chars.next(), chars.next(), chars.next()) else {
        return Err(invalid());
    };
    let (high, high_mask) = nibble(high).ok_or_else(invalid)?;
    let (low, low_mask) = nibble(low).ok_or_else(invalid)?;
    Ok((high << 4 | low, high_mask << 4 | low_mask))
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self> {
        let (pattern, mask) = text
            .split_whitespace()
            .map(parse_token)
            .collect::<Result<(Vec<u8>, Vec<u8>)>>()?;
        Self::with_mask(&pattern, &mask)
    }

    /// An exact pattern without wildcards.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::with_mask(bytes, &vec![0xFF; bytes.len()])
    }

    /// A pattern where only the bits set in `mask` are compared.
    pub fn with_mask(bytes: &[u8], mask: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidSignature("pattern is empty".to_string()));
        }
        if bytes.len() != mask.len() {
            return Err(Error::InvalidSignature(format!(
                "pattern has {} bytes but mask has {}",
                bytes.len(),
                mask.len()
            )));
        }
        Ok(Self {
            pattern: bytes.iter().zip(mask).map(|(b, m)| b & m).collect(),
            mask: mask.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    pub fn has_wildcards(&self) -> bool {
        self.mask.iter().any(|&m| m != 0xFF)
    }

    /// Whether the pattern matches `data` starting at `offset`.
    pub fn matches_at(&self, data: &[u8], offset: usize) -> bool {
        let Some(window) = offset
            .checked_add(self.len())
            .and_then(|end| data.get(offset..end))
        else {
            return false;
        };
        window
            .iter()
            .zip(&self.pattern)
            .zip(&self.mask)
            .all(|((byte, pattern), mask)| byte & mask == *pattern)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        for (i, (&byte, &mask)) in self.pattern.iter().zip(&self.mask).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            for shift in [4, 0] {
                let c = if (mask >> shift) & 0xF == 0 {
                    '?'
                } else {
                    HEX[((byte >> shift) & 0xF) as usize] as char
                };
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
