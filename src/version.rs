//! Tor release numbers.
//!
//! Tor reports its version as `major.minor.micro.patch` optionally followed by
//! a status tag (`0.4.8.10 (git-...)`, `0.4.9.1-alpha`). [`TorVersion`] keeps
//! the four numeric components and orders them lexicographically.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A four-component Tor version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TorVersion {
    /// Major release.
    pub major: u32,
    /// Minor release.
    pub minor: u32,
    /// Micro release.
    pub micro: u32,
    /// Patch level.
    pub patch: u32,
}

impl TorVersion {
    /// Creates a version from its components.
    pub const fn new(major: u32, minor: u32, micro: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            patch,
        }
    }

    /// Returns true for the all-zero version used when Tor did not report one.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Finds the first `a.b.c.d` run of digits in free text.
    ///
    /// Returns `None` when the text contains no four-component number.
    ///
    /// ```rust
    /// use torctl_rs::TorVersion;
    ///
    /// let v = TorVersion::extract("Tor 0.4.8.10 (git-a1b2c3)").unwrap();
    /// assert_eq!(v, TorVersion::new(0, 4, 8, 10));
    /// ```
    pub fn extract(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if !bytes[start].is_ascii_digit() || (start > 0 && bytes[start - 1].is_ascii_digit()) {
                start += 1;
                continue;
            }
            let run_end = text[start..]
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .map_or(text.len(), |offset| start + offset);
            let parts: Vec<&str> = text[start..run_end].split('.').collect();
            if parts.len() >= 4 && parts[..4].iter().all(|p| !p.is_empty()) {
                if let Ok(version) = parts[..4].join(".").parse() {
                    return Some(version);
                }
            }
            start = run_end.max(start + 1);
        }
        None
    }
}

impl FromStr for TorVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            return Err(Error::Protocol(format!("invalid tor version: {}", s)));
        }
        let mut numbers = [0u32; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid tor version: {}", s)))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2], numbers[3]))
    }
}

impl fmt::Display for TorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.micro, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: TorVersion = "0.4.8.10".parse().unwrap();
        assert_eq!(v, TorVersion::new(0, 4, 8, 10));
        assert_eq!(v.to_string(), "0.4.8.10");
        assert!("0.4.8".parse::<TorVersion>().is_err());
        assert!("0.4.x.1".parse::<TorVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(TorVersion::new(0, 2, 0, 8) < TorVersion::new(0, 2, 0, 9));
        assert!(TorVersion::new(0, 3, 0, 0) > TorVersion::new(0, 2, 9, 99));
        assert!(TorVersion::default().is_empty());
    }

    #[test]
    fn test_extract_from_free_text() {
        assert_eq!(
            TorVersion::extract("0.4.9.1-alpha"),
            Some(TorVersion::new(0, 4, 9, 1))
        );
        assert_eq!(
            TorVersion::extract("Tor version 10.20.30.40 (git)"),
            Some(TorVersion::new(10, 20, 30, 40))
        );
        assert_eq!(TorVersion::extract("1.2.3 only"), None);
        assert_eq!(TorVersion::extract(""), None);
    }
}
