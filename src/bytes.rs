//! Byte quantities with a display unit.
//!
//! Tor reports bandwidth in bytes (BW events, `traffic/read`) and kilobytes
//! (network-status `w` lines). [`Bytes`] carries a value together with one of
//! five magnitudes and converts between them in steps of 1024.
//!
//! Every step rounds to four decimal places (ties to even), so a conversion
//! across several units is *not* the same as one multiplication by a power of
//! 1024. Callers comparing against reference values rely on this.

use std::fmt;

/// Magnitude of a [`Bytes`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ByteUnit {
    /// Bytes.
    #[default]
    B = 0,
    /// Kilobytes (1024 B).
    KB = 1,
    /// Megabytes.
    MB = 2,
    /// Gigabytes.
    GB = 3,
    /// Terabytes; [`Bytes::normalize`] never goes past this.
    TB = 4,
}

impl ByteUnit {
    fn index(self) -> u8 {
        self as u8
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => ByteUnit::B,
            1 => ByteUnit::KB,
            2 => ByteUnit::MB,
            3 => ByteUnit::GB,
            _ => ByteUnit::TB,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ByteUnit::B => "bytes",
            ByteUnit::KB => "KBytes",
            ByteUnit::MB => "MBytes",
            ByteUnit::GB => "GBytes",
            ByteUnit::TB => "TBytes",
        }
    }
}

/// A byte quantity expressed in a particular unit.
///
/// # Example
///
/// ```rust
/// use torctl_rs::{ByteUnit, Bytes};
///
/// let b = Bytes::new(1536.0, ByteUnit::B).normalize();
/// assert_eq!(b, Bytes::new(1.5, ByteUnit::KB));
/// assert_eq!(b.to_string(), "2 KBytes");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bytes {
    /// Numeric value in `unit`.
    pub value: f64,
    /// Unit of `value`.
    pub unit: ByteUnit,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round_ties_even() / 10_000.0
}

impl Bytes {
    /// Creates a quantity.
    pub fn new(value: f64, unit: ByteUnit) -> Self {
        Self { value, unit }
    }

    /// Creates a quantity in bytes.
    pub fn from_bytes(value: f64) -> Self {
        Self::new(value, ByteUnit::B)
    }

    /// Moves to the largest unit in which the magnitude stays at or above 1.
    ///
    /// Values already in TB and zero values are returned unchanged. The sign
    /// is carried through.
    pub fn normalize(self) -> Self {
        if self.unit == ByteUnit::TB || self.value == 0.0 {
            return self;
        }

        let max = ByteUnit::TB.index();
        let mut unit = self.unit.index();
        let mut absolute = self.value.abs();

        while absolute >= 1024.0 && unit < max {
            absolute = round4(absolute / 1024.0);
            unit += 1;
        }

        if self.value < 0.0 {
            absolute = -absolute;
        }
        Self::new(absolute, ByteUnit::from_index(unit))
    }

    /// Converts to `unit`, rounding at every 1024 step.
    pub fn to_unit(self, unit: ByteUnit) -> Self {
        if self.unit == unit {
            return self;
        }
        if self.value == 0.0 {
            return Self::new(0.0, unit);
        }

        let mut from = self.unit.index();
        let to = unit.index();
        let mut absolute = self.value.abs();

        while from > to {
            absolute = round4(absolute * 1024.0);
            from -= 1;
        }
        while from < to {
            absolute = round4(absolute / 1024.0);
            from += 1;
        }

        if self.value < 0.0 {
            absolute = -absolute;
        }
        Self::new(absolute, unit)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value.round_ties_even() as i64, self.unit.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            Bytes::new(1536.0, ByteUnit::B).normalize(),
            Bytes::new(1.5, ByteUnit::KB)
        );
        assert_eq!(
            Bytes::new(0.0, ByteUnit::B).normalize(),
            Bytes::new(0.0, ByteUnit::B)
        );
        assert_eq!(
            Bytes::new(1.0, ByteUnit::TB).normalize(),
            Bytes::new(1.0, ByteUnit::TB)
        );
        assert_eq!(
            Bytes::new(2048.0, ByteUnit::GB).normalize(),
            Bytes::new(2.0, ByteUnit::TB)
        );
        assert_eq!(
            Bytes::new(5.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0, ByteUnit::B).normalize(),
            Bytes::new(1024.0 * 5.0, ByteUnit::TB)
        );
    }

    #[test]
    fn test_normalize_keeps_sign() {
        assert_eq!(
            Bytes::new(-3072.0, ByteUnit::KB).normalize(),
            Bytes::new(-3.0, ByteUnit::MB)
        );
    }

    #[test]
    fn test_normalize_rounds_each_step() {
        // 1000 / 1024 = 0.9765625 stays in B because it never reaches 1024.
        assert_eq!(
            Bytes::new(1000.0, ByteUnit::B).normalize(),
            Bytes::new(1000.0, ByteUnit::B)
        );
        // 1_500_000 / 1024 = 1464.84375 -> 1464.8438, / 1024 = 1.43051... -> 1.4305
        assert_eq!(
            Bytes::new(1_500_000.0, ByteUnit::B).normalize(),
            Bytes::new(1.4305, ByteUnit::MB)
        );
    }

    #[test]
    fn test_to_unit() {
        assert_eq!(
            Bytes::new(1.0, ByteUnit::KB).to_unit(ByteUnit::B),
            Bytes::new(1024.0, ByteUnit::B)
        );
        assert_eq!(
            Bytes::new(1024.0, ByteUnit::B).to_unit(ByteUnit::KB),
            Bytes::new(1.0, ByteUnit::KB)
        );
        assert_eq!(
            Bytes::new(1.0, ByteUnit::GB).to_unit(ByteUnit::KB),
            Bytes::new(1_048_576.0, ByteUnit::KB)
        );
        assert_eq!(
            Bytes::new(0.0, ByteUnit::MB).to_unit(ByteUnit::B),
            Bytes::new(0.0, ByteUnit::B)
        );
        assert_eq!(
            Bytes::new(-2.0, ByteUnit::KB).to_unit(ByteUnit::B),
            Bytes::new(-2048.0, ByteUnit::B)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Bytes::new(512.0, ByteUnit::B).to_string(), "512 bytes");
        assert_eq!(Bytes::new(1.5, ByteUnit::KB).to_string(), "2 KBytes");
        assert_eq!(Bytes::new(2.5, ByteUnit::MB).to_string(), "2 MBytes");
        assert_eq!(Bytes::new(3.0, ByteUnit::TB).to_string(), "3 TBytes");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn exact_multiples_round_trip(n in 1u32..100_000, steps in 1u8..4) {
            let unit = ByteUnit::from_index(steps);
            let start = Bytes::new(f64::from(n), unit);
            let down = start.to_unit(ByteUnit::B);
            prop_assert_eq!(down.to_unit(unit), start);
        }

        #[test]
        fn normalize_is_idempotent(value in 0.0f64..1e15) {
            let once = Bytes::from_bytes(value).normalize();
            prop_assert_eq!(once.normalize(), once);
        }

        #[test]
        fn normalized_magnitude_below_1024_unless_tb(value in 1.0f64..1e18) {
            let b = Bytes::from_bytes(value).normalize();
            prop_assert!(b.value.abs() < 1024.0 || b.unit == ByteUnit::TB);
        }
    }
}
