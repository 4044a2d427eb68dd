//! Binary-prefixed size formatting.

use core::fmt;

/// Formats a byte count with binary prefixes (KiB, MiB, ...).
///
/// Exact multiples print without a fraction; anything else is truncated to two decimals.
/// Sizes in this crate are almost always powers of two, so integer arithmetic is enough.
///
/// # Examples
///
/// ```
/// use pagetbl::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(1 << 30)), "1GiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.50KiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl From<u64> for HumanSize {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        while unit + 1 < UNITS.len() && self.0 >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }

        let shift = 10 * unit;
        let whole = self.0 >> shift;
        let remainder = self.0 - (whole << shift);
        if remainder == 0 {
            return write!(f, "{whole}{}", UNITS[unit]);
        }

        let hundredths = ((u128::from(remainder) * 100) >> shift) as u64;
        write!(f, "{whole}.{hundredths:02}{}", UNITS[unit])
    }
}
