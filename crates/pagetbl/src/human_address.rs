//! Hexadecimal address formatting.

use core::fmt;

/// Formats an address as uppercase hexadecimal with a `0x` prefix and a `_` between every
/// group of four digits, counted from the right.
///
/// The alternate flag (`{:#}`) pads to the full sixteen digits, which keeps columns of
/// addresses aligned.
///
/// # Examples
///
/// ```
/// use pagetbl::HumanAddress;
///
/// assert_eq!(format!("{}", HumanAddress(0x0)), "0x0");
/// assert_eq!(format!("{}", HumanAddress(0x7F_FFFF)), "0x7F_FFFF");
/// assert_eq!(format!("{}", HumanAddress(0xFFFF_8000_0000_0000)), "0xFFFF_8000_0000_0000");
/// assert_eq!(format!("{:#}", HumanAddress(0x1000)), "0x0000_0000_0000_1000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanAddress(pub u64);

impl From<u64> for HumanAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

        let significant = (u64::BITS - self.0.leading_zeros()).div_ceil(4).max(1);
        let digits = if f.alternate() { 16 } else { significant };

        f.write_str("0x")?;
        for position in (0..digits).rev() {
            let nibble = (self.0 >> (position * 4)) & 0xF;
            write!(f, "{}", DIGITS[nibble as usize] as char)?;
            if position != 0 && position % 4 == 0 {
                f.write_str("_")?;
            }
        }
        Ok(())
    }
}
