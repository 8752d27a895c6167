//! Log sequence numbers from the upstream write-ahead log.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CoreError;

/// A Postgres log sequence number.
///
/// Held as the raw 64-bit WAL position and rendered in the upstream's
/// `XXXXXXXX/XXXXXXXX` hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    /// The `0/0` position, used when no resume point is known.
    pub const ZERO: Lsn = Lsn(0);

    /// Wraps a raw 64-bit WAL position.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    /// Returns the raw 64-bit position.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for the `0/0` position.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (upper, lower) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidLsn(s.to_string()))?;
        let upper =
            u32::from_str_radix(upper, 16).map_err(|_| CoreError::InvalidLsn(s.to_string()))?;
        let lower =
            u32::from_str_radix(lower, 16).map_err(|_| CoreError::InvalidLsn(s.to_string()))?;
        Ok(Lsn((u64::from(upper) << 32) | u64::from(lower)))
    }
}

/// Shared replication resume position.
///
/// Written by the replication driver as frames arrive, read by the
/// snapshot worker and by standby status updates. Zero means unknown;
/// the position only moves forward.
#[derive(Debug, Default)]
pub struct Checkpoint(AtomicU64);

impl Checkpoint {
    /// Creates an unknown checkpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the position, never moving it backwards.
    pub fn advance(&self, lsn: Lsn) {
        self.0.fetch_max(lsn.as_u64(), Ordering::AcqRel);
    }

    /// Returns the current position, or `None` before the first advance.
    pub fn get(&self) -> Option<Lsn> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Lsn::new(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_upstream_form() {
        assert_eq!(Lsn::new(0x0000_0001_6B37_7A80).to_string(), "1/6B377A80");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
    }

    #[test]
    fn parse_round_trips() {
        let lsn: Lsn = "1/6B377A80".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x0000_0001_6B37_7A80);
        assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);

        let zero: Lsn = "0/0".parse().unwrap();
        assert!(zero.is_zero());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("nope".parse::<Lsn>().is_err());
        assert!("1-2".parse::<Lsn>().is_err());
        assert!("1/zz".parse::<Lsn>().is_err());
    }

    #[test]
    fn checkpoint_only_moves_forward() {
        let checkpoint = Checkpoint::new();
        assert_eq!(checkpoint.get(), None);

        checkpoint.advance(Lsn::new(100));
        checkpoint.advance(Lsn::new(50));
        assert_eq!(checkpoint.get(), Some(Lsn::new(100)));

        checkpoint.advance(Lsn::new(200));
        assert_eq!(checkpoint.get(), Some(Lsn::new(200)));
    }
}
