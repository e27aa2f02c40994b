//! Absolute and relative timelock values.
//!
//! Relative locks follow the sequence-number encoding: a raw block count, or a
//! count of 512-second units with bit 22 set. Absolute locks follow the
//! locktime convention: values below 500,000,000 are block heights, values at
//! or above are unix timestamps.

use crate::config::chain::LOCKTIME_THRESHOLD;
use crate::error::{EngineError, EngineResult};
use bitcoin::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flag marking a relative lock as time-based
pub const SEQUENCE_TIME_FLAG: u32 = 1 << 22;

/// Mask of the value bits of a relative lock
pub const SEQUENCE_VALUE_MASK: u32 = 0x0000_ffff;

/// Bit disabling relative-lock semantics of a sequence number
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;

/// Seconds per relative time unit
pub const SEQUENCE_TIME_GRANULARITY: u64 = 512;

/// Relative timelock enforced with CHECKSEQUENCEVERIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelativeLock {
    /// Blocks since the output confirmed
    Blocks(u16),
    /// 512-second units since the output confirmed
    Time(u16),
}

impl RelativeLock {
    pub fn blocks(count: u32) -> EngineResult<Self> {
        match u16::try_from(count) {
            Ok(n) if n > 0 => Ok(RelativeLock::Blocks(n)),
            _ => Err(EngineError::locktime(format!(
                "relative block lock must be 1..=65535, got {}",
                count
            ))),
        }
    }

    /// Time-based lock from minutes, rounded up to whole 512-second units
    pub fn from_minutes(minutes: u64) -> EngineResult<Self> {
        let seconds = minutes.saturating_mul(60);
        let units = seconds.div_ceil(SEQUENCE_TIME_GRANULARITY);
        match u16::try_from(units) {
            Ok(n) if n > 0 => Ok(RelativeLock::Time(n)),
            _ => Err(EngineError::locktime(format!(
                "{} minutes is outside the relative time range of 1..=65535 units",
                minutes
            ))),
        }
    }

    /// Reject values a deserialized template could carry but a constructor would not
    pub fn validate(self) -> EngineResult<()> {
        match self {
            RelativeLock::Blocks(0) | RelativeLock::Time(0) => {
                Err(EngineError::locktime("relative lock of zero units"))
            }
            _ => Ok(()),
        }
    }

    /// The value pushed before CHECKSEQUENCEVERIFY and placed in nSequence
    pub fn to_consensus_u32(self) -> u32 {
        match self {
            RelativeLock::Blocks(n) => n as u32,
            RelativeLock::Time(units) => SEQUENCE_TIME_FLAG | units as u32,
        }
    }

    pub fn to_sequence(self) -> Sequence {
        Sequence(self.to_consensus_u32())
    }

    /// Decode an nSequence value; `None` when relative locking is disabled
    pub fn from_sequence(sequence: u32) -> Option<Self> {
        if sequence & SEQUENCE_DISABLE_FLAG != 0 {
            return None;
        }
        let value = (sequence & SEQUENCE_VALUE_MASK) as u16;
        if sequence & SEQUENCE_TIME_FLAG != 0 {
            Some(RelativeLock::Time(value))
        } else {
            Some(RelativeLock::Blocks(value))
        }
    }

    /// Seconds a time-based lock waits; `None` for block locks
    pub fn seconds(self) -> Option<u64> {
        match self {
            RelativeLock::Blocks(_) => None,
            RelativeLock::Time(units) => Some(units as u64 * SEQUENCE_TIME_GRANULARITY),
        }
    }
}

impl fmt::Display for RelativeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelativeLock::Blocks(n) => write!(f, "{} blocks", n),
            RelativeLock::Time(units) => write!(f, "{} x 512s", units),
        }
    }
}

/// Absolute timelock enforced with CHECKLOCKTIMEVERIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsoluteLock {
    Height(u32),
    Timestamp(u32),
}

impl AbsoluteLock {
    pub fn height(height: u32) -> EngineResult<Self> {
        let lock = AbsoluteLock::Height(height);
        lock.validate()?;
        Ok(lock)
    }

    /// Explicit timestamp mode; sub-threshold values are rejected
    pub fn timestamp(unix_seconds: u32) -> EngineResult<Self> {
        let lock = AbsoluteLock::Timestamp(unix_seconds);
        lock.validate()?;
        Ok(lock)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> EngineResult<Self> {
        let seconds = u32::try_from(at.timestamp())
            .map_err(|_| EngineError::locktime(format!("{} is not representable", at)))?;
        Self::timestamp(seconds)
    }

    /// Interpret a raw locktime using the height/timestamp threshold
    pub fn from_consensus(value: u32) -> Self {
        if value < LOCKTIME_THRESHOLD {
            AbsoluteLock::Height(value)
        } else {
            AbsoluteLock::Timestamp(value)
        }
    }

    pub fn validate(self) -> EngineResult<()> {
        match self {
            AbsoluteLock::Height(0) => Err(EngineError::locktime("block height lock of zero")),
            AbsoluteLock::Height(h) if h >= LOCKTIME_THRESHOLD => Err(EngineError::locktime(
                format!("block height {} is not below {}", h, LOCKTIME_THRESHOLD),
            )),
            AbsoluteLock::Timestamp(t) if t < LOCKTIME_THRESHOLD => Err(EngineError::locktime(
                format!("timestamp {} is below the {} threshold", t, LOCKTIME_THRESHOLD),
            )),
            _ => Ok(()),
        }
    }

    pub fn to_consensus_u32(self) -> u32 {
        match self {
            AbsoluteLock::Height(v) | AbsoluteLock::Timestamp(v) => v,
        }
    }

    pub fn is_same_kind(self, other: AbsoluteLock) -> bool {
        matches!(
            (self, other),
            (AbsoluteLock::Height(_), AbsoluteLock::Height(_))
                | (AbsoluteLock::Timestamp(_), AbsoluteLock::Timestamp(_))
        )
    }

    /// Eligibility instant for timestamp locks
    pub fn as_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            AbsoluteLock::Timestamp(t) => DateTime::from_timestamp(t as i64, 0),
            AbsoluteLock::Height(_) => None,
        }
    }
}

impl fmt::Display for AbsoluteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsoluteLock::Height(h) => write!(f, "height {}", h),
            AbsoluteLock::Timestamp(t) => write!(f, "timestamp {}", t),
        }
    }
}

/// Require a non-empty ladder of valid, same-kind, strictly increasing locks
pub fn ensure_strictly_increasing(locks: &[AbsoluteLock]) -> EngineResult<()> {
    for lock in locks {
        lock.validate()?;
    }
    for pair in locks.windows(2) {
        if !pair[0].is_same_kind(pair[1]) {
            return Err(EngineError::locktime(format!(
                "cannot mix {} and {} in one ladder",
                pair[0], pair[1]
            )));
        }
        if pair[0].to_consensus_u32() >= pair[1].to_consensus_u32() {
            return Err(EngineError::locktime(format!(
                "locktimes must be strictly increasing: {} then {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_block_range() {
        assert_eq!(RelativeLock::blocks(10).unwrap().to_consensus_u32(), 10);
        assert!(RelativeLock::blocks(0).is_err());
        assert!(RelativeLock::blocks(65_535).is_ok());
        assert!(RelativeLock::blocks(65_536).is_err());
    }

    #[test]
    fn test_minutes_round_up_to_units() {
        // 512 seconds is 8.53 minutes; 9 minutes needs two units
        assert_eq!(RelativeLock::from_minutes(1).unwrap(), RelativeLock::Time(1));
        assert_eq!(RelativeLock::from_minutes(8).unwrap(), RelativeLock::Time(1));
        assert_eq!(RelativeLock::from_minutes(9).unwrap(), RelativeLock::Time(2));
        assert_eq!(RelativeLock::from_minutes(128).unwrap(), RelativeLock::Time(15));
        assert!(RelativeLock::from_minutes(0).is_err());
    }

    #[test]
    fn test_time_lock_sets_flag_bit() {
        let lock = RelativeLock::from_minutes(60).unwrap();
        let value = lock.to_consensus_u32();
        assert_ne!(value & SEQUENCE_TIME_FLAG, 0);
        assert_eq!(value & SEQUENCE_VALUE_MASK, 8);
        assert_eq!(RelativeLock::from_sequence(value), Some(lock));
        assert_eq!(RelativeLock::from_sequence(0xffff_ffff), None);
    }

    #[test]
    fn test_absolute_threshold() {
        assert!(AbsoluteLock::height(499_999_999).is_ok());
        assert!(AbsoluteLock::height(500_000_000).is_err());
        assert!(AbsoluteLock::timestamp(1_700_000_000).is_ok());
        assert!(matches!(
            AbsoluteLock::timestamp(800_000),
            Err(EngineError::InvalidLocktime { .. })
        ));
        assert_eq!(
            AbsoluteLock::from_consensus(1_700_000_000),
            AbsoluteLock::Timestamp(1_700_000_000)
        );
    }

    #[test]
    fn test_ladder_ordering() {
        let a = AbsoluteLock::Height(100);
        let b = AbsoluteLock::Height(200);
        assert!(ensure_strictly_increasing(&[a, b]).is_ok());
        assert!(ensure_strictly_increasing(&[b, a]).is_err());
        assert!(ensure_strictly_increasing(&[a, a]).is_err());
        assert!(ensure_strictly_increasing(&[a, AbsoluteLock::Timestamp(1_700_000_000)]).is_err());
    }
}
