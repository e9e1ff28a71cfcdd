#![allow(clippy::cast_possible_wrap)]

use crate::error::{KgslError, KgslResult};
use std::fmt;

/// A value of the GPU's 32-bit command-stream timestamp counter.
///
/// The counter wraps, so plain integer ordering is meaningless across the wrap point.
/// Use [`Timestamp::reached`] to ask whether one timestamp is at or after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp(pub u32);

impl Timestamp {
    /// Returns true when `self` is at or after `target`, treating the counter as modular.
    ///
    /// Two timestamps are comparable as long as they are less than 2^31 apart.
    #[must_use]
    pub const fn reached(self, target: Self) -> bool {
        (self.0.wrapping_sub(target.0) as i32) >= 0
    }

    #[must_use]
    pub const fn wrapping_add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

impl From<u32> for Timestamp {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Which end of the pipeline a timestamp refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimestampType {
    /// Commands the CP has fetched.
    Consumed = 0x0000_0001,
    /// Commands whose end-of-pipe event has fired.
    Retired = 0x0000_0002,
}

impl TryFrom<u32> for TimestampType {
    type Error = KgslError;

    fn try_from(raw: u32) -> KgslResult<Self> {
        match raw {
            0x1 => Ok(Self::Consumed),
            0x2 => Ok(Self::Retired),
            other => Err(KgslError::InvalidArgument(format!(
                "unknown timestamp type {other:#x}"
            ))),
        }
    }
}
