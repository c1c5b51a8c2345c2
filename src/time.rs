//! Virtual time and event identities.
//!
//! Mirrors the ns-3 `Time`/`EventId` split: `Time` is a signed tick count in a
//! process-wide resolution fixed once at startup, `EventId` is an opaque handle
//! a caller uses to query or cancel a previously scheduled event.

use std::fmt;
use std::sync::OnceLock;

/// Sentinel context used for events scheduled outside of any running node.
pub const NO_CONTEXT: u32 = 0xFFFF_FFFF;

/// The unit a raw `Time` tick count is denominated in. Purely a
/// presentation concern for callers printing or configuring delays in real
/// units; the kernel itself only ever compares and adds raw `i64` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Femtoseconds,
    Picoseconds,
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

static RESOLUTION: OnceLock<TimeUnit> = OnceLock::new();

/// Sets the process-wide tick resolution. May be called at most once; per
/// ns-3's own `Simulator::SetResolution` contract, callers must do this
/// before scheduling anything, since changing it after ticks already exist
/// would silently rescale every outstanding delay.
pub fn set_resolution(unit: TimeUnit) {
    RESOLUTION
        .set(unit)
        .expect("fatal: time resolution already set");
}

/// The current resolution, defaulting to nanoseconds (ns-3's own default)
/// when `set_resolution` was never called.
pub fn resolution() -> TimeUnit {
    *RESOLUTION.get().unwrap_or(&TimeUnit::Nanoseconds)
}

/// A signed count of ticks in the simulator's configured resolution.
///
/// Resolution itself (fs/ps/ns/us/ms/s) is a presentation concern of callers;
/// the kernel only ever compares and adds raw tick counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(pub i64);

impl Time {
    pub const ZERO: Time = Time(0);
    pub const MAX: Time = Time(i64::MAX);

    /// Saturating addition, clamped at `Time::MAX`.
    pub fn saturating_add(self, delay: Time) -> Time {
        Time(self.0.saturating_add(delay.0))
    }

    pub fn saturating_sub(self, other: Time) -> Time {
        Time(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Time {
    fn from(v: i64) -> Self {
        Time(v)
    }
}

impl std::ops::Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        self.saturating_add(rhs)
    }
}

/// A unique, monotonically increasing insertion sequence number.
///
/// Used as the tie-breaker in the (expiration, sequence) total order so that
/// simultaneous events run in FIFO scheduling order rather than by pointer
/// identity or hashing.
pub type SequenceNumber = u64;

/// Opaque handle to a scheduled event.
///
/// Two `EventId`s compare equal iff they name the same scheduling slot
/// (same sequence number); this is stronger than comparing expiration times,
/// which may collide across many unrelated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub(crate) uid: SequenceNumber,
    pub(crate) expiration: Time,
    pub(crate) context: u32,
}

impl EventId {
    /// A handle that never refers to a real event; `is_expired` is always true.
    pub fn none() -> Self {
        EventId {
            uid: 0,
            expiration: Time::ZERO,
            context: NO_CONTEXT,
        }
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn scheduled_time(&self) -> Time {
        self.expiration
    }

    pub(crate) fn uid(&self) -> SequenceNumber {
        self.uid
    }
}
