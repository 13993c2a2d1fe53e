//! Change-time threshold below which entries are assumed in sync.

use std::fmt;

/// Seconds since the epoch. Entries whose change time is at or below the
/// watermark are skipped by the gather walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(u64);

impl Watermark {
    /// Resync everything.
    pub const ZERO: Watermark = Watermark(0);

    /// `last_buddy_comm` minus the safety threshold. A zero threshold
    /// without an override resyncs everything; a timestamp smaller than the
    /// threshold is used unchanged.
    pub fn compute(last_buddy_comm: u64, threshold_secs: u64, is_override: bool) -> Self {
        if threshold_secs == 0 && !is_override {
            return Watermark::ZERO;
        }
        if last_buddy_comm > threshold_secs {
            Watermark(last_buddy_comm - threshold_secs)
        } else {
            Watermark(last_buddy_comm)
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Watermark(secs)
    }

    pub const fn secs(self) -> u64 {
        self.0
    }

    /// Whether a timestamp (seconds since the epoch, possibly negative for
    /// pre-epoch values) is newer than the watermark.
    pub fn is_exceeded_by(self, secs: i64) -> bool {
        u64::try_from(secs).is_ok_and(|secs| secs > self.0)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
