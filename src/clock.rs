//! Capture-clock normalization.
//!
//! A double's 52-bit mantissa cannot hold a raw UNIX-epoch timestamp at
//! microsecond resolution. Subtracting the integer second of the first
//! usable packet keeps every later offset small enough to preserve the
//! full resolution; the absolute time is recoverable by adding the
//! baseline back.

/// Converts (seconds, microseconds) capture stamps into a monotonic
/// seconds offset from the first packet's integer second.
#[derive(Debug, Default)]
pub struct CaptureClock {
    off_tm: Option<i64>,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self { off_tm: None }
    }

    /// Normalize one capture timestamp. The first call fixes the
    /// baseline and returns only the fractional part.
    pub fn normalize(&mut self, secs: i64, usecs: i64) -> f64 {
        match self.off_tm {
            None => {
                self.off_tm = Some(secs);
                usecs as f64 * 1e-6
            }
            Some(off) => (secs - off) as f64 + usecs as f64 * 1e-6,
        }
    }

    /// Baseline integer second, once the first packet has been seen.
    pub fn offset(&self) -> Option<i64> {
        self.off_tm
    }
}
