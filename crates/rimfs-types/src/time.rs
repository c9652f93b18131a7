use std::fmt;
use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A duration wrapper providing convenient conversions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros * 1_000,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    pub fn as_micros(&self) -> u64 {
        self.nanos / 1_000
    }

    pub fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    pub fn as_secs(&self) -> u64 {
        self.nanos / 1_000_000_000
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({}ns)", self.nanos)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos >= 1_000_000_000 {
            write!(f, "{:.3}s", self.as_secs_f64())
        } else if self.nanos >= 1_000_000 {
            write!(f, "{}ms", self.as_millis())
        } else if self.nanos >= 1_000 {
            write!(f, "{}us", self.as_micros())
        } else {
            write!(f, "{}ns", self.nanos)
        }
    }
}

impl Default for Duration {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self {
            nanos: d.as_nanos() as u64,
        }
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_nanos(d.nanos)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration {
            nanos: self.nanos + rhs.nanos,
        }
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            nanos: self.nanos.saturating_sub(rhs.nanos),
        }
    }
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic microseconds since an arbitrary process-local epoch.
///
/// Only differences between two readings are meaningful. The value never goes
/// backwards, which I/O timing and the open-descriptor idle aging rely on.
pub fn usec_now() -> u64 {
    process_epoch().elapsed().as_micros() as u64
}

/// Wall-clock seconds since the Unix epoch.
pub fn wall_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        let d = Duration::from_secs(2);
        assert_eq!(d.as_secs(), 2);
        assert_eq!(d.as_millis(), 2000);
        assert_eq!(d.as_micros(), 2_000_000);
        assert_eq!(d.as_nanos(), 2_000_000_000);
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(format!("{}", Duration::from_secs(1)), "1.000s");
        assert_eq!(format!("{}", Duration::from_millis(500)), "500ms");
        assert_eq!(format!("{}", Duration::from_micros(42)), "42us");
        assert_eq!(format!("{}", Duration::from_nanos(100)), "100ns");
    }

    #[test]
    fn test_duration_add_sub() {
        let a = Duration::from_millis(100);
        let b = Duration::from_millis(50);
        assert_eq!((a + b).as_millis(), 150);
        assert_eq!((a - b).as_millis(), 50);
        // Saturating subtraction
        assert_eq!((b - a).as_millis(), 0);
    }

    #[test]
    fn test_usec_now_monotonic() {
        let a = usec_now();
        let b = usec_now();
        assert!(b >= a);
    }

    #[test]
    fn test_wall_time() {
        // Any plausible date after 2020.
        assert!(wall_time_secs() > 1_577_836_800);
    }
}
