use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock instant with nanosecond resolution, counted from the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Whole seconds, as accepted by runtimes with second-resolution filters.
    #[inline]
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_from_system_time() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        let ts = Timestamp::from(t);
        assert_eq!(ts.as_nanos(), 1_500_000_000);
        assert_eq!(ts.as_secs(), 1);
    }

    #[test]
    fn pre_epoch_clamps_to_zero() {
        let t = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(Timestamp::from(t), Timestamp::default());
    }
}
