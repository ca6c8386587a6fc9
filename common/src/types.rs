use std::{fmt, num::NonZeroU64, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    /// Relay toggles on every timer tick.
    #[default]
    Auto,
    ForcedOff,
    ForcedOn,
}

impl OperatingMode {
    /// Numeric code used in the stored record and the status snapshot.
    pub fn code(self) -> i64 {
        match self {
            Self::Auto => 0,
            Self::ForcedOff => 1,
            Self::ForcedOn => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Auto),
            1 => Some(Self::ForcedOff),
            2 => Some(Self::ForcedOn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::ForcedOff => "FORCED_OFF",
            Self::ForcedOn => "FORCED_ON",
        }
    }

    /// Relay level this mode pins the output to, if any.
    pub fn pinned_relay(self) -> Option<bool> {
        match self {
            Self::Auto => None,
            Self::ForcedOff => Some(false),
            Self::ForcedOn => Some(true),
        }
    }
}

/// Strictly positive timer period in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval(NonZeroU64);

impl Interval {
    pub const DEFAULT: Self = match NonZeroU64::new(5 * 60 * 1000) {
        Some(ms) => Self(ms),
        None => panic!("default interval must be non-zero"),
    };

    pub fn from_millis(ms: i64) -> Option<Self> {
        u64::try_from(ms).ok().and_then(NonZeroU64::new).map(Self)
    }

    /// Converts a remote `seconds` value, rejecting non-positive or overflowing input.
    pub fn from_secs(secs: i64) -> Option<Self> {
        secs.checked_mul(1000).and_then(Self::from_millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0.get()
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0.get())
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes_round_trip() {
        for mode in [
            OperatingMode::Auto,
            OperatingMode::ForcedOff,
            OperatingMode::ForcedOn,
        ] {
            assert_eq!(OperatingMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(OperatingMode::from_code(3), None);
        assert_eq!(OperatingMode::from_code(-1), None);
    }

    #[test]
    fn interval_rejects_non_positive_values() {
        assert_eq!(Interval::from_millis(0), None);
        assert_eq!(Interval::from_millis(-5), None);
        assert_eq!(Interval::from_secs(0), None);
        assert_eq!(Interval::from_secs(-30), None);
    }

    #[test]
    fn interval_from_secs_scales_to_millis() {
        let interval = Interval::from_secs(90).unwrap();
        assert_eq!(interval.as_millis(), 90_000);
        assert_eq!(interval.as_duration(), Duration::from_secs(90));
        assert_eq!(interval.to_string(), "90000");
    }

    #[test]
    fn interval_from_secs_rejects_overflow() {
        assert_eq!(Interval::from_secs(i64::MAX), None);
    }

    #[test]
    fn default_interval_is_five_minutes() {
        assert_eq!(Interval::default().as_millis(), 300_000);
    }
}
