use std::str::FromStr;
use std::time::Duration;

use crate::error::ProfileError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(500);
pub const DEFAULT_GC_RUNS_AT_STOP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Wall,
    Retained,
    Custom,
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wall" => Ok(Self::Wall),
            "retained" => Ok(Self::Retained),
            "custom" => Ok(Self::Custom),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Configuration {
    pub mode: Mode,
    /// Wall-clock sampling cadence.
    pub interval: Duration,
    /// Sample one allocation out of every N NEWOBJ events; 0 disables.
    pub allocation_interval: u64,
    /// RSS sampling cadence; `None` disables the memory tracker.
    pub memory_interval: Option<Duration>,
    /// Full GC passes performed while stopping the retained collector.
    pub gc_runs_at_stop: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            mode: Mode::Wall,
            interval: DEFAULT_INTERVAL,
            allocation_interval: 0,
            memory_interval: None,
            gc_runs_at_stop: DEFAULT_GC_RUNS_AT_STOP,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.interval.is_zero() {
            return Err(ProfileError::InvalidConfiguration(
                "sampling interval must be non-zero".to_string(),
            ));
        }
        if matches!(self.memory_interval, Some(interval) if interval.is_zero()) {
            return Err(ProfileError::InvalidConfiguration(
                "memory interval must be non-zero".to_string(),
            ));
        }
        if self.gc_runs_at_stop == 0 {
            return Err(ProfileError::InvalidConfiguration(
                "gc_runs_at_stop must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
