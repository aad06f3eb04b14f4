//! Wall-clock source for every time comparison in the service.
//!
//! All timestamps are naive local time: recording times parsed from the
//! recorder have their timezone marker discarded, so "now" must be naive
//! local time as well for the comparisons to line up.

use chrono::{Local, NaiveDateTime};

/// Source of the current naive local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Clock backed by the system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for deterministic window and retention checks.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<NaiveDateTime>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    #[test]
    fn test_manual_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(14, 30, 45)
            .unwrap();
        let clock = ManualClock::new(start);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
