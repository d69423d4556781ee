//! Ledger clock: owns the current instant, tick count, step size and pause.
//!
//! Workers never read the wall clock. Every timestamp written during a
//! tick comes from here, which keeps runs reproducible.

use crate::types::Tick;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerClock {
    pub now: DateTime<Utc>,
    pub current_tick: Tick,
    pub step: ClockStep,
    pub paused: bool,
}

impl LedgerClock {
    pub fn new(start: DateTime<Utc>, step: ClockStep) -> Self {
        Self {
            now: start,
            current_tick: 0,
            step,
            paused: false,
        }
    }

    /// Advance one step. Returns the new tick number.
    /// A paused clock stays put and returns the current tick.
    pub fn advance(&mut self) -> Tick {
        if self.paused {
            return self.current_tick;
        }
        self.current_tick += 1;
        self.now += self.step.duration();
        self.current_tick
    }

    /// Jump forward without counting ticks. Used by tests and IPC.
    pub fn skip(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn pause(&mut self)  { self.paused = true;  }
    pub fn resume(&mut self) { self.paused = false; }

    pub fn set_step(&mut self, step: ClockStep) {
        self.step = step;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClockStep {
    Minute,
    Hour,
    Day,
}

impl ClockStep {
    pub fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour   => Duration::hours(1),
            Self::Day    => Duration::days(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advance_moves_by_step() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut clock = LedgerClock::new(start, ClockStep::Hour);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.now, start + Duration::hours(1));
        clock.set_step(ClockStep::Day);
        clock.advance();
        assert_eq!(clock.now, start + Duration::hours(25));
    }

    #[test]
    fn paused_clock_does_not_move() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut clock = LedgerClock::new(start, ClockStep::Minute);
        clock.pause();
        assert_eq!(clock.advance(), 0);
        assert_eq!(clock.now, start);
        clock.resume();
        assert_eq!(clock.advance(), 1);
    }
}
