//! Worker trait.
//!
//! RULE: Every periodic worker implements LedgerSubsystem.
//! The engine calls update() on each registered worker
//! in registration order, every tick.
//! Execution order is fixed and documented in engine.rs.

use crate::{error::LedgerResult, event::LedgerEvent, rng::SubsystemRng};
use chrono::{DateTime, Utc};
use std::any::Any;

/// The contract every worker must fulfill.
pub trait LedgerSubsystem: Send {
    /// Unique stable name for this worker.
    fn name(&self) -> &'static str;

    /// Called once per tick by the engine.
    ///
    /// - `now`:       the clock's instant for this tick
    /// - `events_in`: events emitted by earlier workers this tick
    /// - `rng`:       this worker's deterministic RNG for this tick
    ///
    /// Returns the events to append to the tick's event log.
    fn update(
        &mut self,
        now: DateTime<Utc>,
        events_in: &[LedgerEvent],
        rng: &mut SubsystemRng,
    ) -> LedgerResult<Vec<LedgerEvent>>;

    /// For downcasting in tests and tooling only.
    fn as_any(&self) -> &dyn Any;
}
