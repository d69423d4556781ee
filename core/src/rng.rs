//! Deterministic random number generation.
//!
//! RULE: No worker may call any platform RNG.
//! All randomness flows through SubsystemRng instances derived
//! from the single master seed stored on the engine_run record.
//!
//! Each worker gets its own stream per tick, seeded from
//! (master_seed, worker slot, tick). This means:
//!   - Adding a new worker never changes existing workers' streams.
//!   - A tick's jitter is reproducible without replaying earlier ticks.

use crate::types::Tick;
use rand::{Rng, RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for a single worker.
pub struct SubsystemRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl SubsystemRng {
    /// Create a worker RNG from the master seed and a stable slot index.
    /// The index must never change once assigned.
    pub fn new(master_seed: u64, slot_index: u64) -> Self {
        let derived_seed = master_seed ^ slot_index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Uniform integer in [0, n]. Returns 0 when `n` is 0.
    pub fn up_to(&mut self, n: i64) -> i64 {
        if n <= 0 {
            return 0;
        }
        self.inner.gen_range(0..=n)
    }
}

/// All worker RNGs for a single run, indexed by stable slot.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn for_subsystem(&self, slot: WorkerSlot) -> SubsystemRng {
        SubsystemRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }

    /// Stream for `slot` at `tick`. Independent of how many ticks ran before.
    pub fn for_subsystem_at_tick(&self, slot: WorkerSlot, tick: Tick) -> SubsystemRng {
        let tick_seed = self.master_seed ^ tick.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        SubsystemRng::new(tick_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable worker slot assignments.
/// Append only. Never reorder or remove entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum WorkerSlot {
    Billing = 0,
    Risk = 1,
    Schedule = 2,
    Notification = 3,
}

impl WorkerSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::Risk => "risk",
            Self::Schedule => "schedule",
            Self::Notification => "notification",
        }
    }
}
