//! The ledger engine: owns the clock and drives the periodic workers.
//!
//! Workers run in this order every tick:
//!   1. Billing: close ended periods, renew or lapse subscriptions
//!   2. Risk: evaluate thresholds for fresh assessments
//!   3. Schedule: run due schedules, queueing notifications
//!   4. Notification: dispatch due notifications
//!
//! RULES:
//!   - Workers execute in registration order, every tick.
//!   - Each worker holds its own store connection.
//!   - No worker calls another worker's functions directly.
//!   - All randomness flows through the RngBank.
//!   - Every emitted event is recorded in the event log.

use crate::{
    billing_subsystem::BillingSubsystem,
    clock::LedgerClock,
    config::LedgerConfig,
    delivery::{DeliveryTransport, LogTransport},
    error::{LedgerError, LedgerResult},
    event::{EventLogEntry, LedgerEvent},
    notification_subsystem::NotificationSubsystem,
    risk_subsystem::RiskSubsystem,
    rng::{RngBank, WorkerSlot},
    schedule_subsystem::ScheduleSubsystem,
    store::{CatalogSeed, LedgerStore},
    subsystem::LedgerSubsystem,
    types::{new_id, Tick, UserId},
};
use chrono::{DateTime, Utc};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct LedgerEngine {
    pub run_id: String,
    pub clock: LedgerClock,
    pub rng_bank: RngBank,
    pub config: LedgerConfig,
    /// The engine's own connection. Workers hold their own.
    pub store: LedgerStore,
    pub catalog: CatalogSeed,
    seed: u64,
    subsystems: Vec<(WorkerSlot, Box<dyn LedgerSubsystem>)>,
}

impl LedgerEngine {
    pub fn new(run_id: String, seed: u64, config: LedgerConfig, store: LedgerStore) -> Self {
        Self {
            clock: LedgerClock::new(config.engine.start, config.engine.step),
            rng_bank: RngBank::new(seed),
            config,
            store,
            catalog: CatalogSeed::default(),
            seed,
            subsystems: Vec::new(),
            run_id,
        }
    }

    /// Migrate, seed the catalog and register every worker.
    pub fn build(run_id: String, seed: u64, config: LedgerConfig, store: LedgerStore) -> LedgerResult<Self> {
        Self::build_with_transport(run_id, seed, config, store, Box::new(LogTransport::default()))
    }

    pub fn build_with_transport(
        run_id: String,
        seed: u64,
        config: LedgerConfig,
        store: LedgerStore,
        transport: Box<dyn DeliveryTransport>,
    ) -> LedgerResult<Self> {
        let mut engine = LedgerEngine::new(run_id, seed, config, store);
        let now = engine.clock.now;
        engine.store.migrate()?;
        engine.catalog = engine.store.seed_catalog(&engine.config, now)?;
        engine
            .store
            .insert_run(&engine.run_id, seed, ENGINE_VERSION, now)?;

        // Fixed execution order.
        let billing = BillingSubsystem::new(engine.config.billing.clone(), engine.store.reopen()?);
        engine.register(WorkerSlot::Billing, Box::new(billing));
        let risk = RiskSubsystem::new(engine.config.risk.clone(), engine.store.reopen()?);
        engine.register(WorkerSlot::Risk, Box::new(risk));
        let schedule = ScheduleSubsystem::new(
            engine.config.schedule.clone(),
            engine.config.notification.default_max_retries,
            engine.store.reopen()?,
        );
        engine.register(WorkerSlot::Schedule, Box::new(schedule));
        let notification = NotificationSubsystem::with_transport(
            engine.config.notification.clone(),
            engine.store.reopen()?,
            transport,
        );
        engine.register(WorkerSlot::Notification, Box::new(notification));

        log::info!("engine {} built with seed {seed}", engine.run_id);
        Ok(engine)
    }

    /// Engine on a private shared-memory database with the test config.
    pub fn build_test(run_id: &str, seed: u64) -> LedgerResult<Self> {
        let store = LedgerStore::shared_memory(&format!("ledger-{}", new_id().simple()))?;
        Self::build(run_id.to_string(), seed, LedgerConfig::default_test(), store)
    }

    pub fn build_test_with_transport(
        run_id: &str,
        seed: u64,
        transport: Box<dyn DeliveryTransport>,
    ) -> LedgerResult<Self> {
        let store = LedgerStore::shared_memory(&format!("ledger-{}", new_id().simple()))?;
        Self::build_with_transport(
            run_id.to_string(),
            seed,
            LedgerConfig::default_test(),
            store,
            transport,
        )
    }

    /// Register a worker. Call in the documented execution order.
    pub fn register(&mut self, slot: WorkerSlot, subsystem: Box<dyn LedgerSubsystem>) {
        self.subsystems.push((slot, subsystem));
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now
    }

    /// Advance one step and run every worker.
    pub fn tick(&mut self) -> LedgerResult<Vec<LedgerEvent>> {
        if self.clock.paused {
            return Err(LedgerError::StateTransition {
                entity: "clock",
                from: "paused".into(),
                to: "tick".into(),
            });
        }
        let current_tick = self.clock.advance();
        let now = self.clock.now;
        let mut tick_events = vec![LedgerEvent::TickStarted {
            tick: current_tick,
            now,
        }];

        // Each worker sees all events emitted so far this tick.
        for (slot, subsystem) in &mut self.subsystems {
            let mut rng = self.rng_bank.for_subsystem_at_tick(*slot, current_tick);
            let new_events = subsystem.update(now, &tick_events, &mut rng)?;

            for event in &new_events {
                let entry = EventLogEntry {
                    id: None,
                    run_id: self.run_id.clone(),
                    tick: current_tick,
                    subsystem: subsystem.name().to_string(),
                    event_type: event.event_type().to_string(),
                    payload: serde_json::to_string(event)?,
                    created_at: now,
                };
                self.store.append_event(&entry)?;
            }

            tick_events.extend(new_events);
        }

        tick_events.push(LedgerEvent::TickCompleted { tick: current_tick });
        Ok(tick_events)
    }

    /// Run n ticks in a loop. Used for testing and fast-forward.
    pub fn run_ticks(&mut self, n: u64) -> LedgerResult<Vec<LedgerEvent>> {
        if self.clock.current_tick == 0 && self.store.event_count(&self.run_id, "run_initialized")? == 0 {
            let init = LedgerEvent::RunInitialized {
                run_id: self.run_id.clone(),
                seed: self.seed,
            };
            self.log_event("engine", &init)?;
        }
        let mut all = Vec::new();
        for _ in 0..n {
            all.extend(self.tick()?);
        }
        Ok(all)
    }

    /// Persist an event raised outside a worker (IPC commands, tooling).
    pub fn log_event(&self, source: &str, event: &LedgerEvent) -> LedgerResult<()> {
        let entry = EventLogEntry {
            id: None,
            run_id: self.run_id.clone(),
            tick: self.clock.current_tick,
            subsystem: source.to_string(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
            created_at: self.clock.now,
        };
        self.store.append_event(&entry)
    }

    /// Query events for a specific tick from the store.
    pub fn store_events_for_tick(&self, tick: Tick) -> LedgerResult<Vec<EventLogEntry>> {
        self.store.events_for_tick(&self.run_id, tick)
    }

    // ── Identity ───────────────────────────────────────────────

    pub fn create_user(&self, email: &str) -> LedgerResult<UserId> {
        let email = email.trim();
        if !email.contains('@') || email.len() < 3 {
            return Err(LedgerError::validation("email", format!("'{email}' is not an address")));
        }
        let id = new_id();
        self.store.insert_user(id, email, self.clock.now)?;
        Ok(id)
    }

    /// Owned rows follow their cascade or set-null rules.
    pub fn delete_user(&self, user_id: UserId) -> LedgerResult<()> {
        self.store.delete_user(user_id)?;
        log::info!("user {user_id} deleted");
        Ok(())
    }

    // ── Worker access ──────────────────────────────────────────

    /// Downcast a registered worker. Used by tests and tooling.
    pub fn subsystem<T: 'static>(&self) -> Option<&T> {
        self.subsystems
            .iter()
            .find_map(|(_, sub)| sub.as_any().downcast_ref::<T>())
    }

    fn require<T: 'static>(&self, name: &str) -> LedgerResult<&T> {
        self.subsystem::<T>()
            .ok_or_else(|| LedgerError::Other(anyhow::anyhow!("{name} worker is not registered")))
    }

    pub fn billing(&self) -> LedgerResult<&BillingSubsystem> {
        self.require("billing")
    }

    pub fn risk(&self) -> LedgerResult<&RiskSubsystem> {
        self.require("risk")
    }

    pub fn schedules(&self) -> LedgerResult<&ScheduleSubsystem> {
        self.require("schedule")
    }

    pub fn notifications(&self) -> LedgerResult<&NotificationSubsystem> {
        self.require("notification")
    }
}
