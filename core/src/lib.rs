//! Data layer for a security-intelligence service: subscriptions and
//! billing, risk assessment, and notification delivery.

pub mod billing_subsystem;
pub mod clock;
pub mod command;
pub mod config;
pub mod delivery;
pub mod documents;
pub mod engine;
pub mod error;
pub mod event;
pub mod notification_subsystem;
pub mod risk_subsystem;
pub mod rng;
pub mod schedule_subsystem;
pub mod store;
pub mod subsystem;
pub mod types;
