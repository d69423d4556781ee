//! Catalog seeding: plans, playbooks and templates from the data files.

use super::LedgerStore;
use crate::{config::LedgerConfig, error::LedgerResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rows inserted by one `seed_catalog` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSeed {
    pub plans: usize,
    pub playbooks: usize,
    pub templates: usize,
}

impl LedgerStore {
    /// Insert every catalog entry whose name is not taken yet.
    /// Running it twice inserts nothing the second time.
    pub fn seed_catalog(&self, config: &LedgerConfig, now: DateTime<Utc>) -> LedgerResult<CatalogSeed> {
        self.atomic(|store| {
            let mut seeded = CatalogSeed::default();
            for plan in &config.plans {
                if store.get_plan_by_name(&plan.name)?.is_none() {
                    store.insert_plan(&plan.clone().into_row(now)?)?;
                    seeded.plans += 1;
                }
            }
            for playbook in &config.playbooks {
                if store.get_playbook_by_name(&playbook.name)?.is_none() {
                    store.insert_playbook(&playbook.clone().into_row(now)?)?;
                    seeded.playbooks += 1;
                }
            }
            for template in &config.templates {
                if store.get_template_by_name(&template.name)?.is_none() {
                    store.insert_template(&template.clone().into_row(now)?)?;
                    seeded.templates += 1;
                }
            }
            log::info!(
                "catalog seeded: {} plans, {} playbooks, {} templates",
                seeded.plans,
                seeded.playbooks,
                seeded.templates
            );
            Ok(seeded)
        })
    }
}
