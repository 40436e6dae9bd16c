use std::time::Duration;

use bevy::prelude::*;
use sim_proto::{PlanetId, Scalar};

/// Counters describing the most recent tick of one planet.
#[derive(Resource, Default, Debug, Clone)]
pub struct TickMetrics {
    pub planet_id: PlanetId,
    pub tick: u64,
    pub planet_time: u64,
    pub buildings_simulated: usize,
    pub buildings_deleted: usize,
    pub buildings_skipped: usize,
    pub construction_spend: Scalar,
    pub labor_spend: Scalar,
    pub research_spend: Scalar,
    pub refunds: Scalar,
    pub research_companies: usize,
    pub issues: usize,
    pub compute_time: Duration,
}

impl TickMetrics {
    pub fn log(&self) {
        tracing::info!(
            target: "tycoon::simulation",
            planet = %self.planet_id,
            tick = self.tick,
            planet_time = self.planet_time,
            buildings = self.buildings_simulated,
            deleted = self.buildings_deleted,
            skipped = self.buildings_skipped,
            construction = %self.construction_spend,
            labor = %self.labor_spend,
            research = %self.research_spend,
            refunds = %self.refunds,
            research_companies = self.research_companies,
            issues = self.issues,
            compute_us = self.compute_time.as_micros() as u64,
            "tick.completed"
        );
    }
}
