//! Per-building state machine, stepped once per tick in id order.
//!
//! Buildings read the replica as it was at the start of the tick and only
//! interact through the shared ledger and the company service demand that the
//! headquarters pass folds in afterwards.

use std::collections::{BTreeMap, BTreeSet};

use sim_proto::{
    Building, BuildingConstruction, BuildingId, BuildingMetrics, BuildingSettings, CompanyId,
    ResourceFlow, ResourceId, Scalar,
};

use crate::catalog::{BuildingDefinition, Catalog};
use crate::config::SimulationConfig;
use crate::finances::{Charge, SimulationFinancesFrame, SpendKind};
use crate::issue::SimulationIssue;
use crate::model::PlanetModel;

/// Economic constants for one tick, resolved from config once.
#[derive(Debug, Clone, Copy)]
pub struct BuildingRules {
    pub planet_time: u64,
    pub price_markup: Scalar,
    pub upgrade_factor: Scalar,
    pub supply_quality: Scalar,
    pub labor_quality: Scalar,
}

impl BuildingRules {
    pub fn from_config(config: &SimulationConfig, planet_time: u64) -> Self {
        Self {
            planet_time,
            price_markup: config.construction_markup(),
            upgrade_factor: config.upgrade_factor(),
            supply_quality: config.supply_quality(),
            labor_quality: config.hired_labor_quality(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BuildingTickOutput {
    pub updated_buildings: BTreeMap<BuildingId, Building>,
    pub deleted_buildings: BTreeSet<BuildingId>,
    pub updated_constructions: BTreeMap<BuildingId, BuildingConstruction>,
    pub deleted_constructions: BTreeSet<BuildingId>,
    pub updated_metrics: BTreeMap<BuildingId, BuildingMetrics>,
    pub service_demand: BTreeMap<(CompanyId, ResourceId), Scalar>,
    pub issues: Vec<SimulationIssue>,
    pub simulated: usize,
    pub skipped: usize,
}

impl BuildingTickOutput {
    /// State of a building after this tick's step.
    pub fn building_after<'a>(&'a self, model: &'a PlanetModel, id: BuildingId) -> Option<&'a Building> {
        if self.deleted_buildings.contains(&id) {
            return None;
        }
        self.updated_buildings
            .get(&id)
            .or_else(|| model.buildings.get(&id))
    }

    fn metrics_after(&self, model: &PlanetModel, id: BuildingId) -> BuildingMetrics {
        self.updated_metrics
            .get(&id)
            .or_else(|| model.metrics.get(&id))
            .cloned()
            .unwrap_or_else(|| BuildingMetrics::new(id))
    }
}

/// Step every building of the model once.
pub fn simulate_buildings(
    model: &PlanetModel,
    catalog: &Catalog,
    rules: &BuildingRules,
    ledger: &mut SimulationFinancesFrame,
) -> BuildingTickOutput {
    let mut simulator = BuildingSimulator {
        model,
        catalog,
        rules,
        ledger,
        output: BuildingTickOutput::default(),
    };
    for building in model.buildings.all() {
        simulator.step(building);
    }
    simulator.output
}

struct BuildingSimulator<'a> {
    model: &'a PlanetModel,
    catalog: &'a Catalog,
    rules: &'a BuildingRules,
    ledger: &'a mut SimulationFinancesFrame,
    output: BuildingTickOutput,
}

/// Working copies of one building's records during its step.
struct Step {
    building: Building,
    metrics: BuildingMetrics,
    metrics_changed: bool,
}

impl<'a> BuildingSimulator<'a> {
    fn step(&mut self, original: &Building) {
        let id = original.id;
        self.output.simulated += 1;

        if original.is_condemned_by(self.rules.planet_time) {
            self.output.deleted_buildings.insert(id);
            if self.model.constructions.contains(&id) {
                self.output.deleted_constructions.insert(id);
            }
            return;
        }

        let settings = self
            .model
            .settings
            .get(&id)
            .cloned()
            .unwrap_or_else(|| BuildingSettings::new(id));
        let mut step = Step {
            building: original.clone(),
            metrics: self
                .model
                .metrics
                .get(&id)
                .cloned()
                .unwrap_or_else(|| BuildingMetrics::new(id)),
            metrics_changed: false,
        };

        let catalog = self.catalog;
        if settings.closed {
            step.metrics_changed = step.metrics.clear();
        } else {
            match catalog.building(&original.definition_id) {
                Some(definition) => self.advance(&mut step, definition, &settings),
                None => {
                    self.output.skipped += 1;
                    self.report(SimulationIssue::MissingDefinition {
                        building_id: id,
                        definition_id: original.definition_id.clone(),
                    });
                    return;
                }
            }
        }

        if step.metrics_changed {
            self.output.updated_metrics.insert(id, step.metrics);
        }
        if &step.building != original {
            self.output.updated_buildings.insert(id, step.building);
        }
    }

    fn advance(&mut self, step: &mut Step, definition: &BuildingDefinition, settings: &BuildingSettings) {
        let id = step.building.id;

        if !step.building.is_constructed() {
            let Some(mut construction) = self.model.constructions.get(&id).cloned() else {
                self.output.skipped += 1;
                self.report(SimulationIssue::MissingConstruction { building_id: id });
                return;
            };
            let purchased = self.purchase(&step.building, &mut construction);
            if purchased && step.building.construction_started_at.is_none() {
                step.building.construction_started_at = Some(self.rules.planet_time);
            }
            if construction.is_completed() {
                step.building
                    .construction_started_at
                    .get_or_insert(self.rules.planet_time);
                step.building.construction_finished_at = Some(self.rules.planet_time);
                self.output.deleted_constructions.insert(id);
            }
            self.record_construction(construction);
            return;
        }

        if step.building.upgrading {
            if settings.requested_level <= step.building.level {
                step.building.upgrading = false;
                step.metrics_changed |= step.metrics.clear();
                if self.model.constructions.contains(&id) {
                    self.output.deleted_constructions.insert(id);
                }
                return;
            }
            let Some(mut construction) = self.model.constructions.get(&id).cloned() else {
                self.output.skipped += 1;
                self.report(SimulationIssue::MissingConstruction { building_id: id });
                return;
            };
            self.purchase(&step.building, &mut construction);
            let completed = construction.is_completed();
            self.record_construction(construction);
            if completed {
                step.building.level += 1;
                step.building.upgrading = false;
                step.metrics_changed |= step.metrics.clear();
                self.output.deleted_constructions.insert(id);
                if settings.requested_level > step.building.level {
                    self.start_upgrade(step, definition, settings);
                }
            }
            return;
        }

        if settings.requested_level < step.building.level {
            // Downgrades take effect at once and refund nothing.
            step.building.level = settings.requested_level;
            step.metrics_changed |= step.metrics.clear();
            return;
        }

        if settings.requested_level > step.building.level {
            step.metrics_changed |= step.metrics.clear();
            self.start_upgrade(step, definition, settings);
            return;
        }

        self.operate(step, definition, settings);
    }

    fn start_upgrade(&mut self, step: &mut Step, definition: &BuildingDefinition, settings: &BuildingSettings) {
        let id = step.building.id;
        step.building.upgrading = true;
        let schedule = definition.construction_schedule(
            id,
            self.rules.upgrade_factor,
            &settings.construction_preferences,
        );
        self.output.deleted_constructions.remove(&id);
        self.output.updated_constructions.insert(id, schedule);
    }

    fn record_construction(&mut self, construction: BuildingConstruction) {
        let changed = self
            .model
            .constructions
            .get(&construction.building_id)
            .map_or(true, |previous| previous != &construction);
        if changed {
            self.output
                .updated_constructions
                .insert(construction.building_id, construction);
        }
    }

    /// Buy this tick's share of every unfinished resource. Returns whether
    /// anything was bought.
    fn purchase(&mut self, building: &Building, construction: &mut BuildingConstruction) -> bool {
        let charge = Charge::building(building);
        let mut purchased_any = false;

        for resource in construction.resources.iter_mut() {
            if resource.is_completed() {
                resource.clear_last_purchase();
                continue;
            }
            let Some(base_price) = self.catalog.resource_price(&resource.resource_id) else {
                resource.clear_last_purchase();
                self.report(SimulationIssue::MissingResourceType {
                    building_id: building.id,
                    resource_id: resource.resource_id.clone(),
                });
                continue;
            };
            let price = base_price * self.rules.price_markup;
            if price > resource.max_price || self.rules.supply_quality < resource.min_quality {
                resource.clear_last_purchase();
                continue;
            }

            let remaining = resource.max_velocity.min(resource.remaining());
            let affordable = self
                .ledger
                .cash_available(charge.payer)
                .checked_div(price)
                .unwrap_or(remaining);
            let purchased = remaining.min(affordable);
            if !purchased.is_positive() {
                resource.clear_last_purchase();
                continue;
            }

            match self
                .ledger
                .spend(charge, SpendKind::Construction, purchased * price)
            {
                Ok(()) => {
                    resource.record_purchase(purchased, self.rules.supply_quality, price);
                    purchased_any = true;
                }
                Err(err) => {
                    resource.clear_last_purchase();
                    self.report(err.into());
                }
            }
        }

        purchased_any
    }

    fn operate(&mut self, step: &mut Step, definition: &BuildingDefinition, settings: &BuildingSettings) {
        let building = &step.building;
        let charge = Charge::building(building);

        if let Some(labor) = &definition.simulation.labor {
            for slot in labor {
                let wage = settings
                    .labor_wages
                    .get(&slot.resource_id)
                    .copied()
                    .or_else(|| self.catalog.resource_price(&slot.resource_id));
                let Some(wage) = wage else {
                    self.report(SimulationIssue::MissingResourceType {
                        building_id: building.id,
                        resource_id: slot.resource_id.clone(),
                    });
                    continue;
                };

                let capacity = slot.max_velocity.times(building.level);
                let desired = slot.min_velocity.clamp(Scalar::ZERO, capacity);
                let affordable = self
                    .ledger
                    .cash_available(charge.payer)
                    .checked_div(wage)
                    .unwrap_or(desired);
                let mut hired = desired.min(affordable);

                if hired.is_positive() {
                    if let Err(err) = self.ledger.spend(charge, SpendKind::Labor, hired * wage) {
                        hired = Scalar::ZERO;
                        self.report(err.into());
                    }
                }
                let quality = if hired.is_positive() {
                    self.rules.labor_quality
                } else {
                    Scalar::ZERO
                };
                step.metrics_changed |=
                    step.metrics
                        .update_labor(&slot.resource_id, hired, quality, wage);
            }
        }

        if let Some(services) = &definition.simulation.services {
            for service in services {
                let capacity = service.max_velocity.times(building.level);
                let requested = settings
                    .service_requests
                    .get(&service.resource_id)
                    .copied()
                    .unwrap_or(capacity)
                    .clamp(Scalar::ZERO, capacity);
                if requested.is_positive() {
                    *self
                        .output
                        .service_demand
                        .entry((building.company_id, service.resource_id.clone()))
                        .or_default() += requested;
                }
            }
        }
    }

    fn report(&mut self, issue: SimulationIssue) {
        issue.log();
        self.output.issues.push(issue);
    }
}

/// Second pass: fold each company's service demand into the input metrics of
/// its first operational headquarters. Other headquarters report no inputs.
pub fn aggregate_headquarters(output: &mut BuildingTickOutput, model: &PlanetModel, catalog: &Catalog) {
    let mut demand_by_company: BTreeMap<CompanyId, Vec<ResourceFlow>> = BTreeMap::new();
    for ((company_id, resource_id), quantity) in &output.service_demand {
        demand_by_company
            .entry(*company_id)
            .or_default()
            .push(ResourceFlow {
                resource_id: resource_id.clone(),
                quantity: *quantity,
            });
    }

    let mut served: BTreeSet<CompanyId> = BTreeSet::new();
    let mut updates = Vec::new();
    for id in model.buildings.ids() {
        let Some(building) = output.building_after(model, id) else {
            continue;
        };
        let is_headquarters = catalog
            .building(&building.definition_id)
            .is_some_and(BuildingDefinition::is_headquarters);
        if !is_headquarters || !building.is_constructed() || building.upgrading {
            continue;
        }
        if model.settings.get(&id).is_some_and(|settings| settings.closed) {
            continue;
        }

        let flows = if served.insert(building.company_id) {
            demand_by_company
                .get(&building.company_id)
                .cloned()
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut metrics = output.metrics_after(model, id);
        if metrics.set_inputs(flows) {
            updates.push(metrics);
        }
    }

    for metrics in updates {
        output.updated_metrics.insert(metrics.building_id, metrics);
    }
}
