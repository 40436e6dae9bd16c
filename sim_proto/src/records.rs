use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{
    BuildingId, CompanyId, ConnectionId, CorporationId, DefinitionId, PlanetId, ResourceId,
    TownId, TycoonId,
};
use crate::scalar::Scalar;

/// Edge length, in tiles, of the square map chunks used for spatial lookups.
pub const MAP_CHUNK_SIZE: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn for_time(time: u64, hours_per_season: u64) -> Self {
        match (time / hours_per_season.max(1)) % 4 {
            0 => Season::Winter,
            1 => Season::Spring,
            2 => Season::Summer,
            _ => Season::Fall,
        }
    }
}

/// Planet clock. `time` counts simulated hours since the planet was founded.
/// `last_building_id` only ever grows, so ids of demolished buildings are
/// never handed out again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Planet {
    pub id: PlanetId,
    pub name: String,
    pub time: u64,
    pub season: Season,
    pub last_building_id: u64,
}

impl Planet {
    pub fn new(id: PlanetId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            time: 0,
            season: Season::Winter,
            last_building_id: 0,
        }
    }

    pub fn advance(&mut self, step_hours: u64, hours_per_season: u64) {
        self.time += step_hours;
        self.season = Season::for_time(self.time, hours_per_season);
    }

    /// Copy the clock, which the simulation owns.
    pub fn absorb_simulated(&mut self, simulated: &Planet) {
        self.time = simulated.time;
        self.season = simulated.season;
    }

    /// Reserve the next building id, never below `floor + 1`.
    pub fn allocate_building_id(&mut self, floor: u64) -> BuildingId {
        self.last_building_id = self.last_building_id.max(floor) + 1;
        BuildingId(self.last_building_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MapPosition {
    pub x: u32,
    pub y: u32,
}

impl MapPosition {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn chunk(self) -> (u32, u32) {
        (self.x / MAP_CHUNK_SIZE, self.y / MAP_CHUNK_SIZE)
    }

    pub fn distance_squared(self, other: MapPosition) -> u64 {
        let dx = self.x.abs_diff(other.x) as u64;
        let dy = self.y.abs_diff(other.y) as u64;
        dx * dx + dy * dy
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildingLifecycle {
    Planned,
    UnderConstruction,
    Operational,
    Upgrading,
    Condemned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub id: BuildingId,
    pub tycoon_id: TycoonId,
    pub corporation_id: CorporationId,
    pub company_id: CompanyId,
    pub town_id: TownId,
    pub definition_id: DefinitionId,
    pub name: Option<String>,
    pub position: MapPosition,
    pub level: u32,
    pub upgrading: bool,
    pub construction_started_at: Option<u64>,
    pub construction_finished_at: Option<u64>,
    pub condemned_at: Option<u64>,
}

impl Building {
    pub fn is_constructed(&self) -> bool {
        self.construction_finished_at.is_some()
    }

    pub fn is_condemned_by(&self, planet_time: u64) -> bool {
        matches!(self.condemned_at, Some(at) if at < planet_time)
    }

    pub fn lifecycle(&self) -> BuildingLifecycle {
        if self.condemned_at.is_some() {
            BuildingLifecycle::Condemned
        } else if self.upgrading {
            BuildingLifecycle::Upgrading
        } else if self.is_constructed() {
            BuildingLifecycle::Operational
        } else if self.construction_started_at.is_some() {
            BuildingLifecycle::UnderConstruction
        } else {
            BuildingLifecycle::Planned
        }
    }

    /// Copy the fields the simulation loop owns from `simulated`.
    pub fn absorb_simulated(&mut self, simulated: &Building) {
        self.level = simulated.level;
        self.upgrading = simulated.upgrading;
        self.construction_started_at = simulated.construction_started_at;
        self.construction_finished_at = simulated.construction_finished_at;
    }

    /// Copy the fields the model authority owns from `authored`.
    pub fn absorb_authored(&mut self, authored: &Building) {
        self.tycoon_id = authored.tycoon_id;
        self.corporation_id = authored.corporation_id;
        self.company_id = authored.company_id;
        self.town_id = authored.town_id;
        self.name = authored.name.clone();
        self.condemned_at = authored.condemned_at;
    }
}

/// Units bought for one construction resource during the most recent tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PurchaseSnapshot {
    pub quantity: Scalar,
    pub quality: Scalar,
    pub price: Scalar,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructionResource {
    pub resource_id: ResourceId,
    pub required_quantity: Scalar,
    pub max_velocity: Scalar,
    pub max_price: Scalar,
    pub min_quality: Scalar,
    pub completed_quantity: Scalar,
    pub completed_quality: Scalar,
    pub last_purchase: PurchaseSnapshot,
}

impl ConstructionResource {
    pub fn new(resource_id: ResourceId, required_quantity: Scalar, max_velocity: Scalar) -> Self {
        Self {
            resource_id,
            required_quantity,
            max_velocity,
            max_price: Scalar::MAX,
            min_quality: Scalar::ZERO,
            completed_quantity: Scalar::ZERO,
            completed_quality: Scalar::ZERO,
            last_purchase: PurchaseSnapshot::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_quantity >= self.required_quantity
    }

    pub fn remaining(&self) -> Scalar {
        (self.required_quantity - self.completed_quantity).non_negative()
    }

    /// Record a purchase, blending quality by quantity.
    pub fn record_purchase(&mut self, quantity: Scalar, quality: Scalar, price: Scalar) {
        let total = self.completed_quantity + quantity;
        if total.is_positive() {
            self.completed_quality =
                (self.completed_quality * self.completed_quantity + quality * quantity) / total;
        }
        self.completed_quantity = total;
        self.last_purchase = PurchaseSnapshot {
            quantity,
            quality,
            price,
        };
    }

    pub fn clear_last_purchase(&mut self) {
        self.last_purchase = PurchaseSnapshot::default();
    }
}

/// Construction or upgrade schedule of one building.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingConstruction {
    pub building_id: BuildingId,
    pub resources: Vec<ConstructionResource>,
}

impl BuildingConstruction {
    pub fn is_completed(&self) -> bool {
        self.resources.iter().all(ConstructionResource::is_completed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPosture {
    #[default]
    Anyone,
    AlliesOnly,
    SelfOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructionPreference {
    pub max_price: Scalar,
    pub min_quality: Scalar,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingSettings {
    pub building_id: BuildingId,
    pub closed: bool,
    pub connection_posture: ConnectionPosture,
    pub allow_incoming_settings: bool,
    pub requested_level: u32,
    pub construction_preferences: BTreeMap<ResourceId, ConstructionPreference>,
    pub labor_wages: BTreeMap<ResourceId, Scalar>,
    pub service_requests: BTreeMap<ResourceId, Scalar>,
}

impl BuildingSettings {
    pub fn new(building_id: BuildingId) -> Self {
        Self {
            building_id,
            closed: false,
            connection_posture: ConnectionPosture::Anyone,
            allow_incoming_settings: true,
            requested_level: 1,
            construction_preferences: BTreeMap::new(),
            labor_wages: BTreeMap::new(),
            service_requests: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaborMetrics {
    pub resource_id: ResourceId,
    pub hired_quantity: Scalar,
    pub hired_quality: Scalar,
    pub wage: Scalar,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlow {
    pub resource_id: ResourceId,
    pub quantity: Scalar,
}

/// Most-recent-tick snapshot of a building's operation.
///
/// Every mutator reports whether it changed anything so the caller can skip
/// persisting no-op ticks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingMetrics {
    pub building_id: BuildingId,
    pub labor: Vec<LaborMetrics>,
    pub inputs: Vec<ResourceFlow>,
    pub outputs: Vec<ResourceFlow>,
    pub rent: Scalar,
    pub service_level: Scalar,
    pub storage_used: Scalar,
}

impl BuildingMetrics {
    pub fn new(building_id: BuildingId) -> Self {
        Self {
            building_id,
            labor: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            rent: Scalar::ZERO,
            service_level: Scalar::ZERO,
            storage_used: Scalar::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labor.is_empty()
            && self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.rent == Scalar::ZERO
            && self.service_level == Scalar::ZERO
            && self.storage_used == Scalar::ZERO
    }

    pub fn clear(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        *self = BuildingMetrics::new(self.building_id);
        true
    }

    pub fn update_labor(
        &mut self,
        resource_id: &ResourceId,
        hired_quantity: Scalar,
        hired_quality: Scalar,
        wage: Scalar,
    ) -> bool {
        match self
            .labor
            .iter_mut()
            .find(|entry| &entry.resource_id == resource_id)
        {
            Some(entry) => {
                if entry.hired_quantity == hired_quantity
                    && entry.hired_quality == hired_quality
                    && entry.wage == wage
                {
                    return false;
                }
                entry.hired_quantity = hired_quantity;
                entry.hired_quality = hired_quality;
                entry.wage = wage;
                true
            }
            None => {
                self.labor.push(LaborMetrics {
                    resource_id: resource_id.clone(),
                    hired_quantity,
                    hired_quality,
                    wage,
                });
                true
            }
        }
    }

    /// Replace the input flows wholesale; `flows` is expected in resource order.
    pub fn set_inputs(&mut self, flows: Vec<ResourceFlow>) -> bool {
        if self.inputs == flows {
            return false;
        }
        self.inputs = flows;
        true
    }
}

/// Directed supply edge between two buildings for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingConnection {
    pub id: ConnectionId,
    pub source_building_id: BuildingId,
    pub sink_building_id: BuildingId,
    pub resource_id: ResourceId,
    pub max_capacity: Scalar,
    pub velocity: Scalar,
}

impl BuildingConnection {
    pub fn touches(&self, building_id: BuildingId) -> bool {
        self.source_building_id == building_id || self.sink_building_id == building_id
    }
}
