use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use crate::economy::InventionSummary;
use crate::ids::{BuildingId, CompanyId, CorporationId, InventionId, TownId};
use crate::records::{Building, BuildingConstruction, BuildingMetrics, Planet};
use crate::scalar::Scalar;

/// Money moved during one tick, split by purpose. Spend is positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cashflow {
    pub construction: Scalar,
    pub labor: Scalar,
    pub research: Scalar,
    pub refunds: Scalar,
}

impl Cashflow {
    pub fn spend(&self) -> Scalar {
        self.construction + self.labor + self.research
    }

    /// Net change to the balance this cashflow is charged against.
    pub fn net(&self) -> Scalar {
        self.refunds - self.spend()
    }

    pub fn is_zero(&self) -> bool {
        *self == Cashflow::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinancesDelta {
    pub corporations: BTreeMap<CorporationId, Cashflow>,
    pub companies: BTreeMap<CompanyId, Cashflow>,
    pub buildings: BTreeMap<BuildingId, Cashflow>,
    pub towns: BTreeMap<TownId, Cashflow>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedInvention {
    pub company_id: CompanyId,
    pub invention_id: InventionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResearchDelta {
    pub summaries: Vec<InventionSummary>,
    pub completed: Vec<CompletedInvention>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildingDelta {
    pub added_building_ids: Vec<BuildingId>,
    pub updated_buildings: Vec<Building>,
    pub deleted_building_ids: Vec<BuildingId>,
    pub updated_constructions: Vec<BuildingConstruction>,
    pub deleted_construction_ids: Vec<BuildingId>,
    pub updated_metrics: Vec<BuildingMetrics>,
}

impl BuildingDelta {
    pub fn is_empty(&self) -> bool {
        self.added_building_ids.is_empty()
            && self.updated_buildings.is_empty()
            && self.deleted_building_ids.is_empty()
            && self.updated_constructions.is_empty()
            && self.deleted_construction_ids.is_empty()
            && self.updated_metrics.is_empty()
    }
}

/// Everything one planet tick changed. Immutable once published.
///
/// `epoch` names the authority snapshot the producing replica was last
/// synced from; frames from an older epoch are stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationFrame {
    pub tick: u64,
    pub epoch: u64,
    pub planet: Planet,
    pub finances: FinancesDelta,
    pub research: ResearchDelta,
    pub buildings: BuildingDelta,
    pub hash: u64,
}

impl SimulationFrame {
    pub fn new(
        tick: u64,
        planet: Planet,
        finances: FinancesDelta,
        research: ResearchDelta,
        buildings: BuildingDelta,
    ) -> Self {
        Self {
            tick,
            epoch: 0,
            planet,
            finances,
            research,
            buildings,
            hash: 0,
        }
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn finalize(mut self) -> Self {
        self.hash = hash_frame(&self);
        self
    }

    pub fn verify(&self) -> bool {
        hash_frame(self) == self.hash
    }
}

pub fn hash_frame(frame: &SimulationFrame) -> u64 {
    let mut clone = frame.clone();
    clone.hash = 0;
    let encoded = bincode::serialize(&clone).expect("frame serialization for hashing");
    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write(&encoded);
    hasher.finish()
}

pub fn encode_frame(frame: &SimulationFrame) -> bincode::Result<Vec<u8>> {
    bincode::serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> bincode::Result<SimulationFrame> {
    bincode::deserialize(bytes)
}

pub fn encode_frame_json(frame: &SimulationFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

pub fn decode_frame_json(data: &str) -> serde_json::Result<SimulationFrame> {
    serde_json::from_str(data)
}
