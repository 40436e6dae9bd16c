use serde::{Deserialize, Serialize};

use crate::economy::{Company, Corporation, InventionSummary, Town};
use crate::records::{
    Building, BuildingConnection, BuildingConstruction, BuildingMetrics, BuildingSettings, Planet,
};

/// The authority's full view of one planet, used to (re)seed a replica.
///
/// `epoch` is issued fresh for every snapshot. `mutation_sequence` is the
/// last mutation broadcast already folded into this state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanetState {
    pub epoch: u64,
    pub mutation_sequence: u64,
    pub planet: Planet,
    pub buildings: Vec<Building>,
    pub constructions: Vec<BuildingConstruction>,
    pub settings: Vec<BuildingSettings>,
    pub metrics: Vec<BuildingMetrics>,
    pub connections: Vec<BuildingConnection>,
    pub companies: Vec<Company>,
    pub corporations: Vec<Corporation>,
    pub towns: Vec<Town>,
    pub inventions: Vec<InventionSummary>,
}

impl PlanetState {
    pub fn new(planet: Planet) -> Self {
        Self {
            epoch: 0,
            mutation_sequence: 0,
            planet,
            buildings: Vec::new(),
            constructions: Vec::new(),
            settings: Vec::new(),
            metrics: Vec::new(),
            connections: Vec::new(),
            companies: Vec::new(),
            corporations: Vec::new(),
            towns: Vec::new(),
            inventions: Vec::new(),
        }
    }
}
