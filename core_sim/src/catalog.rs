//! Read-only game content: building types, resource prices, inventions.
//!
//! Each building type carries a simulation profile made of optional capability
//! blocks; the simulator branches on which blocks are present.

use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::{Deserialize, Deserializer};
use sim_proto::{
    BuildingConstruction, BuildingId, ConstructionPreference, ConstructionResource, DefinitionId,
    InventionId, MapPosition, ResourceId, Scalar,
};
use thiserror::Error;

pub const BUILTIN_CATALOG: &str = include_str!("data/catalog.json");
pub const CATALOG_PATH_ENV: &str = "TYCOON_CATALOG_PATH";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
    f64::deserialize(deserializer).map(Scalar::from_f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingCategory {
    Headquarters,
    Industry,
    Commerce,
    Residence,
    Office,
    Infrastructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Footprint {
    pub width: u32,
    pub height: u32,
}

impl Footprint {
    /// Whether two footprints anchored at the given positions share a tile.
    pub fn overlaps(self, at: MapPosition, other: Footprint, other_at: MapPosition) -> bool {
        at.x < other_at.x + other.width
            && other_at.x < at.x + self.width
            && at.y < other_at.y + other.height
            && other_at.y < at.y + self.height
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstructionRequirement {
    pub resource_id: ResourceId,
    #[serde(deserialize_with = "scalar")]
    pub quantity: Scalar,
    #[serde(deserialize_with = "scalar")]
    pub max_velocity: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaborRequirement {
    pub resource_id: ResourceId,
    #[serde(deserialize_with = "scalar")]
    pub min_velocity: Scalar,
    #[serde(deserialize_with = "scalar")]
    pub max_velocity: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRequirement {
    pub resource_id: ResourceId,
    #[serde(deserialize_with = "scalar")]
    pub max_velocity: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowRequirement {
    pub resource_id: ResourceId,
    #[serde(deserialize_with = "scalar")]
    pub max_velocity: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityBlock {
    #[serde(deserialize_with = "scalar")]
    pub capacity: Scalar,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulationDefinition {
    pub labor: Option<Vec<LaborRequirement>>,
    pub services: Option<Vec<ServiceRequirement>>,
    pub inputs: Option<Vec<FlowRequirement>>,
    pub outputs: Option<Vec<FlowRequirement>>,
    pub storage: Option<CapacityBlock>,
    pub residence: Option<CapacityBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildingDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub category: BuildingCategory,
    pub footprint: Footprint,
    #[serde(default)]
    pub construction: Vec<ConstructionRequirement>,
    #[serde(default)]
    pub simulation: SimulationDefinition,
    #[serde(default)]
    pub seals: Vec<String>,
}

impl BuildingDefinition {
    pub fn is_headquarters(&self) -> bool {
        self.category == BuildingCategory::Headquarters
    }

    /// Construction schedule with every required quantity scaled by `factor`.
    pub fn construction_schedule(
        &self,
        building_id: BuildingId,
        factor: Scalar,
        preferences: &std::collections::BTreeMap<ResourceId, ConstructionPreference>,
    ) -> BuildingConstruction {
        let resources = self
            .construction
            .iter()
            .map(|requirement| {
                let mut resource = ConstructionResource::new(
                    requirement.resource_id.clone(),
                    requirement.quantity * factor,
                    requirement.max_velocity,
                );
                if let Some(preference) = preferences.get(&requirement.resource_id) {
                    resource.max_price = preference.max_price;
                    resource.min_quality = preference.min_quality;
                }
                resource
            })
            .collect();
        BuildingConstruction {
            building_id,
            resources,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceType {
    pub id: ResourceId,
    #[serde(deserialize_with = "scalar")]
    pub base_price: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventionDefinition {
    pub id: InventionId,
    #[serde(deserialize_with = "scalar")]
    pub cost: Scalar,
    #[serde(default)]
    pub prerequisites: Vec<InventionId>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    resources: Vec<ResourceType>,
    #[serde(default)]
    buildings: Vec<BuildingDefinition>,
    #[serde(default)]
    inventions: Vec<InventionDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    buildings: HashMap<DefinitionId, BuildingDefinition>,
    resources: HashMap<ResourceId, ResourceType>,
    inventions: HashMap<InventionId, InventionDefinition>,
}

impl Catalog {
    pub fn builtin() -> Arc<Self> {
        Arc::new(Self::from_json_str(BUILTIN_CATALOG).expect("builtin catalog should parse"))
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Ok(Self::from_parts(
            document.resources,
            document.buildings,
            document.inventions,
        ))
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json_str(&contents)?)
    }

    pub fn from_parts(
        resources: Vec<ResourceType>,
        buildings: Vec<BuildingDefinition>,
        inventions: Vec<InventionDefinition>,
    ) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|resource| (resource.id.clone(), resource))
                .collect(),
            buildings: buildings
                .into_iter()
                .map(|definition| (definition.id.clone(), definition))
                .collect(),
            inventions: inventions
                .into_iter()
                .map(|invention| (invention.id.clone(), invention))
                .collect(),
        }
    }

    pub fn building(&self, id: &DefinitionId) -> Option<&BuildingDefinition> {
        self.buildings.get(id)
    }

    pub fn resource_price(&self, id: &ResourceId) -> Option<Scalar> {
        self.resources.get(id).map(|resource| resource.base_price)
    }

    pub fn invention(&self, id: &InventionId) -> Option<&InventionDefinition> {
        self.inventions.get(id)
    }

    /// Largest footprint extent, used to widen spatial lookups.
    pub fn max_footprint(&self) -> u32 {
        self.buildings
            .values()
            .map(|definition| definition.footprint.width.max(definition.footprint.height))
            .max()
            .unwrap_or(1)
    }
}

/// Shared handle to the catalog for the tick pipeline.
#[derive(Resource, Debug, Clone)]
pub struct CatalogHandle(pub Arc<Catalog>);

impl CatalogHandle {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self(catalog)
    }

    pub fn get(&self) -> Arc<Catalog> {
        Arc::clone(&self.0)
    }
}

pub fn load_catalog() -> Arc<Catalog> {
    if let Ok(path) = env::var(CATALOG_PATH_ENV) {
        let path = PathBuf::from(path);
        match Catalog::from_file(&path) {
            Ok(catalog) => {
                tracing::info!(
                    target: "tycoon::config",
                    path = %path.display(),
                    "catalog.loaded=file"
                );
                return Arc::new(catalog);
            }
            Err(err) => {
                tracing::warn!(
                    target: "tycoon::config",
                    path = %path.display(),
                    error = %err,
                    "catalog.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "tycoon::config", "catalog.loaded=builtin");
    Catalog::builtin()
}
