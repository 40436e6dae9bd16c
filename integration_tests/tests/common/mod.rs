#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bevy::prelude::App;
use core_sim::{build_planet_app, Catalog, PlanetModel, SimulationConfig};
use sim_proto::{
    Building, BuildingId, BuildingSettings, Company, CompanyId, Corporation, CorporationId,
    DefinitionId, MapPosition, PlanetId, Scalar, Town, TownId, TycoonId,
};

pub const PLANET: PlanetId = PlanetId(1);
pub const TYCOON: TycoonId = TycoonId(7);
pub const CORPORATION: CorporationId = CorporationId(3);
pub const COMPANY: CompanyId = CompanyId(11);
pub const TOWN: TownId = TownId(2);

pub fn test_config() -> SimulationConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("test_simulation_config.json");
    SimulationConfig::from_file(&path).expect("test simulation config")
}

/// A planet holding one tycoon's corporation, company and a town.
pub fn seeded_model(cash: Scalar) -> PlanetModel {
    let mut model = PlanetModel::in_memory(PLANET);
    model.corporations.replicate(Corporation {
        id: CORPORATION,
        tycoon_id: TYCOON,
        planet_id: PLANET,
        name: "Acme Holdings".into(),
        cash,
        company_ids: [COMPANY].into_iter().collect(),
    });
    model.companies.replicate(Company {
        id: COMPANY,
        tycoon_id: TYCOON,
        corporation_id: CORPORATION,
        name: "Acme Retail".into(),
        seal_id: "acme".into(),
    });
    model.towns.replicate(Town {
        id: TOWN,
        name: "Riverton".into(),
        position: MapPosition::new(40, 40),
        cash: Scalar::from_i64(50_000),
    });
    model
}

pub fn store_building(id: u64, position: MapPosition) -> Building {
    Building {
        id: BuildingId(id),
        tycoon_id: TYCOON,
        corporation_id: CORPORATION,
        company_id: COMPANY,
        town_id: TOWN,
        definition_id: DefinitionId::new("store"),
        name: None,
        position,
        level: 1,
        upgrading: false,
        construction_started_at: None,
        construction_finished_at: None,
        condemned_at: None,
    }
}

/// Place a store that still has its full construction ahead of it.
pub fn place_unbuilt_store(model: &mut PlanetModel, id: u64, position: MapPosition) -> BuildingId {
    let catalog = Catalog::builtin();
    let building = store_building(id, position);
    let definition = catalog
        .building(&building.definition_id)
        .expect("builtin store definition");
    model.constructions.replicate(definition.construction_schedule(
        building.id,
        Scalar::ONE,
        &Default::default(),
    ));
    model.settings.replicate(BuildingSettings::new(building.id));
    model.buildings.replicate(building);
    BuildingId(id)
}

/// Place a store that finished construction at hour zero.
pub fn place_built_store(model: &mut PlanetModel, id: u64, position: MapPosition) -> BuildingId {
    let mut building = store_building(id, position);
    building.construction_started_at = Some(0);
    building.construction_finished_at = Some(0);
    model.settings.replicate(BuildingSettings::new(building.id));
    model.buildings.replicate(building);
    BuildingId(id)
}

pub fn planet_app(model: PlanetModel) -> App {
    build_planet_app(test_config(), Catalog::builtin(), model)
}

pub fn planet_app_with(catalog: Arc<Catalog>, model: PlanetModel) -> App {
    build_planet_app(test_config(), catalog, model)
}

pub fn model(app: &App) -> &PlanetModel {
    app.world.resource::<PlanetModel>()
}

pub fn corporation_cash(app: &App) -> Scalar {
    model(app)
        .corporations
        .get(&CORPORATION)
        .map(|corporation| corporation.cash)
        .expect("seeded corporation")
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
