use core_sim::{build_planet_app, run_tick, Catalog, PlanetModel, SimulationConfig};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use sim_proto::{
    Building, BuildingId, Company, CompanyId, Corporation, CorporationId, DefinitionId,
    MapPosition, PlanetId, Scalar, Town, TownId, TycoonId,
};

fn seeded_model(buildings: u64) -> PlanetModel {
    let catalog = Catalog::builtin();
    let mut model = PlanetModel::in_memory(PlanetId(1));
    model.corporations.replicate(Corporation {
        id: CorporationId(1),
        tycoon_id: TycoonId(1),
        planet_id: PlanetId(1),
        name: "Bench".into(),
        cash: Scalar::from_i64(1_000_000_000),
        company_ids: [CompanyId(1)].into_iter().collect(),
    });
    model.companies.replicate(Company {
        id: CompanyId(1),
        tycoon_id: TycoonId(1),
        corporation_id: CorporationId(1),
        name: "Bench Co".into(),
        seal_id: "bench".into(),
    });
    model.towns.replicate(Town {
        id: TownId(1),
        name: "Benchville".into(),
        position: MapPosition::new(0, 0),
        cash: Scalar::from_i64(1_000_000),
    });

    let store = DefinitionId::new("store");
    let definition = catalog.building(&store).expect("builtin store definition");
    for id in 1..=buildings {
        let building_id = BuildingId(id);
        model.buildings.replicate(Building {
            id: building_id,
            tycoon_id: TycoonId(1),
            corporation_id: CorporationId(1),
            company_id: CompanyId(1),
            town_id: TownId(1),
            definition_id: store.clone(),
            name: None,
            position: MapPosition::new((id % 100) as u32 * 2, (id / 100) as u32 * 2),
            level: 1,
            upgrading: false,
            construction_started_at: None,
            construction_finished_at: None,
            condemned_at: None,
        });
        model.constructions.replicate(definition.construction_schedule(
            building_id,
            Scalar::ONE,
            &Default::default(),
        ));
    }
    model
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for size in [100u64, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::new("buildings", size), &size, |b, &size| {
            b.iter_batched(
                || build_planet_app(SimulationConfig::default(), Catalog::builtin(), seeded_model(size)),
                |mut app| {
                    run_tick(&mut app);
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(tick_benches, bench_tick);
criterion_main!(tick_benches);
