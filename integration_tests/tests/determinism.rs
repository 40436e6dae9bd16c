mod common;

use common::*;
use core_sim::run_tick;
use sim_proto::{BuildingSettings, InventionId, InventionSummary, MapPosition, Scalar, SimulationFrame};

fn busy_planet() -> core_sim::PlanetModel {
    let mut world = seeded_model(Scalar::from_i64(20_000));
    for id in 1..=6 {
        place_unbuilt_store(&mut world, id, MapPosition::new(id as u32 * 3, 2));
    }
    let upgraded = place_built_store(&mut world, 7, MapPosition::new(30, 30));
    let mut settings = BuildingSettings::new(upgraded);
    settings.requested_level = 2;
    world.settings.replicate(settings);

    let mut research = InventionSummary::new(COMPANY);
    research.enqueue(InventionId::new("basic-management"));
    research.enqueue(InventionId::new("automation"));
    world.inventions.replicate(research);
    world
}

fn run_simulation(ticks: usize) -> Vec<SimulationFrame> {
    let mut app = planet_app(busy_planet());
    (0..ticks)
        .map(|_| run_tick(&mut app).expect("frame"))
        .collect()
}

#[test]
fn deterministic_frames_match() {
    let frames_a = run_simulation(60);
    let frames_b = run_simulation(60);

    assert_eq!(frames_a.len(), frames_b.len());
    for (a, b) in frames_a.iter().zip(&frames_b) {
        assert_eq!(a.hash, b.hash, "tick {}", a.tick);
        assert_eq!(a, b);
        assert!(a.verify());
    }
}
