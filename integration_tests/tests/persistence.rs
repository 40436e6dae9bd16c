mod common;

use std::path::PathBuf;

use common::*;
use core_sim::{PlanetModel, RetryPolicy, SqliteDatabase, StoreBackend, StoreMode};
use sim_proto::{BuildingId, MapPosition, Scalar};

fn scratch_store(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("tycoon-{name}-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf, mode: StoreMode) -> PlanetModel {
    let database = SqliteDatabase::open(path, mode).expect("database");
    let mut model = PlanetModel::open(&StoreBackend::Sqlite(database), PLANET).expect("model");
    model.load_all(&RetryPolicy::immediate(1)).expect("load");
    model
}

#[test]
fn flushed_entities_survive_a_restart() {
    let path = scratch_store("restart");
    {
        let mut writer = open(&path, StoreMode::ReadWrite);
        let seeded = seeded_model(Scalar::from_i64(900));
        for corporation in seeded.corporations.all() {
            writer.corporations.update(corporation.clone());
        }
        writer.buildings.update(store_building(1, MapPosition::new(4, 4)));
        writer.buildings.update(store_building(2, MapPosition::new(9, 4)));
        // The planet record is created on first load.
        assert_eq!(writer.dirty_count(), 4);

        let report = writer.flush_all();
        assert_eq!(report.written, 4);
        assert_eq!(writer.dirty_count(), 0);

        writer.remove_building(BuildingId(2));
        writer.flush_all();
        writer.close().expect("close");
    }

    let reader = open(&path, StoreMode::ReadOnly);
    assert!(reader.buildings.contains(&BuildingId(1)));
    assert!(!reader.buildings.contains(&BuildingId(2)));
    assert_eq!(
        reader.corporations.get(&CORPORATION).map(|corporation| corporation.cash),
        Some(Scalar::from_i64(900))
    );
    assert_eq!(reader.buildings_in_chunk(0, 0).len(), 1);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn read_only_models_never_write() {
    let path = scratch_store("read-only");
    {
        let mut writer = open(&path, StoreMode::ReadWrite);
        writer.buildings.update(store_building(1, MapPosition::new(4, 4)));
        writer.flush_all();
        writer.close().expect("close");
    }

    let mut reader = open(&path, StoreMode::ReadOnly);
    assert!(!reader.is_writable());
    reader.buildings.update(store_building(5, MapPosition::new(20, 20)));
    let report = reader.flush_all();
    assert_eq!(report.written, 0);
    reader.close().expect("close");

    let again = open(&path, StoreMode::ReadOnly);
    assert!(again.buildings.contains(&BuildingId(1)));
    assert!(!again.buildings.contains(&BuildingId(5)));
    let _ = std::fs::remove_file(&path);
}
