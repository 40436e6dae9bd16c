//! The per-planet tick pipeline.
//!
//! A headless bevy [`App`] whose `Update` schedule is one tick:
//! begin → advance clock → buildings → headquarters aggregation → research →
//! assemble frame. The app owns the planet replica; authority mutations are
//! absorbed between ticks and each tick leaves one encoded frame in the
//! [`FrameOutbox`], stamped with the epoch of the snapshot the replica was
//! last synced from.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use bevy::prelude::*;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use sim_proto::{
    codec, BuildingDelta, BuildingId, CompanyId, NotificationEnvelope, Planet, ResearchDelta,
    SimulationFrame,
};

use crate::buildings::{aggregate_headquarters, simulate_buildings, BuildingRules, BuildingTickOutput};
use crate::catalog::{Catalog, CatalogHandle};
use crate::config::SimulationConfig;
use crate::finances::SimulationFinancesFrame;
use crate::hub::NotificationLink;
use crate::metrics::TickMetrics;
use crate::model::PlanetModel;
use crate::network::FramePublisher;
use crate::research::{simulate_research, ResearchRules, ResearchTickOutput};
use crate::sync::{resync_planet, ReplicaSync, ResyncReason, SnapshotSource};

#[derive(Resource, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulationTick(pub u64);

/// Companies whose research pipeline still has work.
#[derive(Resource, Debug, Default, Clone)]
pub struct ResearchTracking(pub BTreeSet<CompanyId>);

/// Buildings the loop has already simulated at least once.
#[derive(Resource, Debug, Default, Clone)]
pub struct SimulationRoster {
    known: BTreeSet<BuildingId>,
}

impl SimulationRoster {
    pub fn from_model(model: &PlanetModel) -> Self {
        Self {
            known: model.buildings.ids().into_iter().collect(),
        }
    }
}

/// Intermediate results handed from one tick stage to the next.
#[derive(Resource, Debug, Default)]
pub struct TickWork {
    started: Option<Instant>,
    planet: Option<Planet>,
    buildings: BuildingTickOutput,
    research: ResearchTickOutput,
}

#[derive(Resource, Debug, Default)]
pub struct FrameOutbox {
    pub last: Option<SimulationFrame>,
    pub encoded: Option<Vec<u8>>,
}

pub fn build_planet_app(config: SimulationConfig, catalog: Arc<Catalog>, model: PlanetModel) -> App {
    let mut app = App::new();

    let tracking = ResearchTracking(model.companies_with_research());
    let roster = SimulationRoster::from_model(&model);
    let ledger = SimulationFinancesFrame::open(&model);
    let metrics = TickMetrics {
        planet_id: model.planet_id,
        ..Default::default()
    };

    app.insert_resource(config)
        .insert_resource(CatalogHandle::new(catalog))
        .insert_resource(SimulationTick::default())
        .insert_resource(tracking)
        .insert_resource(roster)
        .insert_resource(ledger)
        .insert_resource(metrics)
        .insert_resource(TickWork::default())
        .insert_resource(FrameOutbox::default())
        .insert_resource(ReplicaSync::default())
        .insert_resource(model)
        .add_plugins(MinimalPlugins)
        .add_systems(
            Update,
            (
                begin_tick,
                advance_planet,
                step_buildings,
                aggregate_headquarter_demand,
                step_research,
                assemble_frame,
            )
                .chain(),
        );

    app
}

/// Run one tick and return the frame it produced.
pub fn run_tick(app: &mut App) -> Option<SimulationFrame> {
    app.update();
    app.world.resource::<FrameOutbox>().last.clone()
}

/// Fold an authority broadcast into the replica. Only mutation-sourced
/// updates for this planet are taken, in sequence; frame echoes describe
/// state this loop produced. A resync request for the current epoch, or a
/// missed mutation, marks the replica stale instead.
pub fn absorb_notification(app: &mut App, envelope: &NotificationEnvelope) -> bool {
    let planet_id = app.world.resource::<PlanetModel>().planet_id;
    if !app
        .world
        .resource_mut::<ReplicaSync>()
        .admit(planet_id, envelope)
    {
        return false;
    }
    let changed = app
        .world
        .resource_mut::<PlanetModel>()
        .absorb_authored(&envelope.notification);
    if !changed.is_empty() {
        app.world
            .resource_mut::<ResearchTracking>()
            .0
            .extend(changed);
    }
    true
}

/// Fixed-cadence loop: absorb mutations, reload a snapshot when the replica
/// went stale, tick, publish, sleep the remainder of the period. No tick runs
/// until a snapshot is installed, so the first one is fetched before anything
/// else. Returns the number of ticks run once `shutdown` fires or closes.
pub fn run_planet_loop(
    app: &mut App,
    publisher: &FramePublisher,
    link: &NotificationLink,
    snapshots: &dyn SnapshotSource,
    shutdown: &Receiver<()>,
    period: Duration,
) -> u64 {
    let mut ticks = 0;
    let mut connections = link.connections();
    app.world
        .resource_mut::<ReplicaSync>()
        .request(ResyncReason::Startup);
    loop {
        let started = Instant::now();
        let seen = link.connections();
        if seen != connections {
            connections = seen;
            app.world
                .resource_mut::<ReplicaSync>()
                .request(ResyncReason::Reconnected);
        }
        if publisher.take_overflow() {
            app.world
                .resource_mut::<ReplicaSync>()
                .request(ResyncReason::BacklogOverflow);
        }
        for envelope in link.inbound().try_iter() {
            absorb_notification(app, &envelope);
        }

        let in_step = match app.world.resource::<ReplicaSync>().pending() {
            None => true,
            Some(_) => match resync_planet(app, snapshots) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: "tycoon::simulation", error = %err, "replica.resync_failed");
                    false
                }
            },
        };
        if in_step {
            app.update();
            ticks += 1;
            if let Some(bytes) = app.world.resource_mut::<FrameOutbox>().encoded.take() {
                publisher.publish(bytes);
            }
        }

        let remaining = period.saturating_sub(started.elapsed());
        match shutdown.recv_timeout(remaining) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(target: "tycoon::simulation", ticks, "planet_loop.stopped");
    ticks
}

pub fn begin_tick(
    mut tick: ResMut<SimulationTick>,
    model: Res<PlanetModel>,
    mut ledger: ResMut<SimulationFinancesFrame>,
    mut work: ResMut<TickWork>,
) {
    tick.0 += 1;
    ledger.reset(&model);
    *work = TickWork {
        started: Some(Instant::now()),
        ..Default::default()
    };
}

pub fn advance_planet(
    config: Res<SimulationConfig>,
    mut model: ResMut<PlanetModel>,
    mut work: ResMut<TickWork>,
) {
    let mut planet = model.planet_snapshot();
    planet.advance(config.tick_hours, config.hours_per_season);
    model.planet.replicate(planet.clone());
    work.planet = Some(planet);
}

pub fn step_buildings(
    config: Res<SimulationConfig>,
    catalog: Res<CatalogHandle>,
    model: Res<PlanetModel>,
    mut ledger: ResMut<SimulationFinancesFrame>,
    mut work: ResMut<TickWork>,
) {
    let rules = BuildingRules::from_config(&config, model.planet_snapshot().time);
    work.buildings = simulate_buildings(&model, &catalog.0, &rules, &mut ledger);
}

pub fn aggregate_headquarter_demand(
    catalog: Res<CatalogHandle>,
    model: Res<PlanetModel>,
    mut work: ResMut<TickWork>,
) {
    aggregate_headquarters(&mut work.buildings, &model, &catalog.0);
}

pub fn step_research(
    config: Res<SimulationConfig>,
    catalog: Res<CatalogHandle>,
    model: Res<PlanetModel>,
    tracking: Res<ResearchTracking>,
    mut ledger: ResMut<SimulationFinancesFrame>,
    mut work: ResMut<TickWork>,
) {
    let rules = ResearchRules {
        period_ticks: config.research_period_ticks,
        completed_rebate: config.research_rebate(),
    };
    work.research = simulate_research(&model, &catalog.0, &rules, &tracking.0, &mut ledger);
}

#[allow(clippy::too_many_arguments)]
pub fn assemble_frame(
    tick: Res<SimulationTick>,
    mut model: ResMut<PlanetModel>,
    ledger: Res<SimulationFinancesFrame>,
    mut work: ResMut<TickWork>,
    mut roster: ResMut<SimulationRoster>,
    mut tracking: ResMut<ResearchTracking>,
    mut outbox: ResMut<FrameOutbox>,
    mut metrics: ResMut<TickMetrics>,
    sync: Res<ReplicaSync>,
) {
    let work = std::mem::take(&mut *work);
    let planet = work.planet.unwrap_or_else(|| model.planet_snapshot());
    let buildings = work.buildings;
    let research = work.research;

    let mut added = Vec::new();
    for id in model.buildings.ids() {
        if !buildings.deleted_buildings.contains(&id) && roster.known.insert(id) {
            added.push(id);
        }
    }

    for building in buildings.updated_buildings.values() {
        model.buildings.replicate(building.clone());
    }
    for construction in buildings.updated_constructions.values() {
        model.constructions.replicate(construction.clone());
    }
    for id in &buildings.deleted_constructions {
        model.constructions.replicate_removal(id);
    }
    for entry in buildings.updated_metrics.values() {
        model.metrics.replicate(entry.clone());
    }
    for id in &buildings.deleted_buildings {
        model.replicate_building_removal(*id);
        roster.known.remove(id);
    }
    for summary in research.summaries.values() {
        model.inventions.replicate(summary.clone());
    }
    for company_id in &research.dropped {
        tracking.0.remove(company_id);
    }
    ledger.commit(&mut model);

    let totals = ledger.totals();
    *metrics = TickMetrics {
        planet_id: model.planet_id,
        tick: tick.0,
        planet_time: planet.time,
        buildings_simulated: buildings.simulated,
        buildings_deleted: buildings.deleted_buildings.len(),
        buildings_skipped: buildings.skipped,
        construction_spend: totals.construction,
        labor_spend: totals.labor,
        research_spend: totals.research,
        refunds: totals.refunds,
        research_companies: tracking.0.len(),
        issues: buildings.issues.len() + research.issues.len(),
        compute_time: work
            .started
            .map(|started| started.elapsed())
            .unwrap_or_default(),
    };

    let frame = SimulationFrame::new(
        tick.0,
        planet,
        ledger.delta(),
        ResearchDelta {
            summaries: research.summaries.into_values().collect(),
            completed: research.completed,
        },
        BuildingDelta {
            added_building_ids: added,
            updated_buildings: buildings.updated_buildings.into_values().collect(),
            deleted_building_ids: buildings.deleted_buildings.into_iter().collect(),
            updated_constructions: buildings.updated_constructions.into_values().collect(),
            deleted_construction_ids: buildings.deleted_constructions.into_iter().collect(),
            updated_metrics: buildings.updated_metrics.into_values().collect(),
        },
    )
    .with_epoch(sync.epoch())
    .finalize();

    outbox.encoded = match codec::encode_message(&frame) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            error!(
                target: "tycoon::simulation",
                tick = frame.tick,
                error = %err,
                "frame.encode_failed"
            );
            None
        }
    };
    outbox.last = Some(frame);
    metrics.log();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    use bevy::ecs::system::RunSystemOnce;
    use crossbeam_channel::{bounded, unbounded};
    use sim_proto::{
        Company, CorporationId, ErrorCode, Notification, PlanetId, PlanetState, Scalar, TycoonId,
    };

    use crate::hub::{start_notification_hub, NotificationHub, NotificationSink};
    use crate::network::{start_frame_publisher, subscribe_frames};
    use crate::sync::SyncError;

    struct FixedSnapshot {
        state: Option<PlanetState>,
        fetched: Cell<u32>,
    }

    impl SnapshotSource for FixedSnapshot {
        fn fetch(&self, _planet_id: PlanetId) -> Result<PlanetState, SyncError> {
            self.fetched.set(self.fetched.get() + 1);
            self.state
                .clone()
                .ok_or(SyncError::Refused(ErrorCode::NoPlanet))
        }
    }

    fn company(id: u64) -> Company {
        Company {
            id: CompanyId(id),
            tycoon_id: TycoonId(1),
            corporation_id: CorporationId(1),
            name: format!("Company {id}"),
            seal_id: "retail".into(),
        }
    }

    fn connected_link() -> (NotificationHub, NotificationLink) {
        let (events, _) = unbounded();
        let hub = start_notification_hub("127.0.0.1:0".parse().unwrap(), events).unwrap();
        let link = NotificationLink::connect(hub.local_addr(), Duration::from_millis(10)).unwrap();
        while hub.subscriber_count() == 0 || link.connections() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        (hub, link)
    }

    fn empty_planet_app() -> App {
        build_planet_app(
            SimulationConfig::default(),
            Catalog::builtin(),
            PlanetModel::in_memory(PlanetId(1)),
        )
    }

    fn world_with_model() -> World {
        let mut world = World::default();
        world.insert_resource(SimulationConfig::default());
        world.insert_resource(PlanetModel::in_memory(PlanetId(1)));
        world.insert_resource(TickWork::default());
        world
    }

    #[test]
    fn advance_planet_moves_the_clock_by_one_step() {
        let mut world = world_with_model();
        world.run_system_once(advance_planet);
        world.run_system_once(advance_planet);
        let model = world.resource::<PlanetModel>();
        assert_eq!(model.planet_snapshot().time, 2);
        assert_eq!(model.dirty_count(), 0);
    }

    #[test]
    fn begin_tick_resets_the_ledger_from_model_balances() {
        let mut world = world_with_model();
        world.insert_resource(SimulationTick(4));
        world.insert_resource(SimulationFinancesFrame::default());
        world.run_system_once(begin_tick);
        assert_eq!(world.resource::<SimulationTick>().0, 5);
        assert_eq!(
            world.resource::<SimulationFinancesFrame>().totals().spend(),
            Scalar::ZERO
        );
    }

    #[test]
    fn empty_planet_still_emits_a_verified_frame_each_tick() {
        let mut app = build_planet_app(
            SimulationConfig::default(),
            Catalog::builtin(),
            PlanetModel::in_memory(PlanetId(3)),
        );
        let first = run_tick(&mut app).unwrap();
        let second = run_tick(&mut app).unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(second.planet.time, first.planet.time + 1);
        assert!(second.verify());
        assert!(second.buildings.is_empty());
        assert!(app.world.resource::<FrameOutbox>().encoded.is_some());

        let metrics = app.world.resource::<TickMetrics>();
        assert_eq!(metrics.tick, 2);
        assert_eq!(metrics.planet_time, second.planet.time);
        assert_eq!(metrics.buildings_simulated, 0);
    }

    #[test]
    fn planet_loop_ticks_on_cadence_and_publishes_every_frame() {
        let period = Duration::from_millis(10);
        let (mut hub, link) = connected_link();
        let publisher = start_frame_publisher("127.0.0.1:0".parse().unwrap(), 256).unwrap();
        let (frames_tx, frames) = unbounded();
        subscribe_frames(
            publisher.local_addr(),
            Duration::from_millis(10),
            frames_tx,
            |frame| frame,
        )
        .unwrap();

        let mut state = PlanetState::new(Planet::new(PlanetId(1), "Terra"));
        state.epoch = 5;
        state.mutation_sequence = 2;
        let snapshots = FixedSnapshot {
            state: Some(state),
            fetched: Cell::new(0),
        };
        let mut app = empty_planet_app();

        let (stop, shutdown) = bounded::<()>(1);
        let driver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            hub.publish(vec![
                NotificationEnvelope::frame(
                    3,
                    Notification::CompanyUpdated {
                        planet_id: PlanetId(1),
                        company: company(6),
                    },
                ),
                NotificationEnvelope::mutation(Notification::CompanyUpdated {
                    planet_id: PlanetId(1),
                    company: company(5),
                })
                .sequenced(3),
            ]);
            thread::sleep(Duration::from_millis(140));
            stop.send(()).unwrap();
            hub
        });

        let started = Instant::now();
        let ticks = run_planet_loop(&mut app, &publisher, &link, &snapshots, &shutdown, period);
        let elapsed = started.elapsed();
        let _hub = driver.join().unwrap();

        assert_eq!(snapshots.fetched.get(), 1);
        assert!(ticks >= 5, "only {ticks} ticks in {elapsed:?}");
        assert!(
            u128::from(ticks) <= elapsed.as_millis() / period.as_millis() + 1,
            "{ticks} ticks in {elapsed:?} overran the period"
        );

        let model = app.world.resource::<PlanetModel>();
        assert!(model.companies.contains(&CompanyId(5)));
        assert!(!model.companies.contains(&CompanyId(6)));
        assert_eq!(app.world.resource::<ReplicaSync>().mutation_sequence(), 3);

        for expected in 1..=ticks {
            let frame = frames.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(frame.tick, expected);
            assert_eq!(frame.planet.time, expected);
            assert_eq!(frame.epoch, 5);
            assert!(frame.verify());
        }
    }

    #[test]
    fn planet_loop_waits_for_a_snapshot_before_ticking() {
        let (_hub, link) = connected_link();
        let publisher = start_frame_publisher("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let snapshots = FixedSnapshot {
            state: None,
            fetched: Cell::new(0),
        };
        let mut app = empty_planet_app();

        let (stop, shutdown) = bounded::<()>(1);
        let driver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.send(()).unwrap();
        });
        let ticks = run_planet_loop(
            &mut app,
            &publisher,
            &link,
            &snapshots,
            &shutdown,
            Duration::from_millis(10),
        );
        driver.join().unwrap();

        assert_eq!(ticks, 0);
        assert!(snapshots.fetched.get() >= 2);
        assert_eq!(
            app.world.resource::<ReplicaSync>().pending(),
            Some(ResyncReason::Startup)
        );
        assert_eq!(app.world.resource::<PlanetModel>().planet_snapshot().time, 0);
    }
}
