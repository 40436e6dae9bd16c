//! One planet's entity caches and the rules for merging replicated updates.
//!
//! Three roles share this type:
//! - the model authority owns the canonical copy and applies simulation frames;
//! - the simulation loop keeps a replica and absorbs authority mutations;
//! - front-end workers keep a replica and take every notification verbatim.
//!
//! Fields are split by owner. The simulation owns building level, upgrade flag
//! and construction timestamps, constructions, metrics, cash balances and
//! research progress. The authority owns everything else.

use std::collections::{BTreeMap, BTreeSet};

use bevy::prelude::Resource;
use sim_proto::{
    Building, BuildingConnection, BuildingConstruction, BuildingId, BuildingMetrics,
    BuildingSettings, Company, CompanyId, ConnectionId, Corporation, CorporationId,
    InventionSummary, MapPosition, Notification, NotificationEnvelope, Planet, PlanetId,
    PlanetState, SimulationFrame, Town, TownId,
};
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheError, FlushReport, IndexKey, RetryPolicy, WriteBehindCache};
use crate::store::{MemoryDatabase, StoreBackend, StoreError, StoreMode, StoreRecord};

impl StoreRecord for Planet {
    const KIND: &'static str = "planets";
}

impl CacheEntry for Planet {
    type Id = PlanetId;

    fn id(&self) -> PlanetId {
        self.id
    }
}

impl StoreRecord for Building {
    const KIND: &'static str = "buildings";
}

impl CacheEntry for Building {
    type Id = BuildingId;

    fn id(&self) -> BuildingId {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey> {
        let (x, y) = self.position.chunk();
        vec![
            IndexKey::Company(self.company_id),
            IndexKey::Corporation(self.corporation_id),
            IndexKey::Tycoon(self.tycoon_id),
            IndexKey::Town(self.town_id),
            IndexKey::Chunk { x, y },
        ]
    }
}

impl StoreRecord for BuildingConstruction {
    const KIND: &'static str = "building_constructions";
}

impl CacheEntry for BuildingConstruction {
    type Id = BuildingId;

    fn id(&self) -> BuildingId {
        self.building_id
    }
}

impl StoreRecord for BuildingSettings {
    const KIND: &'static str = "building_settings";
}

impl CacheEntry for BuildingSettings {
    type Id = BuildingId;

    fn id(&self) -> BuildingId {
        self.building_id
    }
}

impl StoreRecord for BuildingMetrics {
    const KIND: &'static str = "building_metrics";
}

impl CacheEntry for BuildingMetrics {
    type Id = BuildingId;

    fn id(&self) -> BuildingId {
        self.building_id
    }
}

impl StoreRecord for BuildingConnection {
    const KIND: &'static str = "building_connections";
}

impl CacheEntry for BuildingConnection {
    type Id = ConnectionId;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey> {
        vec![
            IndexKey::Source(self.source_building_id),
            IndexKey::Sink(self.sink_building_id),
        ]
    }
}

impl StoreRecord for Company {
    const KIND: &'static str = "companies";
}

impl CacheEntry for Company {
    type Id = CompanyId;

    fn id(&self) -> CompanyId {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey> {
        vec![
            IndexKey::Corporation(self.corporation_id),
            IndexKey::Tycoon(self.tycoon_id),
        ]
    }
}

impl StoreRecord for Corporation {
    const KIND: &'static str = "corporations";
}

impl CacheEntry for Corporation {
    type Id = CorporationId;

    fn id(&self) -> CorporationId {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey> {
        vec![IndexKey::Tycoon(self.tycoon_id)]
    }
}

impl StoreRecord for Town {
    const KIND: &'static str = "towns";
}

impl CacheEntry for Town {
    type Id = TownId;

    fn id(&self) -> TownId {
        self.id
    }
}

impl StoreRecord for InventionSummary {
    const KIND: &'static str = "invention_summaries";
}

impl CacheEntry for InventionSummary {
    type Id = CompanyId;

    fn id(&self) -> CompanyId {
        self.company_id
    }
}

/// Everything removed when a building goes away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemovedBuilding {
    pub building: Option<Building>,
    pub had_construction: bool,
    pub connections: Vec<ConnectionId>,
}

#[derive(Resource)]
pub struct PlanetModel {
    pub planet_id: PlanetId,
    pub planet: WriteBehindCache<Planet>,
    pub buildings: WriteBehindCache<Building>,
    pub constructions: WriteBehindCache<BuildingConstruction>,
    pub settings: WriteBehindCache<BuildingSettings>,
    pub metrics: WriteBehindCache<BuildingMetrics>,
    pub connections: WriteBehindCache<BuildingConnection>,
    pub companies: WriteBehindCache<Company>,
    pub corporations: WriteBehindCache<Corporation>,
    pub towns: WriteBehindCache<Town>,
    pub inventions: WriteBehindCache<InventionSummary>,
    mode: StoreMode,
}

impl PlanetModel {
    pub fn open(backend: &StoreBackend, planet_id: PlanetId) -> Result<Self, StoreError> {
        Ok(Self {
            planet_id,
            planet: WriteBehindCache::new(backend.open()?),
            buildings: WriteBehindCache::new(backend.open()?),
            constructions: WriteBehindCache::new(backend.open()?),
            settings: WriteBehindCache::new(backend.open()?),
            metrics: WriteBehindCache::new(backend.open()?),
            connections: WriteBehindCache::new(backend.open()?),
            companies: WriteBehindCache::new(backend.open()?),
            corporations: WriteBehindCache::new(backend.open()?),
            towns: WriteBehindCache::new(backend.open()?),
            inventions: WriteBehindCache::new(backend.open()?),
            mode: backend.mode(),
        })
    }

    /// Model over a private in-memory backend.
    pub fn in_memory(planet_id: PlanetId) -> Self {
        let backend = StoreBackend::memory(MemoryDatabase::new(), StoreMode::ReadWrite);
        Self::open(&backend, planet_id).expect("memory stores open infallibly")
    }

    pub fn is_writable(&self) -> bool {
        self.mode.is_writable()
    }

    pub fn load_all(&mut self, policy: &RetryPolicy) -> Result<(), CacheError> {
        self.planet.load(policy)?;
        self.buildings.load(policy)?;
        self.constructions.load(policy)?;
        self.settings.load(policy)?;
        self.metrics.load(policy)?;
        self.connections.load(policy)?;
        self.companies.load(policy)?;
        self.corporations.load(policy)?;
        self.towns.load(policy)?;
        self.inventions.load(policy)?;

        if !self.planet.contains(&self.planet_id) {
            let planet = Planet::new(self.planet_id, format!("Planet {}", self.planet_id));
            if self.is_writable() {
                self.planet.update(planet);
            } else {
                self.planet.replicate(planet);
            }
        }
        info!(
            target: "tycoon::cache",
            planet = %self.planet_id,
            buildings = self.buildings.len(),
            companies = self.companies.len(),
            "planet_model.loaded"
        );
        Ok(())
    }

    /// Write every dirty entry. A read-only model never persists.
    pub fn flush_all(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if !self.is_writable() {
            return report;
        }
        report.merge(self.planet.flush());
        report.merge(self.buildings.flush());
        report.merge(self.constructions.flush());
        report.merge(self.settings.flush());
        report.merge(self.metrics.flush());
        report.merge(self.connections.flush());
        report.merge(self.companies.flush());
        report.merge(self.corporations.flush());
        report.merge(self.towns.flush());
        report.merge(self.inventions.flush());
        report
    }

    pub fn dirty_count(&self) -> usize {
        self.planet.dirty_count()
            + self.buildings.dirty_count()
            + self.constructions.dirty_count()
            + self.settings.dirty_count()
            + self.metrics.dirty_count()
            + self.connections.dirty_count()
            + self.companies.dirty_count()
            + self.corporations.dirty_count()
            + self.towns.dirty_count()
            + self.inventions.dirty_count()
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        self.planet.close()?;
        self.buildings.close()?;
        self.constructions.close()?;
        self.settings.close()?;
        self.metrics.close()?;
        self.connections.close()?;
        self.companies.close()?;
        self.corporations.close()?;
        self.towns.close()?;
        self.inventions.close()
    }

    pub fn planet_snapshot(&self) -> Planet {
        self.planet
            .get(&self.planet_id)
            .cloned()
            .unwrap_or_else(|| Planet::new(self.planet_id, format!("Planet {}", self.planet_id)))
    }

    pub fn buildings_in_chunk(&self, x: u32, y: u32) -> Vec<&Building> {
        self.buildings.by_index(&IndexKey::Chunk { x, y })
    }

    /// Reserve a fresh building id on the planet record, which marks it dirty
    /// so the counter survives a restart.
    pub fn allocate_building_id(&mut self) -> BuildingId {
        let highest = self
            .buildings
            .ids()
            .last()
            .map_or(0, |BuildingId(last)| *last);
        let mut planet = self.planet_snapshot();
        let id = planet.allocate_building_id(highest);
        self.planet.update(planet);
        id
    }

    /// Copy of every entry, stamped for a replica to reseed from.
    pub fn state(&self, epoch: u64, mutation_sequence: u64) -> PlanetState {
        fn owned<T: Clone>(entries: Vec<&T>) -> Vec<T> {
            entries.into_iter().cloned().collect()
        }
        PlanetState {
            epoch,
            mutation_sequence,
            planet: self.planet_snapshot(),
            buildings: owned(self.buildings.all()),
            constructions: owned(self.constructions.all()),
            settings: owned(self.settings.all()),
            metrics: owned(self.metrics.all()),
            connections: owned(self.connections.all()),
            companies: owned(self.companies.all()),
            corporations: owned(self.corporations.all()),
            towns: owned(self.towns.all()),
            inventions: owned(self.inventions.all()),
        }
    }

    /// Replica side: replace every cache with the snapshot's contents.
    pub fn replicate_state(&mut self, state: &PlanetState) {
        self.planet.replicate_snapshot([state.planet.clone()]);
        self.buildings.replicate_snapshot(state.buildings.iter().cloned());
        self.constructions
            .replicate_snapshot(state.constructions.iter().cloned());
        self.settings.replicate_snapshot(state.settings.iter().cloned());
        self.metrics.replicate_snapshot(state.metrics.iter().cloned());
        self.connections
            .replicate_snapshot(state.connections.iter().cloned());
        self.companies.replicate_snapshot(state.companies.iter().cloned());
        self.corporations
            .replicate_snapshot(state.corporations.iter().cloned());
        self.towns.replicate_snapshot(state.towns.iter().cloned());
        self.inventions
            .replicate_snapshot(state.inventions.iter().cloned());
    }

    pub fn nearest_town(&self, position: MapPosition) -> Option<&Town> {
        self.towns
            .all()
            .into_iter()
            .min_by_key(|town| (town.position.distance_squared(position), town.id))
    }

    /// Remove a building and everything hanging off it, marking all dirty.
    pub fn remove_building(&mut self, building_id: BuildingId) -> RemovedBuilding {
        let connections = self.connections_touching(building_id);
        for id in &connections {
            self.connections.remove(id);
        }
        let had_construction = self.constructions.remove(&building_id).is_some();
        self.settings.remove(&building_id);
        self.metrics.remove(&building_id);
        RemovedBuilding {
            building: self.buildings.remove(&building_id),
            had_construction,
            connections,
        }
    }

    /// Replica counterpart of [`PlanetModel::remove_building`].
    pub fn replicate_building_removal(&mut self, building_id: BuildingId) -> RemovedBuilding {
        let connections = self.connections_touching(building_id);
        for id in &connections {
            self.connections.replicate_removal(id);
        }
        let had_construction = self.constructions.replicate_removal(&building_id).is_some();
        self.settings.replicate_removal(&building_id);
        self.metrics.replicate_removal(&building_id);
        RemovedBuilding {
            building: self.buildings.replicate_removal(&building_id),
            had_construction,
            connections,
        }
    }

    fn connections_touching(&self, building_id: BuildingId) -> Vec<ConnectionId> {
        let mut ids: BTreeSet<ConnectionId> = self
            .connections
            .ids_by_index(&IndexKey::Source(building_id))
            .into_iter()
            .collect();
        ids.extend(self.connections.ids_by_index(&IndexKey::Sink(building_id)));
        ids.into_iter().collect()
    }

    /// Authority side: fold a simulation frame into the canonical caches and
    /// return the notifications describing what changed.
    pub fn apply_frame(&mut self, frame: &SimulationFrame) -> Vec<NotificationEnvelope> {
        let tick = frame.tick;
        let planet_id = self.planet_id;
        let mut notifications = Vec::new();

        let mut planet = self.planet_snapshot();
        planet.absorb_simulated(&frame.planet);
        self.planet.update(planet.clone());
        notifications.push(NotificationEnvelope::frame(
            tick,
            Notification::PlanetUpdated { planet },
        ));

        let mut updated_buildings = Vec::new();
        for simulated in &frame.buildings.updated_buildings {
            let Some(existing) = self.buildings.get(&simulated.id) else {
                debug!(
                    target: "tycoon::authority",
                    building = %simulated.id,
                    "frame.building_unknown"
                );
                continue;
            };
            let mut merged = existing.clone();
            merged.absorb_simulated(simulated);
            if &merged != existing {
                self.buildings.update(merged.clone());
                updated_buildings.push(merged);
            }
        }
        if !updated_buildings.is_empty() {
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::BuildingsUpdated {
                    planet_id,
                    buildings: updated_buildings,
                },
            ));
        }

        let constructions: Vec<BuildingConstruction> = frame
            .buildings
            .updated_constructions
            .iter()
            .filter(|construction| self.buildings.contains(&construction.building_id))
            .cloned()
            .collect();
        if !constructions.is_empty() {
            self.constructions.update_all(constructions.iter().cloned());
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::ConstructionsUpdated {
                    planet_id,
                    constructions,
                },
            ));
        }

        let mut deleted_constructions: Vec<BuildingId> = frame
            .buildings
            .deleted_construction_ids
            .iter()
            .copied()
            .filter(|id| self.constructions.remove(id).is_some())
            .collect();

        let metrics: Vec<BuildingMetrics> = frame
            .buildings
            .updated_metrics
            .iter()
            .filter(|metrics| self.buildings.contains(&metrics.building_id))
            .cloned()
            .collect();
        if !metrics.is_empty() {
            self.metrics.update_all(metrics.iter().cloned());
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::MetricsUpdated { planet_id, metrics },
            ));
        }

        let mut deleted_buildings = Vec::new();
        for building_id in &frame.buildings.deleted_building_ids {
            let removed = self.remove_building(*building_id);
            if removed.had_construction {
                deleted_constructions.push(*building_id);
            }
            if removed.building.is_some() {
                deleted_buildings.push(*building_id);
            }
        }
        if !deleted_constructions.is_empty() {
            deleted_constructions.sort();
            deleted_constructions.dedup();
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::ConstructionsDeleted {
                    planet_id,
                    building_ids: deleted_constructions,
                },
            ));
        }
        if !deleted_buildings.is_empty() {
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::BuildingsDeleted {
                    planet_id,
                    building_ids: deleted_buildings,
                },
            ));
        }

        for (corporation_id, flow) in &frame.finances.corporations {
            if let Some(corporation) = self.corporations.get(corporation_id) {
                let mut corporation = corporation.clone();
                corporation.cash += flow.net();
                self.corporations.update(corporation.clone());
                notifications.push(NotificationEnvelope::frame(
                    tick,
                    Notification::CorporationUpdated {
                        planet_id,
                        corporation,
                    },
                ));
            }
        }
        for (town_id, flow) in &frame.finances.towns {
            if let Some(town) = self.towns.get(town_id) {
                let mut town = town.clone();
                town.cash += flow.net();
                self.towns.update(town.clone());
                notifications.push(NotificationEnvelope::frame(
                    tick,
                    Notification::TownUpdated { planet_id, town },
                ));
            }
        }

        for progress in &frame.research.summaries {
            let merged = match self.inventions.get(&progress.company_id) {
                Some(intents) => InventionSummary::merge_intents(progress, intents),
                None => progress.clone(),
            };
            self.inventions.update(merged.clone());
            notifications.push(NotificationEnvelope::frame(
                tick,
                Notification::InventionSummaryUpdated {
                    planet_id,
                    summary: merged,
                },
            ));
        }

        notifications
    }

    /// Simulation side: take the authority-owned fields of a mutation
    /// broadcast. Returns companies whose invention summaries changed.
    pub fn absorb_authored(&mut self, notification: &Notification) -> Vec<CompanyId> {
        let mut research_changed = Vec::new();
        match notification {
            Notification::BuildingsUpdated { buildings, .. } => {
                for authored in buildings {
                    let merged = match self.buildings.get(&authored.id) {
                        Some(local) => {
                            let mut merged = local.clone();
                            merged.absorb_authored(authored);
                            merged
                        }
                        None => authored.clone(),
                    };
                    self.buildings.replicate(merged);
                }
            }
            Notification::BuildingsDeleted { building_ids, .. } => {
                for building_id in building_ids {
                    self.replicate_building_removal(*building_id);
                }
            }
            Notification::ConstructionsUpdated { constructions, .. } => {
                for construction in constructions {
                    if !self.constructions.contains(&construction.building_id) {
                        self.constructions.replicate(construction.clone());
                    }
                }
            }
            Notification::SettingsUpdated { settings, .. } => {
                for entry in settings {
                    self.settings.replicate(entry.clone());
                }
            }
            Notification::CompanyUpdated { company, .. } => {
                self.companies.replicate(company.clone());
            }
            Notification::CorporationUpdated { corporation, .. } => {
                let merged = match self.corporations.get(&corporation.id) {
                    Some(local) => {
                        let mut merged = local.clone();
                        merged.absorb_authored(corporation);
                        merged
                    }
                    None => corporation.clone(),
                };
                self.corporations.replicate(merged);
            }
            Notification::TownUpdated { town, .. } => {
                let merged = match self.towns.get(&town.id) {
                    Some(local) => {
                        let mut merged = local.clone();
                        merged.absorb_authored(town);
                        merged
                    }
                    None => town.clone(),
                };
                self.towns.replicate(merged);
            }
            Notification::InventionSummaryUpdated { summary, .. } => {
                let merged = match self.inventions.get(&summary.company_id) {
                    Some(progress) => InventionSummary::merge_intents(progress, summary),
                    None => summary.clone(),
                };
                research_changed.push(merged.company_id);
                self.inventions.replicate(merged);
            }
            Notification::PlanetUpdated { .. }
            | Notification::ConstructionsDeleted { .. }
            | Notification::MetricsUpdated { .. }
            | Notification::SocketConnected { .. }
            | Notification::SocketDisconnected { .. }
            | Notification::ViewMoved { .. }
            | Notification::ResyncRequested { .. } => {}
        }
        research_changed
    }

    /// Front-end side: the authority's record wins wholesale.
    pub fn apply_notification(&mut self, notification: &Notification) {
        match notification {
            Notification::PlanetUpdated { planet } => self.planet.replicate(planet.clone()),
            Notification::BuildingsUpdated { buildings, .. } => {
                for building in buildings {
                    self.buildings.replicate(building.clone());
                }
            }
            Notification::BuildingsDeleted { building_ids, .. } => {
                for building_id in building_ids {
                    self.replicate_building_removal(*building_id);
                }
            }
            Notification::ConstructionsUpdated { constructions, .. } => {
                for construction in constructions {
                    self.constructions.replicate(construction.clone());
                }
            }
            Notification::ConstructionsDeleted { building_ids, .. } => {
                for building_id in building_ids {
                    self.constructions.replicate_removal(building_id);
                }
            }
            Notification::SettingsUpdated { settings, .. } => {
                for entry in settings {
                    self.settings.replicate(entry.clone());
                }
            }
            Notification::MetricsUpdated { metrics, .. } => {
                for entry in metrics {
                    self.metrics.replicate(entry.clone());
                }
            }
            Notification::CompanyUpdated { company, .. } => {
                self.companies.replicate(company.clone())
            }
            Notification::CorporationUpdated { corporation, .. } => {
                self.corporations.replicate(corporation.clone())
            }
            Notification::TownUpdated { town, .. } => self.towns.replicate(town.clone()),
            Notification::InventionSummaryUpdated { summary, .. } => {
                self.inventions.replicate(summary.clone())
            }
            Notification::SocketConnected { .. }
            | Notification::SocketDisconnected { .. }
            | Notification::ViewMoved { .. }
            | Notification::ResyncRequested { .. } => {}
        }
    }

    /// Snapshot of every company's research summary that still has work.
    pub fn companies_with_research(&self) -> BTreeSet<CompanyId> {
        self.inventions
            .all()
            .into_iter()
            .filter(|summary| summary.has_activity())
            .map(|summary| summary.company_id)
            .collect()
    }

    /// Opening cash of every corporation and town, keyed for the ledger.
    pub fn opening_balances(
        &self,
    ) -> (
        BTreeMap<CorporationId, sim_proto::Scalar>,
        BTreeMap<TownId, sim_proto::Scalar>,
    ) {
        let corporations = self
            .corporations
            .all()
            .into_iter()
            .map(|corporation| (corporation.id, corporation.cash))
            .collect();
        let towns = self
            .towns
            .all()
            .into_iter()
            .map(|town| (town.id, town.cash))
            .collect();
        (corporations, towns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_proto::{
        BuildingDelta, Cashflow, DefinitionId, FinancesDelta, InventionId, ResearchDelta, Scalar,
        TycoonId, UpdateSource,
    };

    fn building(id: u64, company: u64) -> Building {
        Building {
            id: BuildingId(id),
            tycoon_id: TycoonId(1),
            corporation_id: CorporationId(1),
            company_id: CompanyId(company),
            town_id: TownId(1),
            definition_id: DefinitionId::new("store"),
            name: None,
            position: MapPosition::new(id as u32 * 3, 0),
            level: 1,
            upgrading: false,
            construction_started_at: None,
            construction_finished_at: None,
            condemned_at: None,
        }
    }

    fn seeded() -> PlanetModel {
        let mut model = PlanetModel::in_memory(PlanetId(1));
        model.corporations.update(Corporation {
            id: CorporationId(1),
            tycoon_id: TycoonId(1),
            planet_id: PlanetId(1),
            name: "Acme".into(),
            cash: Scalar::from_i64(1_000),
            company_ids: [CompanyId(1)].into_iter().collect(),
        });
        model.buildings.update(building(1, 1));
        model.buildings.update(building(2, 1));
        model
    }

    fn frame(tick: u64, planet: Planet) -> SimulationFrame {
        SimulationFrame::new(
            tick,
            planet,
            FinancesDelta::default(),
            ResearchDelta::default(),
            BuildingDelta::default(),
        )
    }

    #[test]
    fn frame_keeps_authority_fields_and_takes_simulation_fields() {
        let mut model = seeded();
        let mut renamed = building(1, 1);
        renamed.name = Some("Flagship".into());
        model.buildings.update(renamed);

        let mut simulated = building(1, 1);
        simulated.construction_started_at = Some(4);
        let mut frame = frame(1, Planet::new(PlanetId(1), "Terra"));
        frame.buildings.updated_buildings.push(simulated);
        model.apply_frame(&frame);

        let merged = model.buildings.get(&BuildingId(1)).unwrap();
        assert_eq!(merged.name.as_deref(), Some("Flagship"));
        assert_eq!(merged.construction_started_at, Some(4));
    }

    #[test]
    fn frame_commits_cash_deltas_and_cascades_deletions() {
        let mut model = seeded();
        model.connections.update(BuildingConnection {
            id: ConnectionId(7),
            source_building_id: BuildingId(2),
            sink_building_id: BuildingId(1),
            resource_id: "concrete".into(),
            max_capacity: Scalar::from_i64(5),
            velocity: Scalar::ZERO,
        });
        let mut frame = frame(1, Planet::new(PlanetId(1), "Terra"));
        frame.finances.corporations.insert(
            CorporationId(1),
            Cashflow {
                construction: Scalar::from_i64(100),
                ..Default::default()
            },
        );
        frame.buildings.deleted_building_ids.push(BuildingId(2));

        let notifications = model.apply_frame(&frame);
        assert_eq!(
            model.corporations.get(&CorporationId(1)).unwrap().cash,
            Scalar::from_i64(900)
        );
        assert!(!model.buildings.contains(&BuildingId(2)));
        assert!(model.connections.is_empty());
        assert!(notifications
            .iter()
            .all(|envelope| envelope.source == UpdateSource::Frame { tick: 1 }));
        assert!(notifications.iter().any(|envelope| matches!(
            &envelope.notification,
            Notification::BuildingsDeleted { building_ids, .. } if building_ids == &vec![BuildingId(2)]
        )));
    }

    #[test]
    fn simulation_absorbs_intents_without_losing_progress() {
        let mut replica = seeded();
        let mut progress = InventionSummary::new(CompanyId(1));
        progress.enqueue(InventionId::new("a"));
        progress.promote_next();
        replica.inventions.replicate(progress.clone());

        let mut authored = progress.clone();
        authored.active = None;
        authored.pending.clear();
        authored.enqueue(InventionId::new("b"));

        let changed = replica.absorb_authored(&Notification::InventionSummaryUpdated {
            planet_id: PlanetId(1),
            summary: authored,
        });
        assert_eq!(changed, vec![CompanyId(1)]);
        let merged = replica.inventions.get(&CompanyId(1)).unwrap();
        assert!(merged.active.is_some());
        assert_eq!(merged.pending.len(), 1);
    }

    #[test]
    fn simulation_keeps_its_cash_when_corporation_is_renamed() {
        let mut replica = seeded();
        let mut authored = replica.corporations.get(&CorporationId(1)).unwrap().clone();
        authored.name = "Renamed".into();
        authored.cash = Scalar::from_i64(5);
        replica.absorb_authored(&Notification::CorporationUpdated {
            planet_id: PlanetId(1),
            corporation: authored,
        });
        let local = replica.corporations.get(&CorporationId(1)).unwrap();
        assert_eq!(local.name, "Renamed");
        assert_eq!(local.cash, Scalar::from_i64(1_000));
    }

    #[test]
    fn chunk_index_finds_buildings_by_location() {
        let model = seeded();
        assert_eq!(model.buildings_in_chunk(0, 0).len(), 2);
        assert!(model.buildings_in_chunk(1, 0).is_empty());
    }

    #[test]
    fn demolished_ids_are_not_handed_out_again() {
        let mut model = seeded();
        assert_eq!(model.allocate_building_id(), BuildingId(3));
        model.buildings.update(building(3, 1));
        model.remove_building(BuildingId(3));
        assert_eq!(model.allocate_building_id(), BuildingId(4));
        assert_eq!(model.planet_snapshot().last_building_id, 4);
        assert!(model.planet.is_dirty(&PlanetId(1)));
    }

    #[test]
    fn frame_clock_keeps_the_authority_id_counter() {
        let mut model = seeded();
        model.allocate_building_id();
        let mut simulated = Planet::new(PlanetId(1), "Terra");
        simulated.time = 1;
        model.apply_frame(&frame(1, simulated));
        let planet = model.planet_snapshot();
        assert_eq!(planet.time, 1);
        assert_eq!(planet.last_building_id, 3);
    }

    #[test]
    fn replica_reseeds_from_a_snapshot() {
        let canonical = seeded();
        let state = canonical.state(4, 9);
        assert_eq!(state.epoch, 4);
        assert_eq!(state.mutation_sequence, 9);

        let mut replica = PlanetModel::in_memory(PlanetId(1));
        replica.buildings.replicate(building(7, 2));
        replica.replicate_state(&state);
        assert_eq!(replica.buildings.ids(), vec![BuildingId(1), BuildingId(2)]);
        assert!(replica.corporations.contains(&CorporationId(1)));
        assert_eq!(replica.buildings_in_chunk(0, 0).len(), 2);
        assert_eq!(replica.dirty_count(), 0);
    }
}
