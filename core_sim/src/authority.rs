//! The model authority: sole writer of the canonical planet caches.
//!
//! Every mutation arrives as an [`AuthorityEvent`] on one channel and is
//! applied to completion before the next is taken, so mutations from all
//! workers are linearized here. Frames from the simulation loops go through
//! the same channel.
//!
//! Frames are accepted strictly in planet-clock order and only from the epoch
//! of the latest snapshot handed out for that planet. Anything else is refused
//! with a `ResyncRequested` broadcast, after which the simulation reloads a
//! snapshot instead of building on state the authority never saw.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sim_proto::{
    Building, BuildingId, BuildingSettings, CloneOptions, CloneScope, CompanyId, DefinitionId,
    ErrorCode, InventionId, InventionSummary, MapPosition, Notification, NotificationEnvelope,
    PlanetId, PlanetState, Reply, ReplyPayload, Request, Scalar, SettingsPatch, SimulationFrame,
    TycoonId, MAP_CHUNK_SIZE,
};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, FlushReport, IndexKey};
use crate::catalog::{Catalog, Footprint};
use crate::config::SimulationConfig;
use crate::hub::NotificationSink;
use crate::model::PlanetModel;
use crate::sessions::SessionRegistry;
use crate::store::StoreError;

pub enum AuthorityEvent {
    Request {
        request: Request,
        reply: Sender<Reply>,
    },
    Frame(SimulationFrame),
    Lifecycle(NotificationEnvelope),
    Flush,
    Shutdown,
}

impl AuthorityEvent {
    pub fn frame(frame: SimulationFrame) -> Self {
        AuthorityEvent::Frame(frame)
    }
}

struct PlanetSlot {
    model: PlanetModel,
    last_applied_time: u64,
    epoch: u64,
    mutation_sequence: u64,
}

type Outcome = Result<(ReplyPayload, Vec<Notification>), ErrorCode>;

pub struct ModelAuthority {
    planets: BTreeMap<PlanetId, PlanetSlot>,
    catalog: Arc<Catalog>,
    config: SimulationConfig,
    sessions: SessionRegistry,
    read_only: bool,
    sink: Box<dyn NotificationSink>,
}

impl ModelAuthority {
    pub fn new(
        config: SimulationConfig,
        catalog: Arc<Catalog>,
        sink: Box<dyn NotificationSink>,
        read_only: bool,
    ) -> Self {
        Self {
            planets: BTreeMap::new(),
            catalog,
            config,
            sessions: SessionRegistry::default(),
            read_only,
            sink,
        }
    }

    pub fn add_planet(&mut self, model: PlanetModel) {
        let last_applied_time = model.planet_snapshot().time;
        self.planets.insert(
            model.planet_id,
            PlanetSlot {
                model,
                last_applied_time,
                epoch: 0,
                mutation_sequence: 0,
            },
        );
    }

    /// Load every planet's caches. Fatal if any store stays unreadable after
    /// the configured retries.
    pub fn start(&mut self) -> Result<(), CacheError> {
        let policy = self.config.load_retry();
        for slot in self.planets.values_mut() {
            slot.model.load_all(&policy)?;
            slot.last_applied_time = slot.model.planet_snapshot().time;
        }
        info!(
            target: "tycoon::authority",
            planets = self.planets.len(),
            read_only = self.read_only,
            "authority.started"
        );
        Ok(())
    }

    /// Flush and close every planet store.
    pub fn stop(&mut self) -> Result<FlushReport, StoreError> {
        let report = self.flush();
        for slot in self.planets.values_mut() {
            slot.model.close()?;
        }
        info!(target: "tycoon::authority", "authority.stopped");
        Ok(report)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn planet(&self, planet_id: PlanetId) -> Option<&PlanetModel> {
        self.planets.get(&planet_id).map(|slot| &slot.model)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Apply one request and publish what it changed.
    pub fn dispatch(&mut self, request: Request) -> Reply {
        let kind = request.kind();
        let (reply, notifications) = self.handle(request);
        match &reply {
            Ok(_) => debug!(
                target: "tycoon::authority",
                kind,
                notifications = notifications.len(),
                "request.applied"
            ),
            Err(code) => info!(
                target: "tycoon::authority",
                kind,
                code = %code,
                "request.rejected"
            ),
        }
        if !notifications.is_empty() {
            self.sink.publish(notifications);
        }
        reply
    }

    /// Apply one request, returning the reply and the notifications to
    /// broadcast without publishing them.
    pub fn handle(&mut self, request: Request) -> (Reply, Vec<NotificationEnvelope>) {
        match request {
            Request::Ping => return (Ok(ReplyPayload::Pong), Vec::new()),
            Request::PlanetSnapshot { planet_id } => {
                let reply = self
                    .snapshot(planet_id)
                    .map(|state| ReplyPayload::Snapshot(Box::new(state)));
                return (reply, Vec::new());
            }
            _ => {}
        }
        if self.read_only {
            return (Err(ErrorCode::ReadOnly), Vec::new());
        }
        let planet_id = request.planet_id();
        match self.mutate(request) {
            Ok((payload, notifications)) => {
                (Ok(payload), self.sequence_mutations(planet_id, notifications))
            }
            Err(code) => (Err(code), Vec::new()),
        }
    }

    /// Hand out the planet's full state under a fresh epoch. Frames from any
    /// earlier epoch are dropped from now on.
    pub fn snapshot(&mut self, planet_id: PlanetId) -> Result<PlanetState, ErrorCode> {
        let slot = self.planets.get_mut(&planet_id).ok_or(ErrorCode::NoPlanet)?;
        slot.epoch += 1;
        let state = slot.model.state(slot.epoch, slot.mutation_sequence);
        info!(
            target: "tycoon::authority",
            planet = %planet_id,
            epoch = state.epoch,
            time = state.planet.time,
            mutation_sequence = state.mutation_sequence,
            "planet.snapshot"
        );
        Ok(state)
    }

    fn sequence_mutations(
        &mut self,
        planet_id: Option<PlanetId>,
        notifications: Vec<Notification>,
    ) -> Vec<NotificationEnvelope> {
        let Some(slot) = planet_id.and_then(|planet_id| self.planets.get_mut(&planet_id)) else {
            return notifications
                .into_iter()
                .map(NotificationEnvelope::mutation)
                .collect();
        };
        notifications
            .into_iter()
            .map(|notification| {
                slot.mutation_sequence += 1;
                NotificationEnvelope::mutation(notification).sequenced(slot.mutation_sequence)
            })
            .collect()
    }

    fn model_mut(&mut self, planet_id: PlanetId) -> Result<&mut PlanetModel, ErrorCode> {
        self.planets
            .get_mut(&planet_id)
            .map(|slot| &mut slot.model)
            .ok_or(ErrorCode::NoPlanet)
    }

    fn mutate(&mut self, request: Request) -> Outcome {
        let catalog = Arc::clone(&self.catalog);
        let grace = self.config.demolition_grace_hours;
        match request {
            Request::Ping | Request::PlanetSnapshot { .. } => Err(ErrorCode::MalformedRequest),
            Request::ConstructBuilding {
                planet_id,
                tycoon_id,
                company_id,
                definition_id,
                position,
                name,
            } => construct_building(
                self.model_mut(planet_id)?,
                &catalog,
                tycoon_id,
                company_id,
                &definition_id,
                position,
                name,
            ),
            Request::RenameBuilding {
                planet_id,
                tycoon_id,
                building_id,
                name,
            } => {
                let model = self.model_mut(planet_id)?;
                let mut building = owned_building(model, tycoon_id, building_id)?;
                building.name = Some(name);
                model.buildings.update(building.clone());
                Ok(buildings_updated(model.planet_id, building))
            }
            Request::DemolishBuilding {
                planet_id,
                tycoon_id,
                building_id,
            } => {
                let model = self.model_mut(planet_id)?;
                let mut building = owned_building(model, tycoon_id, building_id)?;
                if building.condemned_at.is_some() {
                    return Err(ErrorCode::InvalidState);
                }
                building.condemned_at = Some(model.planet_snapshot().time + grace);
                model.buildings.update(building.clone());
                Ok(buildings_updated(model.planet_id, building))
            }
            Request::UpdateBuildingSettings {
                planet_id,
                tycoon_id,
                building_id,
                patch,
            } => update_settings(self.model_mut(planet_id)?, tycoon_id, building_id, &patch),
            Request::CloneBuildingSettings {
                planet_id,
                tycoon_id,
                source_building_id,
                scope,
                options,
            } => clone_settings(
                self.model_mut(planet_id)?,
                tycoon_id,
                source_building_id,
                scope,
                options,
            ),
            Request::StartResearch {
                planet_id,
                company_id,
                invention_id,
            } => start_research(self.model_mut(planet_id)?, &catalog, company_id, invention_id),
            Request::CancelResearch {
                planet_id,
                company_id,
                invention_id,
            } => cancel_research(self.model_mut(planet_id)?, company_id, &invention_id),
        }
    }

    /// Fold a simulation frame into the canonical caches and rebroadcast the
    /// resulting updates. Frames failing their digest are dropped. Frames from
    /// another epoch, or that do not advance the clock by exactly one step,
    /// are refused and their epoch is asked to resync; a replica already past
    /// that epoch ignores the request.
    pub fn apply_frame(&mut self, frame: &SimulationFrame) -> bool {
        let planet_id = frame.planet.id;
        if !frame.verify() {
            warn!(
                target: "tycoon::authority",
                planet = %planet_id,
                tick = frame.tick,
                "frame.rejected=digest"
            );
            return false;
        }
        let step = self.config.tick_hours;
        let Some(slot) = self.planets.get_mut(&planet_id) else {
            warn!(
                target: "tycoon::authority",
                planet = %planet_id,
                "frame.rejected=unknown_planet"
            );
            return false;
        };
        let expected = slot.last_applied_time + step;
        if frame.epoch != slot.epoch || frame.planet.time != expected {
            if frame.epoch < slot.epoch {
                debug!(
                    target: "tycoon::authority",
                    planet = %planet_id,
                    tick = frame.tick,
                    epoch = frame.epoch,
                    current = slot.epoch,
                    "frame.stale_epoch"
                );
            } else {
                warn!(
                    target: "tycoon::authority",
                    planet = %planet_id,
                    tick = frame.tick,
                    epoch = frame.epoch,
                    time = frame.planet.time,
                    expected,
                    "frame.out_of_sequence"
                );
            }
            let request = Notification::ResyncRequested {
                planet_id,
                epoch: frame.epoch,
            };
            self.sink
                .publish(vec![NotificationEnvelope::frame(frame.tick, request)]);
            return false;
        }

        let notifications = slot.model.apply_frame(frame);
        slot.last_applied_time = frame.planet.time;
        info!(
            target: "tycoon::authority",
            planet = %planet_id,
            tick = frame.tick,
            time = frame.planet.time,
            notifications = notifications.len(),
            "frame.applied"
        );
        self.sink.publish(notifications);
        true
    }

    pub fn apply_lifecycle(&mut self, envelope: &NotificationEnvelope) {
        if !self.sessions.apply(&envelope.notification) {
            debug!(
                target: "tycoon::authority",
                kind = envelope.notification.kind(),
                "lifecycle.ignored"
            );
        }
    }

    pub fn flush(&mut self) -> FlushReport {
        let mut total = FlushReport::default();
        for (planet_id, slot) in self.planets.iter_mut() {
            let report = slot.model.flush_all();
            if report.failed > 0 {
                warn!(
                    target: "tycoon::cache",
                    planet = %planet_id,
                    written = report.written,
                    deleted = report.deleted,
                    failed = report.failed,
                    "cache.flush_incomplete"
                );
            } else if !report.is_empty() {
                debug!(
                    target: "tycoon::cache",
                    planet = %planet_id,
                    written = report.written,
                    deleted = report.deleted,
                    "cache.flushed"
                );
            }
            total.merge(report);
        }
        total
    }

    /// Serve events until `Shutdown` arrives or every sender is gone,
    /// flushing dirty entries every flush interval.
    pub fn run(&mut self, events: &Receiver<AuthorityEvent>) {
        let interval = self.config.flush_interval();
        let mut next_flush = Instant::now() + interval;
        loop {
            let timeout = next_flush.saturating_duration_since(Instant::now());
            match events.recv_timeout(timeout) {
                Ok(AuthorityEvent::Request { request, reply }) => {
                    let answer = self.dispatch(request);
                    if reply.send(answer).is_err() {
                        debug!(target: "tycoon::authority", "request.reply_dropped");
                    }
                }
                Ok(AuthorityEvent::Frame(frame)) => {
                    self.apply_frame(&frame);
                }
                Ok(AuthorityEvent::Lifecycle(envelope)) => self.apply_lifecycle(&envelope),
                Ok(AuthorityEvent::Flush) => {
                    self.flush();
                    next_flush = Instant::now() + interval;
                }
                Ok(AuthorityEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if Instant::now() >= next_flush {
                self.flush();
                next_flush = Instant::now() + interval;
            }
        }
    }
}

fn owned_building(
    model: &PlanetModel,
    tycoon_id: TycoonId,
    building_id: BuildingId,
) -> Result<Building, ErrorCode> {
    let building = model
        .buildings
        .get(&building_id)
        .ok_or(ErrorCode::NoBuilding)?;
    if building.tycoon_id != tycoon_id {
        return Err(ErrorCode::NotOwner);
    }
    Ok(building.clone())
}

fn buildings_updated(planet_id: PlanetId, building: Building) -> (ReplyPayload, Vec<Notification>) {
    let notification = Notification::BuildingsUpdated {
        planet_id,
        buildings: vec![building.clone()],
    };
    (ReplyPayload::Building(building), vec![notification])
}

fn construct_building(
    model: &mut PlanetModel,
    catalog: &Catalog,
    tycoon_id: TycoonId,
    company_id: CompanyId,
    definition_id: &DefinitionId,
    position: MapPosition,
    name: Option<String>,
) -> Outcome {
    let company = model
        .companies
        .get(&company_id)
        .ok_or(ErrorCode::NoCompany)?
        .clone();
    if company.tycoon_id != tycoon_id {
        return Err(ErrorCode::NotOwner);
    }
    let definition = catalog
        .building(definition_id)
        .ok_or(ErrorCode::NoDefinition)?;
    if !company.corporation_id.is_platform() && !model.corporations.contains(&company.corporation_id)
    {
        return Err(ErrorCode::NoCorporation);
    }
    if is_occupied(model, catalog, definition.footprint, position) {
        return Err(ErrorCode::PositionOccupied);
    }
    let town_id = model.nearest_town(position).ok_or(ErrorCode::NoTown)?.id;

    let id = model.allocate_building_id();
    let building = Building {
        id,
        tycoon_id,
        corporation_id: company.corporation_id,
        company_id,
        town_id,
        definition_id: definition_id.clone(),
        name,
        position,
        level: 1,
        upgrading: false,
        construction_started_at: None,
        construction_finished_at: None,
        condemned_at: None,
    };
    let settings = BuildingSettings::new(id);
    let construction =
        definition.construction_schedule(id, Scalar::ONE, &settings.construction_preferences);

    model.buildings.update(building.clone());
    model.constructions.update(construction.clone());
    model.settings.update(settings.clone());

    let planet_id = model.planet_id;
    Ok((
        ReplyPayload::Building(building.clone()),
        vec![
            Notification::BuildingsUpdated {
                planet_id,
                buildings: vec![building],
            },
            Notification::ConstructionsUpdated {
                planet_id,
                constructions: vec![construction],
            },
            Notification::SettingsUpdated {
                planet_id,
                settings: vec![settings],
            },
        ],
    ))
}

/// Buildings are indexed by the chunk of their anchor tile, so the search
/// widens by the largest footprint to catch neighbours anchored up-left.
fn is_occupied(
    model: &PlanetModel,
    catalog: &Catalog,
    footprint: Footprint,
    position: MapPosition,
) -> bool {
    let reach = catalog.max_footprint();
    let min_x = position.x.saturating_sub(reach) / MAP_CHUNK_SIZE;
    let min_y = position.y.saturating_sub(reach) / MAP_CHUNK_SIZE;
    let max_x = position.x.saturating_add(footprint.width) / MAP_CHUNK_SIZE;
    let max_y = position.y.saturating_add(footprint.height) / MAP_CHUNK_SIZE;

    for x in min_x..=max_x {
        for y in min_y..=max_y {
            for other in model.buildings_in_chunk(x, y) {
                let other_footprint = catalog
                    .building(&other.definition_id)
                    .map(|definition| definition.footprint)
                    .unwrap_or(Footprint {
                        width: 1,
                        height: 1,
                    });
                if footprint.overlaps(position, other_footprint, other.position) {
                    return true;
                }
            }
        }
    }
    false
}

fn update_settings(
    model: &mut PlanetModel,
    tycoon_id: TycoonId,
    building_id: BuildingId,
    patch: &SettingsPatch,
) -> Outcome {
    owned_building(model, tycoon_id, building_id)?;
    let mut settings = model
        .settings
        .get(&building_id)
        .cloned()
        .unwrap_or_else(|| BuildingSettings::new(building_id));
    let mut notifications = Vec::new();
    if patch.apply(&mut settings) {
        model.settings.update(settings.clone());
        notifications.push(Notification::SettingsUpdated {
            planet_id: model.planet_id,
            settings: vec![settings.clone()],
        });
    }
    Ok((ReplyPayload::Settings(vec![settings]), notifications))
}

fn clone_settings(
    model: &mut PlanetModel,
    tycoon_id: TycoonId,
    source_building_id: BuildingId,
    scope: CloneScope,
    options: CloneOptions,
) -> Outcome {
    let source = owned_building(model, tycoon_id, source_building_id)?;
    let template = model
        .settings
        .get(&source_building_id)
        .cloned()
        .unwrap_or_else(|| BuildingSettings::new(source_building_id));
    let key = match scope {
        CloneScope::SameCompany => IndexKey::Company(source.company_id),
        CloneScope::SameCorporation => IndexKey::Corporation(source.corporation_id),
    };
    let targets: Vec<BuildingId> = model
        .buildings
        .by_index(&key)
        .into_iter()
        .filter(|target| target.id != source.id && target.definition_id == source.definition_id)
        .map(|target| target.id)
        .collect();

    let mut changed = Vec::new();
    for target_id in targets {
        let mut settings = model
            .settings
            .get(&target_id)
            .cloned()
            .unwrap_or_else(|| BuildingSettings::new(target_id));
        if !settings.allow_incoming_settings {
            continue;
        }
        if copy_settings(&template, &mut settings, options) {
            model.settings.update(settings.clone());
            changed.push(settings);
        }
    }

    let notifications = if changed.is_empty() {
        Vec::new()
    } else {
        vec![Notification::SettingsUpdated {
            planet_id: model.planet_id,
            settings: changed.clone(),
        }]
    };
    Ok((ReplyPayload::Settings(changed), notifications))
}

fn copy_settings(
    template: &BuildingSettings,
    target: &mut BuildingSettings,
    options: CloneOptions,
) -> bool {
    let before = target.clone();
    if options.closed {
        target.closed = template.closed;
    }
    if options.connection_posture {
        target.connection_posture = template.connection_posture;
    }
    if options.requested_level {
        target.requested_level = template.requested_level;
    }
    if options.construction_preferences {
        target.construction_preferences = template.construction_preferences.clone();
    }
    if options.labor_wages {
        target.labor_wages = template.labor_wages.clone();
    }
    if options.service_requests {
        target.service_requests = template.service_requests.clone();
    }
    *target != before
}

fn start_research(
    model: &mut PlanetModel,
    catalog: &Catalog,
    company_id: CompanyId,
    invention_id: InventionId,
) -> Outcome {
    if !model.companies.contains(&company_id) {
        return Err(ErrorCode::NoCompany);
    }
    let invention = catalog
        .invention(&invention_id)
        .ok_or(ErrorCode::NoDefinition)?;
    let mut summary = model
        .inventions
        .get(&company_id)
        .cloned()
        .unwrap_or_else(|| InventionSummary::new(company_id));
    if !invention
        .prerequisites
        .iter()
        .all(|prerequisite| summary.is_completed(prerequisite))
    {
        return Err(ErrorCode::MissingResearchPrerequisite);
    }
    if !summary.enqueue(invention_id) {
        return Err(ErrorCode::InvalidState);
    }
    Ok(summary_updated(model, summary))
}

fn cancel_research(
    model: &mut PlanetModel,
    company_id: CompanyId,
    invention_id: &InventionId,
) -> Outcome {
    if !model.companies.contains(&company_id) {
        return Err(ErrorCode::NoCompany);
    }
    let mut summary = model
        .inventions
        .get(&company_id)
        .cloned()
        .ok_or(ErrorCode::InvalidState)?;
    if !summary.cancel(invention_id) {
        return Err(ErrorCode::InvalidState);
    }
    Ok(summary_updated(model, summary))
}

fn summary_updated(
    model: &mut PlanetModel,
    summary: InventionSummary,
) -> (ReplyPayload, Vec<Notification>) {
    model.inventions.update(summary.clone());
    let notification = Notification::InventionSummaryUpdated {
        planet_id: model.planet_id,
        summary: summary.clone(),
    };
    (ReplyPayload::InventionSummary(summary), vec![notification])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use sim_proto::{
        BuildingDelta, Company, Corporation, CorporationId, FinancesDelta, Planet, ResearchDelta,
        Town, TownId, UpdateSource,
    };

    fn seeded_model() -> PlanetModel {
        let mut model = PlanetModel::in_memory(PlanetId(1));
        model.planet.update(Planet::new(PlanetId(1), "Terra"));
        model.corporations.update(Corporation {
            id: CorporationId(1),
            tycoon_id: TycoonId(1),
            planet_id: PlanetId(1),
            name: "Acme".into(),
            cash: Scalar::from_i64(10_000),
            company_ids: [CompanyId(1)].into_iter().collect(),
        });
        model.companies.update(Company {
            id: CompanyId(1),
            tycoon_id: TycoonId(1),
            corporation_id: CorporationId(1),
            name: "Acme Retail".into(),
            seal_id: "retail".into(),
        });
        model.towns.update(Town {
            id: TownId(1),
            name: "Springfield".into(),
            position: MapPosition::new(5, 5),
            cash: Scalar::from_i64(1_000),
        });
        model
    }

    fn authority(read_only: bool) -> (ModelAuthority, crossbeam_channel::Receiver<NotificationEnvelope>) {
        let (sink, notifications) = unbounded();
        let mut authority = ModelAuthority::new(
            SimulationConfig::default(),
            Catalog::builtin(),
            Box::new(sink),
            read_only,
        );
        authority.add_planet(seeded_model());
        (authority, notifications)
    }

    fn construct(x: u32, y: u32) -> Request {
        Request::ConstructBuilding {
            planet_id: PlanetId(1),
            tycoon_id: TycoonId(1),
            company_id: CompanyId(1),
            definition_id: DefinitionId::new("store"),
            position: MapPosition::new(x, y),
            name: None,
        }
    }

    #[test]
    fn construct_creates_building_construction_and_settings() {
        let (mut authority, notifications) = authority(false);
        let reply = authority.dispatch(construct(10, 10));
        let Ok(ReplyPayload::Building(building)) = reply else {
            panic!("expected a building");
        };
        assert_eq!(building.town_id, TownId(1));
        assert_eq!(building.level, 1);

        let model = authority.planet(PlanetId(1)).unwrap();
        let construction = model.constructions.get(&building.id).unwrap();
        assert_eq!(construction.resources.len(), 1);
        assert_eq!(
            construction.resources[0].required_quantity,
            Scalar::from_i64(100)
        );
        assert!(model.settings.contains(&building.id));

        let kinds: Vec<&str> = notifications
            .try_iter()
            .inspect(|envelope| assert_eq!(envelope.source, UpdateSource::Mutation))
            .map(|envelope| envelope.notification.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["buildings_updated", "constructions_updated", "settings_updated"]
        );
    }

    #[test]
    fn overlapping_footprints_are_rejected() {
        let (mut authority, _) = authority(false);
        assert!(authority.dispatch(construct(10, 10)).is_ok());
        assert_eq!(
            authority.dispatch(construct(11, 11)),
            Err(ErrorCode::PositionOccupied)
        );
        assert!(authority.dispatch(construct(12, 10)).is_ok());
        // Anchored in the previous chunk but reaching into this one.
        assert!(authority.dispatch(construct(19, 30)).is_ok());
        assert_eq!(
            authority.dispatch(construct(20, 31)),
            Err(ErrorCode::PositionOccupied)
        );
    }

    #[test]
    fn unknown_entities_map_to_error_codes() {
        let (mut authority, _) = authority(false);
        let mut request = construct(0, 0);
        if let Request::ConstructBuilding { definition_id, .. } = &mut request {
            *definition_id = DefinitionId::new("castle");
        }
        assert_eq!(authority.dispatch(request), Err(ErrorCode::NoDefinition));
        assert_eq!(
            authority.dispatch(Request::RenameBuilding {
                planet_id: PlanetId(1),
                tycoon_id: TycoonId(1),
                building_id: BuildingId(99),
                name: "x".into(),
            }),
            Err(ErrorCode::NoBuilding)
        );
        assert_eq!(
            authority.dispatch(Request::StartResearch {
                planet_id: PlanetId(2),
                company_id: CompanyId(1),
                invention_id: InventionId::new("automation"),
            }),
            Err(ErrorCode::NoPlanet)
        );
    }

    #[test]
    fn demolish_condemns_after_grace_and_only_once() {
        let (mut authority, _) = authority(false);
        let Ok(ReplyPayload::Building(building)) = authority.dispatch(construct(0, 0)) else {
            panic!("construct failed");
        };
        let demolish = Request::DemolishBuilding {
            planet_id: PlanetId(1),
            tycoon_id: TycoonId(1),
            building_id: building.id,
        };
        let Ok(ReplyPayload::Building(condemned)) = authority.dispatch(demolish.clone()) else {
            panic!("demolish failed");
        };
        assert_eq!(
            condemned.condemned_at,
            Some(SimulationConfig::default().demolition_grace_hours)
        );
        assert_eq!(authority.dispatch(demolish), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn other_tycoons_cannot_rename() {
        let (mut authority, _) = authority(false);
        let Ok(ReplyPayload::Building(building)) = authority.dispatch(construct(0, 0)) else {
            panic!("construct failed");
        };
        assert_eq!(
            authority.dispatch(Request::RenameBuilding {
                planet_id: PlanetId(1),
                tycoon_id: TycoonId(2),
                building_id: building.id,
                name: "Mine now".into(),
            }),
            Err(ErrorCode::NotOwner)
        );
    }

    #[test]
    fn read_only_authority_rejects_mutations_but_answers_ping() {
        let (mut authority, _) = authority(true);
        assert_eq!(authority.dispatch(Request::Ping), Ok(ReplyPayload::Pong));
        assert_eq!(authority.dispatch(construct(0, 0)), Err(ErrorCode::ReadOnly));
    }

    #[test]
    fn research_requires_prerequisites_and_rejects_duplicates() {
        let (mut authority, _) = authority(false);
        let start = |invention: &str| Request::StartResearch {
            planet_id: PlanetId(1),
            company_id: CompanyId(1),
            invention_id: InventionId::new(invention),
        };
        assert_eq!(
            authority.dispatch(start("automation")),
            Err(ErrorCode::MissingResearchPrerequisite)
        );
        assert!(authority.dispatch(start("basic-management")).is_ok());
        assert_eq!(
            authority.dispatch(start("basic-management")),
            Err(ErrorCode::InvalidState)
        );
        assert_eq!(
            authority.dispatch(start("time-travel")),
            Err(ErrorCode::NoDefinition)
        );

        let cancel = Request::CancelResearch {
            planet_id: PlanetId(1),
            company_id: CompanyId(1),
            invention_id: InventionId::new("basic-management"),
        };
        let Ok(ReplyPayload::InventionSummary(summary)) = authority.dispatch(cancel.clone()) else {
            panic!("cancel failed");
        };
        assert!(summary.pending.is_empty());
        assert_eq!(summary.canceled.len(), 1);
        assert_eq!(authority.dispatch(cancel), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn clone_reaches_same_definition_buildings_that_accept_settings() {
        let (mut authority, _) = authority(false);
        let mut ids = Vec::new();
        for x in [0, 10, 20] {
            let Ok(ReplyPayload::Building(building)) = authority.dispatch(construct(x, 0)) else {
                panic!("construct failed");
            };
            ids.push(building.id);
        }
        let patch = |building_id, patch| Request::UpdateBuildingSettings {
            planet_id: PlanetId(1),
            tycoon_id: TycoonId(1),
            building_id,
            patch,
        };
        authority
            .dispatch(patch(
                ids[0],
                SettingsPatch {
                    requested_level: Some(3),
                    ..Default::default()
                },
            ))
            .unwrap();
        authority
            .dispatch(patch(
                ids[2],
                SettingsPatch {
                    allow_incoming_settings: Some(false),
                    ..Default::default()
                },
            ))
            .unwrap();

        let reply = authority.dispatch(Request::CloneBuildingSettings {
            planet_id: PlanetId(1),
            tycoon_id: TycoonId(1),
            source_building_id: ids[0],
            scope: CloneScope::SameCompany,
            options: CloneOptions::everything(),
        });
        let Ok(ReplyPayload::Settings(changed)) = reply else {
            panic!("clone failed");
        };
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].building_id, ids[1]);
        let model = authority.planet(PlanetId(1)).unwrap();
        assert_eq!(model.settings.get(&ids[2]).unwrap().requested_level, 1);
    }

    fn clock_frame(time: u64, epoch: u64) -> SimulationFrame {
        let mut planet = Planet::new(PlanetId(1), "Terra");
        planet.time = time;
        SimulationFrame::new(
            time,
            planet,
            FinancesDelta::default(),
            ResearchDelta::default(),
            BuildingDelta::default(),
        )
        .with_epoch(epoch)
        .finalize()
    }

    fn resync_requests(notifications: &crossbeam_channel::Receiver<NotificationEnvelope>) -> Vec<u64> {
        notifications
            .try_iter()
            .filter_map(|envelope| match envelope.notification {
                Notification::ResyncRequested { epoch, .. } => Some(epoch),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tampered_frames_are_dropped() {
        let (mut authority, notifications) = authority(false);
        let mut tampered = clock_frame(1, 0);
        tampered.tick = 99;
        assert!(!authority.apply_frame(&tampered));
        assert!(authority.apply_frame(&clock_frame(1, 0)));
        assert!(resync_requests(&notifications).is_empty());
    }

    #[test]
    fn frames_must_advance_the_clock_by_exactly_one_step() {
        let (mut authority, notifications) = authority(false);
        assert!(authority.apply_frame(&clock_frame(1, 0)));

        // Replayed from a replica whose clock went backwards.
        assert!(!authority.apply_frame(&clock_frame(1, 0)));
        // Follows a lost frame.
        assert!(!authority.apply_frame(&clock_frame(3, 0)));
        assert_eq!(resync_requests(&notifications), vec![0, 0]);
        assert_eq!(
            authority.planet(PlanetId(1)).unwrap().planet_snapshot().time,
            1
        );

        assert!(authority.apply_frame(&clock_frame(2, 0)));
        assert!(notifications
            .try_iter()
            .all(|envelope| matches!(envelope.source, UpdateSource::Frame { tick: 2 })));
    }

    #[test]
    fn snapshots_retire_frames_from_earlier_epochs() {
        let (mut authority, notifications) = authority(false);
        assert!(authority.apply_frame(&clock_frame(1, 0)));

        let state = authority.snapshot(PlanetId(1)).unwrap();
        assert_eq!(state.epoch, 1);
        assert_eq!(state.planet.time, 1);

        assert!(!authority.apply_frame(&clock_frame(2, 0)));
        assert_eq!(resync_requests(&notifications), vec![0]);
        assert!(authority.apply_frame(&clock_frame(2, 1)));

        // An epoch the authority never issued, e.g. from before a restart.
        assert!(!authority.apply_frame(&clock_frame(3, 7)));
        assert_eq!(resync_requests(&notifications), vec![7]);
        assert_eq!(authority.snapshot(PlanetId(1)).unwrap().epoch, 2);
    }

    #[test]
    fn mutation_broadcasts_are_numbered_per_planet() {
        let (mut authority, notifications) = authority(false);
        authority.dispatch(construct(0, 0)).unwrap();
        authority.dispatch(construct(10, 0)).unwrap();
        let sequences: Vec<Option<u64>> = notifications
            .try_iter()
            .map(|envelope| envelope.sequence)
            .collect();
        assert_eq!(sequences, (1..=6).map(Some).collect::<Vec<_>>());

        let state = authority.snapshot(PlanetId(1)).unwrap();
        assert_eq!(state.mutation_sequence, 6);
        assert_eq!(state.buildings.len(), 2);
    }

    #[test]
    fn read_only_authority_still_serves_snapshots() {
        let (mut authority, _) = authority(true);
        let reply = authority.dispatch(Request::PlanetSnapshot {
            planet_id: PlanetId(1),
        });
        let Ok(ReplyPayload::Snapshot(state)) = reply else {
            panic!("expected a snapshot, got {reply:?}");
        };
        assert_eq!(state.corporations.len(), 1);
        assert_eq!(
            authority.dispatch(Request::PlanetSnapshot {
                planet_id: PlanetId(9),
            }),
            Err(ErrorCode::NoPlanet)
        );
    }

    #[test]
    fn building_ids_survive_demolition_of_the_newest() {
        let (mut authority, _) = authority(false);
        let Ok(ReplyPayload::Building(first)) = authority.dispatch(construct(0, 0)) else {
            panic!("construct failed");
        };
        let mut frame = clock_frame(1, 0);
        frame.buildings.deleted_building_ids.push(first.id);
        assert!(authority.apply_frame(&frame.finalize()));
        assert!(!authority.planet(PlanetId(1)).unwrap().buildings.contains(&first.id));

        let Ok(ReplyPayload::Building(second)) = authority.dispatch(construct(0, 0)) else {
            panic!("construct failed");
        };
        assert!(second.id > first.id);
    }
}
