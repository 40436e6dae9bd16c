//! Front-end worker view of the world.
//!
//! Read paths are served from in-memory replicas and never block on the
//! authority; writes go through the shared RPC client and the successful
//! reply is folded in immediately, ahead of the matching broadcast.

use std::collections::BTreeMap;

use sim_proto::{
    Building, BuildingId, Company, CompanyId, CorporationId, InventionSummary, Notification,
    NotificationEnvelope, PlanetId, Reply, ReplyPayload, Request, SocketId, TownId, TycoonId,
    ViewPort, MAP_CHUNK_SIZE,
};
use tracing::debug;

use crate::cache::IndexKey;
use crate::hub::NotificationLink;
use crate::model::PlanetModel;
use crate::rpc::{RpcClient, RpcError};

pub struct FrontendReplica {
    planets: BTreeMap<PlanetId, PlanetModel>,
    rpc: RpcClient,
    link: NotificationLink,
}

impl FrontendReplica {
    pub fn new(rpc: RpcClient, link: NotificationLink) -> Self {
        Self {
            planets: BTreeMap::new(),
            rpc,
            link,
        }
    }

    pub fn add_planet(&mut self, model: PlanetModel) {
        self.planets.insert(model.planet_id, model);
    }

    /// Apply every broadcast received since the last call.
    pub fn sync(&mut self) -> usize {
        let mut applied = 0;
        for envelope in self.link.inbound().try_iter() {
            let Some(planet_id) = envelope.notification.planet_id() else {
                continue;
            };
            match self.planets.get_mut(&planet_id) {
                Some(model) => {
                    model.apply_notification(&envelope.notification);
                    applied += 1;
                }
                None => debug!(
                    target: "tycoon::replica",
                    planet = %planet_id,
                    kind = envelope.notification.kind(),
                    "notification.unknown_planet"
                ),
            }
        }
        applied
    }

    pub fn planet(&self, planet_id: PlanetId) -> Option<&PlanetModel> {
        self.planets.get(&planet_id)
    }

    pub fn buildings(&self, planet_id: PlanetId) -> Vec<&Building> {
        self.planet(planet_id)
            .map(|model| model.buildings.all())
            .unwrap_or_default()
    }

    pub fn building(&self, planet_id: PlanetId, building_id: BuildingId) -> Option<&Building> {
        self.planet(planet_id)?.buildings.get(&building_id)
    }

    fn buildings_by(&self, planet_id: PlanetId, key: IndexKey) -> Vec<&Building> {
        self.planet(planet_id)
            .map(|model| model.buildings.by_index(&key))
            .unwrap_or_default()
    }

    pub fn buildings_for_company(&self, planet_id: PlanetId, company_id: CompanyId) -> Vec<&Building> {
        self.buildings_by(planet_id, IndexKey::Company(company_id))
    }

    pub fn buildings_for_corporation(
        &self,
        planet_id: PlanetId,
        corporation_id: CorporationId,
    ) -> Vec<&Building> {
        self.buildings_by(planet_id, IndexKey::Corporation(corporation_id))
    }

    pub fn buildings_for_town(&self, planet_id: PlanetId, town_id: TownId) -> Vec<&Building> {
        self.buildings_by(planet_id, IndexKey::Town(town_id))
    }

    /// Buildings anchored inside a view port.
    pub fn buildings_in_view(&self, planet_id: PlanetId, view: ViewPort) -> Vec<&Building> {
        let Some(model) = self.planet(planet_id) else {
            return Vec::new();
        };
        let (min_x, min_y) = view.origin.chunk();
        let max_x = view.origin.x.saturating_add(view.width) / MAP_CHUNK_SIZE;
        let max_y = view.origin.y.saturating_add(view.height) / MAP_CHUNK_SIZE;
        let mut found = Vec::new();
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                found.extend(model.buildings_in_chunk(x, y).into_iter().filter(|building| {
                    building.position.x >= view.origin.x
                        && building.position.y >= view.origin.y
                        && building.position.x < view.origin.x.saturating_add(view.width)
                        && building.position.y < view.origin.y.saturating_add(view.height)
                }));
            }
        }
        found.sort_by_key(|building| building.id);
        found
    }

    pub fn companies_for_tycoon(&self, planet_id: PlanetId, tycoon_id: TycoonId) -> Vec<&Company> {
        self.planet(planet_id)
            .map(|model| model.companies.by_index(&IndexKey::Tycoon(tycoon_id)))
            .unwrap_or_default()
    }

    pub fn invention_summary(
        &self,
        planet_id: PlanetId,
        company_id: CompanyId,
    ) -> Option<&InventionSummary> {
        self.planet(planet_id)?.inventions.get(&company_id)
    }

    /// Send a mutation to the authority and apply a successful reply locally.
    pub fn mutate(&mut self, request: Request) -> Result<Reply, RpcError> {
        let planet_id = request.planet_id();
        let reply = self.rpc.call(request)?;
        if let (Ok(payload), Some(planet_id)) = (&reply, planet_id) {
            if let Some(model) = self.planets.get_mut(&planet_id) {
                absorb_reply(model, payload);
            }
        }
        Ok(reply)
    }

    pub fn socket_connected(&self, socket_id: SocketId, tycoon_id: TycoonId, planet_id: PlanetId) {
        self.link
            .send(NotificationEnvelope::lifecycle(Notification::SocketConnected {
                socket_id,
                tycoon_id,
                planet_id,
            }));
    }

    pub fn socket_disconnected(&self, socket_id: SocketId) {
        self.link
            .send(NotificationEnvelope::lifecycle(Notification::SocketDisconnected {
                socket_id,
            }));
    }

    pub fn view_moved(&self, socket_id: SocketId, view: ViewPort) {
        self.link
            .send(NotificationEnvelope::lifecycle(Notification::ViewMoved {
                socket_id,
                view,
            }));
    }
}

fn absorb_reply(model: &mut PlanetModel, payload: &ReplyPayload) {
    match payload {
        ReplyPayload::Pong => {}
        ReplyPayload::Building(building) => model.buildings.replicate(building.clone()),
        ReplyPayload::Settings(settings) => {
            for entry in settings {
                model.settings.replicate(entry.clone());
            }
        }
        ReplyPayload::InventionSummary(summary) => model.inventions.replicate(summary.clone()),
        ReplyPayload::Snapshot(state) => model.replicate_state(state),
    }
}
