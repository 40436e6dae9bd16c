use serde::{Deserialize, Serialize};

use crate::economy::{Company, Corporation, InventionSummary, Town};
use crate::ids::{BuildingId, PlanetId, SocketId, TycoonId};
use crate::records::{
    Building, BuildingConstruction, BuildingMetrics, BuildingSettings, MapPosition, Planet,
};

/// Rectangle of the map a client is currently looking at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewPort {
    pub origin: MapPosition,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    SocketConnected {
        socket_id: SocketId,
        tycoon_id: TycoonId,
        planet_id: PlanetId,
    },
    SocketDisconnected {
        socket_id: SocketId,
    },
    ViewMoved {
        socket_id: SocketId,
        view: ViewPort,
    },
    PlanetUpdated {
        planet: Planet,
    },
    BuildingsUpdated {
        planet_id: PlanetId,
        buildings: Vec<Building>,
    },
    BuildingsDeleted {
        planet_id: PlanetId,
        building_ids: Vec<BuildingId>,
    },
    ConstructionsUpdated {
        planet_id: PlanetId,
        constructions: Vec<BuildingConstruction>,
    },
    ConstructionsDeleted {
        planet_id: PlanetId,
        building_ids: Vec<BuildingId>,
    },
    SettingsUpdated {
        planet_id: PlanetId,
        settings: Vec<BuildingSettings>,
    },
    MetricsUpdated {
        planet_id: PlanetId,
        metrics: Vec<BuildingMetrics>,
    },
    CompanyUpdated {
        planet_id: PlanetId,
        company: Company,
    },
    CorporationUpdated {
        planet_id: PlanetId,
        corporation: Corporation,
    },
    TownUpdated {
        planet_id: PlanetId,
        town: Town,
    },
    InventionSummaryUpdated {
        planet_id: PlanetId,
        summary: InventionSummary,
    },
    /// The authority refused a frame from `epoch`; that replica must reload
    /// a snapshot before its frames are accepted again.
    ResyncRequested {
        planet_id: PlanetId,
        epoch: u64,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::SocketConnected { .. } => "socket_connected",
            Notification::SocketDisconnected { .. } => "socket_disconnected",
            Notification::ViewMoved { .. } => "view_moved",
            Notification::PlanetUpdated { .. } => "planet_updated",
            Notification::BuildingsUpdated { .. } => "buildings_updated",
            Notification::BuildingsDeleted { .. } => "buildings_deleted",
            Notification::ConstructionsUpdated { .. } => "constructions_updated",
            Notification::ConstructionsDeleted { .. } => "constructions_deleted",
            Notification::SettingsUpdated { .. } => "settings_updated",
            Notification::MetricsUpdated { .. } => "metrics_updated",
            Notification::CompanyUpdated { .. } => "company_updated",
            Notification::CorporationUpdated { .. } => "corporation_updated",
            Notification::TownUpdated { .. } => "town_updated",
            Notification::InventionSummaryUpdated { .. } => "invention_summary_updated",
            Notification::ResyncRequested { .. } => "resync_requested",
        }
    }

    /// Planet an entity update belongs to; lifecycle events have none.
    pub fn planet_id(&self) -> Option<PlanetId> {
        match self {
            Notification::SocketConnected { planet_id, .. } => Some(*planet_id),
            Notification::SocketDisconnected { .. } | Notification::ViewMoved { .. } => None,
            Notification::PlanetUpdated { planet } => Some(planet.id),
            Notification::BuildingsUpdated { planet_id, .. }
            | Notification::BuildingsDeleted { planet_id, .. }
            | Notification::ConstructionsUpdated { planet_id, .. }
            | Notification::ConstructionsDeleted { planet_id, .. }
            | Notification::SettingsUpdated { planet_id, .. }
            | Notification::MetricsUpdated { planet_id, .. }
            | Notification::CompanyUpdated { planet_id, .. }
            | Notification::CorporationUpdated { planet_id, .. }
            | Notification::TownUpdated { planet_id, .. }
            | Notification::InventionSummaryUpdated { planet_id, .. }
            | Notification::ResyncRequested { planet_id, .. } => Some(*planet_id),
        }
    }
}

/// What caused a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    /// An RPC mutation applied by the authority.
    Mutation,
    /// The authority applied a simulation frame.
    Frame { tick: u64 },
    /// A worker reported a client lifecycle event.
    Lifecycle,
}

/// `sequence` numbers mutation broadcasts per planet, starting at 1, so a
/// replica can tell when it missed one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub source: UpdateSource,
    pub sequence: Option<u64>,
    pub notification: Notification,
}

impl NotificationEnvelope {
    pub fn mutation(notification: Notification) -> Self {
        Self {
            source: UpdateSource::Mutation,
            sequence: None,
            notification,
        }
    }

    pub fn frame(tick: u64, notification: Notification) -> Self {
        Self {
            source: UpdateSource::Frame { tick },
            sequence: None,
            notification,
        }
    }

    pub fn lifecycle(notification: Notification) -> Self {
        Self {
            source: UpdateSource::Lifecycle,
            sequence: None,
            notification,
        }
    }

    pub fn sequenced(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}
