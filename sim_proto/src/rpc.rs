use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{
    BuildingId, CompanyId, DefinitionId, InventionId, PlanetId, ResourceId, TycoonId,
};
use crate::records::{
    Building, BuildingSettings, ConnectionPosture, ConstructionPreference, MapPosition,
};
use crate::economy::InventionSummary;
use crate::scalar::Scalar;
use crate::snapshot::PlanetState;

/// Which buildings a settings clone reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneScope {
    SameCompany,
    SameCorporation,
}

/// Which settings groups a clone copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloneOptions {
    pub closed: bool,
    pub connection_posture: bool,
    pub requested_level: bool,
    pub construction_preferences: bool,
    pub labor_wages: bool,
    pub service_requests: bool,
}

impl CloneOptions {
    pub fn everything() -> Self {
        Self {
            closed: true,
            connection_posture: true,
            requested_level: true,
            construction_preferences: true,
            labor_wages: true,
            service_requests: true,
        }
    }
}

/// Partial update of a building's settings; `None` fields are left alone.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub closed: Option<bool>,
    pub connection_posture: Option<ConnectionPosture>,
    pub allow_incoming_settings: Option<bool>,
    pub requested_level: Option<u32>,
    pub construction_preferences: Option<BTreeMap<ResourceId, ConstructionPreference>>,
    pub labor_wages: Option<BTreeMap<ResourceId, Scalar>>,
    pub service_requests: Option<BTreeMap<ResourceId, Scalar>>,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut BuildingSettings) -> bool {
        let before = settings.clone();
        if let Some(closed) = self.closed {
            settings.closed = closed;
        }
        if let Some(posture) = self.connection_posture {
            settings.connection_posture = posture;
        }
        if let Some(allow) = self.allow_incoming_settings {
            settings.allow_incoming_settings = allow;
        }
        if let Some(level) = self.requested_level {
            settings.requested_level = level.max(1);
        }
        if let Some(preferences) = &self.construction_preferences {
            settings.construction_preferences = preferences.clone();
        }
        if let Some(wages) = &self.labor_wages {
            settings.labor_wages = wages.clone();
        }
        if let Some(requests) = &self.service_requests {
            settings.service_requests = requests.clone();
        }
        *settings != before
    }
}

/// Mutation requests served by the model authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    /// Full state of a planet under a fresh epoch, which retires the frames of
    /// every older one. Sent by a simulation loop (re)seeding its replica.
    /// Answered in read-only mode too.
    PlanetSnapshot {
        planet_id: PlanetId,
    },
    ConstructBuilding {
        planet_id: PlanetId,
        tycoon_id: TycoonId,
        company_id: CompanyId,
        definition_id: DefinitionId,
        position: MapPosition,
        name: Option<String>,
    },
    RenameBuilding {
        planet_id: PlanetId,
        tycoon_id: TycoonId,
        building_id: BuildingId,
        name: String,
    },
    DemolishBuilding {
        planet_id: PlanetId,
        tycoon_id: TycoonId,
        building_id: BuildingId,
    },
    UpdateBuildingSettings {
        planet_id: PlanetId,
        tycoon_id: TycoonId,
        building_id: BuildingId,
        patch: SettingsPatch,
    },
    CloneBuildingSettings {
        planet_id: PlanetId,
        tycoon_id: TycoonId,
        source_building_id: BuildingId,
        scope: CloneScope,
        options: CloneOptions,
    },
    StartResearch {
        planet_id: PlanetId,
        company_id: CompanyId,
        invention_id: InventionId,
    },
    CancelResearch {
        planet_id: PlanetId,
        company_id: CompanyId,
        invention_id: InventionId,
    },
}

impl Request {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::PlanetSnapshot { .. } => "planet_snapshot",
            Request::ConstructBuilding { .. } => "construct_building",
            Request::RenameBuilding { .. } => "rename_building",
            Request::DemolishBuilding { .. } => "demolish_building",
            Request::UpdateBuildingSettings { .. } => "update_building_settings",
            Request::CloneBuildingSettings { .. } => "clone_building_settings",
            Request::StartResearch { .. } => "start_research",
            Request::CancelResearch { .. } => "cancel_research",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Request::Ping | Request::PlanetSnapshot { .. })
    }

    pub fn planet_id(&self) -> Option<PlanetId> {
        match self {
            Request::Ping => None,
            Request::PlanetSnapshot { planet_id }
            | Request::ConstructBuilding { planet_id, .. }
            | Request::RenameBuilding { planet_id, .. }
            | Request::DemolishBuilding { planet_id, .. }
            | Request::UpdateBuildingSettings { planet_id, .. }
            | Request::CloneBuildingSettings { planet_id, .. }
            | Request::StartResearch { planet_id, .. }
            | Request::CancelResearch { planet_id, .. } => Some(*planet_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoPlanet,
    NoBuilding,
    NoCompany,
    NoCorporation,
    NoDefinition,
    NoTown,
    MissingResearchPrerequisite,
    PositionOccupied,
    ReadOnly,
    InvalidState,
    NotOwner,
    MalformedRequest,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::NoPlanet => "NO_PLANET",
            ErrorCode::NoBuilding => "NO_BUILDING",
            ErrorCode::NoCompany => "NO_COMPANY",
            ErrorCode::NoCorporation => "NO_CORPORATION",
            ErrorCode::NoDefinition => "NO_DEFINITION",
            ErrorCode::NoTown => "NO_TOWN",
            ErrorCode::MissingResearchPrerequisite => "MISSING_RESEARCH_PREREQUISITE",
            ErrorCode::PositionOccupied => "POSITION_OCCUPIED",
            ErrorCode::ReadOnly => "READ_ONLY",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::NotOwner => "NOT_OWNER",
            ErrorCode::MalformedRequest => "MALFORMED_REQUEST",
        };
        f.write_str(code)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    Pong,
    Building(Building),
    Settings(Vec<BuildingSettings>),
    InventionSummary(InventionSummary),
    Snapshot(Box<PlanetState>),
}

pub type Reply = Result<ReplyPayload, ErrorCode>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: u64,
    pub request: Request,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: u64,
    pub reply: Reply,
}
