//! Replicated records and wire contracts for the tycoon backend.
//!
//! Everything that crosses a process boundary lives here: entity records as
//! they are persisted and replicated, the per-tick [`SimulationFrame`], RPC
//! envelopes, notification envelopes, and the length-prefixed framing used on
//! every socket.
//! A [`PlanetState`] snapshot reseeds a replica that fell out of step.

pub mod codec;
mod economy;
mod frame;
mod ids;
mod notify;
mod records;
mod rpc;
mod scalar;
mod snapshot;

pub use codec::CodecError;
pub use economy::{
    ActiveResearch, CanceledOrigin, CanceledResearch, Company, Corporation, InventionSummary,
    QueuedResearch, ResearchState, Town,
};
pub use frame::{
    decode_frame, decode_frame_json, encode_frame, encode_frame_json, hash_frame, BuildingDelta,
    Cashflow, CompletedInvention, FinancesDelta, ResearchDelta, SimulationFrame,
};
pub use ids::{
    BuildingId, CompanyId, ConnectionId, CorporationId, DefinitionId, InventionId, PlanetId,
    ResourceId, SocketId, TownId, TycoonId,
};
pub use notify::{Notification, NotificationEnvelope, UpdateSource, ViewPort};
pub use records::{
    Building, BuildingConnection, BuildingConstruction, BuildingLifecycle, BuildingMetrics,
    BuildingSettings, ConnectionPosture, ConstructionPreference, ConstructionResource,
    LaborMetrics, MapPosition, Planet, PurchaseSnapshot, ResourceFlow, Season, MAP_CHUNK_SIZE,
};
pub use rpc::{
    CloneOptions, CloneScope, ErrorCode, Reply, ReplyEnvelope, ReplyPayload, Request,
    RequestEnvelope, SettingsPatch,
};
pub use scalar::Scalar;
pub use snapshot::PlanetState;
