//! Server core for the tycoon backend.
//!
//! One simulation loop per planet advances the economy on a fixed cadence and
//! publishes a [`SimulationFrame`](sim_proto::SimulationFrame) per tick. A single
//! [`ModelAuthority`] holds the canonical write-behind caches, applies those
//! frames and every player mutation, and rebroadcasts what changed to the
//! front-end replicas.

pub mod authority;
pub mod buildings;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod finances;
pub mod hub;
pub mod issue;
pub mod metrics;
pub mod model;
pub mod network;
pub mod replica;
pub mod research;
pub mod rpc;
pub mod sessions;
pub mod simulation;
pub mod store;
pub mod sync;

pub use authority::{AuthorityEvent, ModelAuthority};
pub use buildings::{aggregate_headquarters, simulate_buildings, BuildingRules, BuildingTickOutput};
pub use cache::{CacheEntry, CacheError, FlushReport, IndexKey, RetryPolicy, WriteBehindCache};
pub use catalog::{load_catalog, BuildingDefinition, Catalog, CatalogError, CatalogHandle};
pub use config::{load_simulation_config, ConfigError, SimulationConfig};
pub use finances::{Charge, FinanceError, Payer, SimulationFinancesFrame, SpendKind};
pub use hub::{start_notification_hub, NotificationHub, NotificationLink, NotificationSink};
pub use issue::SimulationIssue;
pub use metrics::TickMetrics;
pub use model::{PlanetModel, RemovedBuilding};
pub use network::{start_frame_publisher, subscribe_frames, FramePublisher};
pub use replica::FrontendReplica;
pub use research::{simulate_research, ResearchRules, ResearchTickOutput};
pub use rpc::{start_rpc_server, RpcClient, RpcError, RpcServer};
pub use sessions::{SessionRegistry, SocketSession};
pub use simulation::{
    absorb_notification, build_planet_app, run_planet_loop, run_tick, FrameOutbox,
    ResearchTracking, SimulationRoster, SimulationTick,
};
pub use store::{
    EntityStore, MemoryDatabase, SqliteDatabase, StoreBackend, StoreError, StoreMode, StoreRecord,
};
pub use sync::{
    install_snapshot, resync_planet, ReplicaSync, ResyncReason, SnapshotSource, SyncError,
};
