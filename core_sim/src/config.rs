//! Process configuration.
//!
//! Loaded from `simulation_config.json`, with the file named by
//! `TYCOON_CONFIG_PATH` taking precedence when it is readable.

use std::{
    env, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use bevy::prelude::Resource;
use serde::Deserialize;
use sim_proto::{PlanetId, Scalar};
use thiserror::Error;

use crate::cache::RetryPolicy;

pub const BUILTIN_SIMULATION_CONFIG: &str = include_str!("data/simulation_config.json");
pub const CONFIG_PATH_ENV: &str = "TYCOON_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Resource, Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub planets: Vec<u32>,
    pub tick_period_ms: u64,
    pub tick_hours: u64,
    pub hours_per_season: u64,
    pub construction_price_markup: f64,
    pub upgrade_quantity_factor: f64,
    pub construction_supply_quality: f64,
    pub labor_quality: f64,
    pub research_period_ticks: u32,
    pub completed_research_rebate: f64,
    pub demolition_grace_hours: u64,
    pub store_dir: PathBuf,
    pub rpc_bind: SocketAddr,
    pub notification_bind: SocketAddr,
    pub frame_port_base: u16,
    pub frame_host: String,
    pub frame_backlog_limit: usize,
    pub rpc_timeout_ms: u64,
    pub load_retry_attempts: u32,
    pub load_retry_backoff_ms: u64,
    pub flush_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            planets: vec![1],
            tick_period_ms: 5_000,
            tick_hours: 1,
            hours_per_season: 2_190,
            construction_price_markup: 1.25,
            upgrade_quantity_factor: 0.5,
            construction_supply_quality: 1.0,
            labor_quality: 1.0,
            research_period_ticks: 24,
            completed_research_rebate: 1.0,
            demolition_grace_hours: 24,
            store_dir: PathBuf::from("data/stores"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 42_000)),
            notification_bind: SocketAddr::from(([127, 0, 0, 1], 42_001)),
            frame_port_base: 42_100,
            frame_host: "127.0.0.1".to_string(),
            frame_backlog_limit: 1_024,
            rpc_timeout_ms: 10_000,
            load_retry_attempts: 5,
            load_retry_backoff_ms: 2_000,
            flush_interval_ms: 15_000,
            reconnect_backoff_ms: 1_000,
        }
    }
}

impl SimulationConfig {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_SIMULATION_CONFIG)
            .expect("builtin simulation config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json_str(&contents)?)
    }

    pub fn planet_ids(&self) -> Vec<PlanetId> {
        self.planets.iter().copied().map(PlanetId).collect()
    }

    pub fn construction_markup(&self) -> Scalar {
        Scalar::from_f64(self.construction_price_markup)
    }

    pub fn upgrade_factor(&self) -> Scalar {
        Scalar::from_f64(self.upgrade_quantity_factor)
    }

    pub fn supply_quality(&self) -> Scalar {
        Scalar::from_f64(self.construction_supply_quality)
    }

    pub fn hired_labor_quality(&self) -> Scalar {
        Scalar::from_f64(self.labor_quality)
    }

    pub fn research_rebate(&self) -> Scalar {
        Scalar::from_f64(self.completed_research_rebate)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn load_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.load_retry_attempts.max(1),
            backoff: Duration::from_millis(self.load_retry_backoff_ms),
        }
    }

    /// Tick-frame channel address of a planet: one port per planet index.
    pub fn frame_addr(&self, planet_id: PlanetId) -> Option<SocketAddr> {
        let index = self.planets.iter().position(|id| *id == planet_id.0)?;
        let port = self.frame_port_base.checked_add(index as u16)?;
        format!("{}:{}", self.frame_host, port).parse().ok()
    }

    pub fn store_path(&self, planet_id: PlanetId) -> PathBuf {
        self.store_dir.join(format!("planet-{}.db", planet_id.0))
    }
}

pub fn load_simulation_config() -> SimulationConfig {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        match SimulationConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "tycoon::config",
                    path = %path.display(),
                    "simulation_config.loaded=file"
                );
                return config;
            }
            Err(err) => {
                tracing::warn!(
                    target: "tycoon::config",
                    path = %path.display(),
                    error = %err,
                    "simulation_config.load_failed"
                );
            }
        }
    }

    tracing::info!(target: "tycoon::config", "simulation_config.loaded=builtin");
    SimulationConfig::builtin()
}
