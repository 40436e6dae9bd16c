use std::io;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, unbounded};
use thiserror::Error;
use tracing::{error, info};

use core_sim::{
    build_planet_app, load_catalog, load_simulation_config, run_planet_loop,
    start_frame_publisher, start_notification_hub, start_rpc_server, subscribe_frames,
    AuthorityEvent, CacheError, Catalog, ModelAuthority, NotificationLink, PlanetModel,
    RpcClient, SimulationConfig, SqliteDatabase, StoreBackend, StoreError, StoreMode,
};
use sim_proto::PlanetId;

#[derive(Parser, Debug)]
#[command(name = "server", about = "Tycoon backend processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the model authority over every configured planet.
    Authority {
        /// Open stores read-only and reject every mutation.
        #[arg(long)]
        read_only: bool,
    },
    /// Run the simulation loop of one planet.
    Simulate {
        #[arg(long)]
        planet: u32,
    },
}

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to start {what}: {source}")]
    Start {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("planet {0} is not configured")]
    UnknownPlanet(PlanetId),
}

fn starting(what: &'static str) -> impl FnOnce(io::Error) -> ServerError {
    move |source| ServerError::Start { what, source }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_simulation_config();
    let catalog = load_catalog();

    let result = match cli.command {
        Command::Authority { read_only } => run_authority(config, catalog, read_only),
        Command::Simulate { planet } => run_simulation(config, catalog, PlanetId(planet)),
    };
    if let Err(err) = result {
        error!(target: "tycoon::server", error = %err, "server.fatal");
        process::exit(1);
    }
}

fn run_authority(
    config: SimulationConfig,
    catalog: Arc<Catalog>,
    read_only: bool,
) -> Result<(), ServerError> {
    let mode = if read_only {
        StoreMode::ReadOnly
    } else {
        StoreMode::ReadWrite
    };
    let (events, inbox) = unbounded();

    let hub = start_notification_hub(config.notification_bind, events.clone())
        .map_err(starting("notification hub"))?;
    let mut authority = ModelAuthority::new(config.clone(), catalog, Box::new(hub), read_only);

    for planet_id in config.planet_ids() {
        let database = SqliteDatabase::open(&config.store_path(planet_id), mode)?;
        authority.add_planet(PlanetModel::open(
            &StoreBackend::Sqlite(database),
            planet_id,
        )?);
        let addr = config
            .frame_addr(planet_id)
            .ok_or(ServerError::UnknownPlanet(planet_id))?;
        subscribe_frames(
            addr,
            config.reconnect_backoff(),
            events.clone(),
            AuthorityEvent::frame,
        )
        .map_err(starting("frame subscriber"))?;
    }
    authority.start()?;

    let rpc = start_rpc_server(config.rpc_bind, events).map_err(starting("rpc server"))?;
    info!(
        target: "tycoon::server",
        rpc = %rpc.local_addr(),
        notifications = %config.notification_bind,
        planets = config.planets.len(),
        read_only,
        "authority.ready"
    );

    authority.run(&inbox);
    let report = authority.stop()?;
    info!(
        target: "tycoon::server",
        written = report.written,
        deleted = report.deleted,
        failed = report.failed,
        "authority.exited"
    );
    Ok(())
}

fn run_simulation(
    config: SimulationConfig,
    catalog: Arc<Catalog>,
    planet_id: PlanetId,
) -> Result<(), ServerError> {
    let addr = config
        .frame_addr(planet_id)
        .ok_or(ServerError::UnknownPlanet(planet_id))?;

    let snapshots = RpcClient::connect(config.rpc_bind, config.rpc_timeout())
        .map_err(starting("authority rpc client"))?;
    let publisher =
        start_frame_publisher(addr, config.frame_backlog_limit).map_err(starting("frame publisher"))?;
    let link = NotificationLink::connect(config.notification_bind, config.reconnect_backoff())
        .map_err(starting("notification link"))?;
    info!(
        target: "tycoon::server",
        planet = %planet_id,
        frames = %publisher.local_addr(),
        "simulation.ready"
    );

    let period = config.tick_period();
    let mut app = build_planet_app(config, catalog, PlanetModel::in_memory(planet_id));
    let (_shutdown_tx, shutdown) = bounded::<()>(1);
    run_planet_loop(&mut app, &publisher, &link, &snapshots, &shutdown, period);
    Ok(())
}
