//! # mvrx-station
//!
//! Headless MVR-xchange station.
//!
//! This binary:
//! - listens for peer stations on TCP and serves the local commit log and
//!   scene files
//! - seeds the peer directory from a peers file and optionally joins one
//!   station at startup
//! - persists identity and commits in SQLite under the data directory
//! - runs periodic housekeeping of stale peers and finished transfers

mod config;
mod host;

use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use mvrx_net::{load_peers_file, Client, NetError, Server, SessionState, StationContext};
use mvrx_shared::{PeerInfo, StationUuid};
use mvrx_store::{database, CommitStore, Database, StationIdentity};

use crate::config::StationConfig;
use crate::host::LoggingHost;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mvrx_net=debug,mvrx_station=debug")),
        )
        .init();

    info!("Starting MVR-xchange station v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = StationConfig::from_env();
    info!(?config, "Loaded configuration");

    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => database::default_data_dir()?,
    };

    // -----------------------------------------------------------------------
    // 3. Local state
    // -----------------------------------------------------------------------
    let db = Database::open_in(&data_dir)?;
    let identity = StationIdentity::load_or_create(&db)?;
    let commits = CommitStore::load(db)?;
    info!(
        station = %identity.station_uuid(),
        data_dir = %data_dir.display(),
        known_stations = commits.stations().len(),
        "Station identity loaded"
    );

    let (ctx, events) = StationContext::new(
        identity,
        config.station_name.clone(),
        commits,
        config.transfer_config(&data_dir),
    );
    let ctx = ctx.with_provider(config.provider.clone());

    // -----------------------------------------------------------------------
    // 4. Listener
    // -----------------------------------------------------------------------
    let mut server = Server::start(config.server_config(), ctx.clone()).await?;

    if let Some(path) = &config.peers_file {
        let peers = load_peers_file(path);
        let mut seeded = 0;
        for peer in peers {
            if peer.station_uuid == ctx.station_uuid() {
                debug!(station = %peer.station_uuid, "Skipping own entry in peers file");
                continue;
            }
            ctx.peers.upsert(peer);
            seeded += 1;
        }
        info!(count = seeded, path = %path.display(), "Seeded peer directory");
    }

    // -----------------------------------------------------------------------
    // 5. Background tasks
    // -----------------------------------------------------------------------
    let host_task = tokio::spawn(async move {
        let mut host = LoggingHost::new();
        events.dispatch(&mut host).await;
    });

    let housekeeping = {
        let ctx = ctx.clone();
        let peer_stale = config.peer_stale;
        let retention = config.transfer_retention;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = ctx.peers.evict_stale(peer_stale);
                let purged = ctx.transfers.purge_finished(retention);
                if !evicted.is_empty() || purged > 0 {
                    debug!(evicted = evicted.len(), purged, "Housekeeping");
                }
            }
        })
    };

    // -----------------------------------------------------------------------
    // 6. Outbound session
    // -----------------------------------------------------------------------
    let mut client = Client::new(ctx.clone(), config.client_config(server.local_addr().port()));
    if let Some(target) = config.join_station {
        match ctx.peers.get(target) {
            Some(peer) => {
                if let Err(e) = join_station(&mut client, &peer).await {
                    warn!(station = %target, error = %e, "Could not join station");
                }
            }
            None => warn!(station = %target, "JOIN_STATION is not listed in the peers file"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    if client.state() == SessionState::Joined {
        if let Err(e) = client.leave().await {
            warn!(error = %e, "Leave failed");
        }
    } else {
        client.stop();
    }
    server.stop().await;
    housekeeping.abort();
    host_task.abort();

    Ok(())
}

async fn join_station(client: &mut Client, peer: &PeerInfo) -> Result<StationUuid, NetError> {
    client.connect(peer).await?;
    client.join().await
}
