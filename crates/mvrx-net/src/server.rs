//! Inbound listener.
//!
//! The accept loop runs in its own task and hands every connection to a
//! dedicated task with a read loop and a write loop. A connection moves
//! `Accepted -> Authenticated -> Serving` as its JOIN is validated and the
//! peer registered. File requests are answered on any connection, since they
//! arrive on short-lived out-of-band connections.
//!
//! The live set holds one registration per station. A newer JOIN replaces the
//! registration without closing the older socket; the older connection's
//! eventual disconnect leaves the newer registration alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mvrx_shared::constants::DEFAULT_STATION_PORT;
use mvrx_shared::{Commit, MessageKind, MvrxError, PeerInfo, StationUuid, WireMessage};

use crate::codec::{self, Frame};
use crate::context::StationContext;
use crate::error::NetError;
use crate::events::StationEvent;

/// How long a broadcast waits for one peer's socket to take the message.
const BROADCAST_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Maximum number of joined stations; 0 means unlimited.
    pub max_peers: usize,
    /// Request the file of every commit a joined peer pushes.
    pub auto_download: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_STATION_PORT)),
            max_peers: 0,
            auto_download: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticated,
    Serving,
}

enum Outbound {
    /// A message, with an optional notification once it hit the socket.
    Message(WireMessage, Option<oneshot::Sender<bool>>),
    File(PathBuf),
    Close,
}

struct LivePeer {
    conn_id: u64,
    state: ConnectionState,
    info: PeerInfo,
    tx: mpsc::UnboundedSender<Outbound>,
}

struct Shared {
    ctx: StationContext,
    config: ServerConfig,
    local_addr: SocketAddr,
    live: Mutex<HashMap<StationUuid, LivePeer>>,
    files_served: AtomicU64,
    next_conn: AtomicU64,
}

impl Shared {
    /// Locate the artifact for `uuid`, given as a commit or a file UUID.
    fn resolve_artifact(&self, uuid: Uuid) -> Result<PathBuf, NetError> {
        let transfers = &self.ctx.transfers;
        let direct = transfers.path_for(uuid);
        if direct.is_file() {
            return Ok(direct);
        }
        if let Some((_, commit)) = self.ctx.commits.find(uuid) {
            let path = transfers.path_for(commit.commit_uuid);
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(NetError::NotFound(uuid))
    }

    /// Drop the registration of `station` if it still belongs to `conn_id`.
    fn unregister(&self, station: StationUuid, conn_id: u64) -> bool {
        let removed = match self.live.lock() {
            Ok(mut live) => match live.get(&station) {
                Some(peer) if peer.conn_id == conn_id => live.remove(&station).is_some(),
                _ => false,
            },
            Err(_) => false,
        };
        if removed {
            self.ctx.peers.unpin(station);
        }
        removed
    }

    fn clear_live(&self) {
        let stations: Vec<StationUuid> = match self.live.lock() {
            Ok(mut live) => live.drain().map(|(station, _)| station).collect(),
            Err(_) => return,
        };
        for station in stations {
            self.ctx.peers.unpin(station);
        }
    }
}

pub struct Server {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener and start accepting in the background.
    pub async fn start(config: ServerConfig, ctx: StationContext) -> Result<Self, NetError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| NetError::Connection(format!("bind {}: {e}", config.listen_addr)))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, station = %ctx.station_uuid(), "Station listener bound");

        let shared = Arc::new(Shared {
            ctx,
            config,
            local_addr,
            live: Mutex::new(HashMap::new()),
            files_served: AtomicU64::new(0),
            next_conn: AtomicU64::new(1),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(shared.clone(), listener, shutdown_rx));

        Ok(Self {
            shared,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Stations currently joined, ordered by station UUID.
    pub fn live_peers(&self) -> Vec<PeerInfo> {
        let Ok(live) = self.shared.live.lock() else {
            return Vec::new();
        };
        let mut peers: Vec<PeerInfo> = live.values().map(|p| p.info.clone()).collect();
        peers.sort_by_key(|p| p.station_uuid);
        peers
    }

    /// State of the connection currently registered for `station`.
    pub fn connection_state(&self, station: StationUuid) -> Option<ConnectionState> {
        let live = self.shared.live.lock().ok()?;
        live.get(&station).map(|p| p.state)
    }

    pub fn is_live(&self, station: StationUuid) -> bool {
        self.shared
            .live
            .lock()
            .map(|live| live.contains_key(&station))
            .unwrap_or(false)
    }

    /// Number of file requests answered with a file.
    pub fn files_served(&self) -> u64 {
        self.shared.files_served.load(Ordering::Relaxed)
    }

    /// Path of the artifact served for `uuid`, or [`NetError::NotFound`].
    pub fn artifact_path(&self, uuid: Uuid) -> Result<PathBuf, NetError> {
        self.shared.resolve_artifact(uuid)
    }

    /// Push `commit` to every live peer. Peers whose connection fails to take
    /// the message are dropped from the live set. Returns how many peers got it.
    pub async fn broadcast_commit(&self, commit: &Commit) -> usize {
        let ctx = &self.shared.ctx;
        let mut msg = WireMessage::new(MessageKind::Commit, ctx.station_uuid())
            .with_station(&ctx.station_name, &ctx.provider)
            .with_commits(vec![commit.clone()])
            .with_file(commit.file_uuid);
        msg.comment = Some(commit.comment.clone());
        msg.file_name = commit.file_name.clone();
        msg.file_size = commit.file_size;

        let targets: Vec<(StationUuid, u64, mpsc::UnboundedSender<Outbound>)> = match self.shared.live.lock() {
            Ok(live) => live
                .iter()
                .map(|(station, peer)| (*station, peer.conn_id, peer.tx.clone()))
                .collect(),
            Err(_) => return 0,
        };

        let deliveries = targets.into_iter().map(|(station, conn_id, tx)| {
            let msg = msg.clone();
            async move {
                let (written_tx, written_rx) = oneshot::channel();
                if tx.send(Outbound::Message(msg, Some(written_tx))).is_err() {
                    return (station, conn_id, tx, false);
                }
                let ok = matches!(
                    tokio::time::timeout(BROADCAST_WRITE_TIMEOUT, written_rx).await,
                    Ok(Ok(true))
                );
                (station, conn_id, tx, ok)
            }
        });

        let mut delivered = 0;
        for (station, conn_id, tx, ok) in join_all(deliveries).await {
            if ok {
                delivered += 1;
            } else if self.shared.unregister(station, conn_id) {
                warn!(station = %station, commit = %commit.commit_uuid, "Broadcast failed, dropping peer");
                let _ = tx.send(Outbound::Close);
            }
        }

        info!(commit = %commit.commit_uuid, delivered, "Commit broadcast");
        delivered
    }

    /// Copy a scene file into the artifact directory, append it to the local
    /// log as a new commit and broadcast that commit.
    pub async fn publish(&self, path: &Path, comment: &str) -> Result<Commit, NetError> {
        let ctx = &self.shared.ctx;
        let size = tokio::fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let commit = Commit::new_local(ctx.station_uuid(), comment).with_file(file_name, size);
        tokio::fs::create_dir_all(ctx.transfers.artifact_dir()).await?;
        tokio::fs::copy(path, ctx.transfers.path_for(commit.commit_uuid)).await?;
        ctx.commits.append(ctx.station_uuid(), commit.clone())?;

        info!(commit = %commit.commit_uuid, bytes = size, "Published scene");
        self.broadcast_commit(&commit).await;
        Ok(commit)
    }

    /// Close the listener and every live connection.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.shared.clear_live();
        info!(addr = %self.shared.local_addr, "Station listener stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            self.shared.clear_live();
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %remote, conn = conn_id, "Accepted connection");
                    connections.spawn(handle_connection(shared.clone(), stream, remote, conn_id));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Dropping the listener here refuses new connections.
    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, remote: SocketAddr, conn_id: u64) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut conn = Connection {
        shared,
        remote,
        conn_id,
        tx,
        state: ConnectionState::Accepted,
        station: None,
    };

    let write_loop = async {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Message(msg, written) => {
                    let result = codec::write_message(&mut write_half, &msg).await;
                    if let Some(written) = written {
                        let _ = written.send(result.is_ok());
                    }
                    result?;
                }
                Outbound::File(path) => {
                    codec::write_file(&mut write_half, &path).await?;
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
        Ok::<(), NetError>(())
    };

    let result = tokio::select! {
        r = conn.read_loop(&mut reader) => r,
        w = write_loop => w,
    };
    conn.finish(result);
}

struct Connection {
    shared: Arc<Shared>,
    remote: SocketAddr,
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    state: ConnectionState,
    station: Option<StationUuid>,
}

impl Connection {
    async fn read_loop(&mut self, reader: &mut BufReader<OwnedReadHalf>) -> Result<(), NetError> {
        loop {
            match codec::read_frame(reader).await? {
                None => return Ok(()),
                Some(Frame::Message(msg)) => {
                    if let Err(e) = self.handle(msg).await {
                        warn!(peer = %self.remote, error = %e, "Ignoring invalid message");
                    }
                }
                Some(Frame::Malformed(e)) => {
                    warn!(peer = %self.remote, error = %e, "Ignoring malformed message");
                }
                Some(Frame::File(len)) => {
                    debug!(peer = %self.remote, bytes = len, "Discarding unsolicited file payload");
                    codec::discard(reader, len).await?;
                }
            }
        }
    }

    async fn handle(&mut self, msg: WireMessage) -> Result<(), NetError> {
        if msg.station_uuid.is_none() {
            return Err(MvrxError::protocol(format!("{:?} message without StationUUID", msg.kind)).into());
        }
        if let Some(station) = self.station {
            self.shared.ctx.peers.touch(station);
        }
        match msg.kind {
            MessageKind::Join => self.on_join(msg).await,
            MessageKind::Leave => self.on_leave(msg),
            MessageKind::Commit => self.on_commit(msg),
            MessageKind::FileRequest => self.on_file_request(msg),
            MessageKind::JoinRet | MessageKind::LeaveRet | MessageKind::CommitRet | MessageKind::FileRequestRet => {
                debug!(peer = %self.remote, kind = ?msg.kind, "Ignoring reply on server connection");
                Ok(())
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(peer = %self.remote, conn = self.conn_id, from = ?self.state, to = ?state, "Connection state change");
            self.state = state;
        }
        let Some(station) = self.station else {
            return;
        };
        if let Ok(mut live) = self.shared.live.lock() {
            if let Some(peer) = live.get_mut(&station).filter(|p| p.conn_id == self.conn_id) {
                peer.state = state;
            }
        }
    }

    fn send(&self, msg: WireMessage) {
        let _ = self.tx.send(Outbound::Message(msg, None));
    }

    fn local(&self) -> StationUuid {
        self.shared.ctx.station_uuid()
    }

    fn reject_join(&self, reason: String) -> Result<(), NetError> {
        warn!(peer = %self.remote, reason = %reason, "Rejecting join");
        self.send(WireMessage::reply(MessageKind::JoinRet, self.local(), false, Some(reason)));
        Ok(())
    }

    async fn on_join(&mut self, msg: WireMessage) -> Result<(), NetError> {
        let ctx = self.shared.ctx.clone();
        let local = ctx.station_uuid();

        let sender = match msg.sender() {
            Ok(sender) => sender,
            // Presence was checked by `handle`, so this is a nil UUID.
            Err(e) => return self.reject_join(format!("invalid StationUUID: {e}")),
        };
        if sender == local {
            return self.reject_join("StationUUID collides with this station".into());
        }

        let info = PeerInfo {
            station_uuid: sender,
            station_name: msg.station_name.clone().unwrap_or_default(),
            ip_address: self.remote.ip().to_string(),
            port: msg.port.unwrap_or(self.remote.port()),
            provider_name: msg.provider.clone().unwrap_or_default(),
        };

        let newly_registered = {
            let Ok(mut live) = self.shared.live.lock() else {
                return self.reject_join("station unavailable".into());
            };
            let max = self.shared.config.max_peers;
            if max > 0 && live.keys().filter(|s| **s != sender).count() >= max {
                drop(live);
                return self.reject_join(format!("station is full ({max} peers)"));
            }
            let previous = live.insert(
                sender,
                LivePeer {
                    conn_id: self.conn_id,
                    state: ConnectionState::Authenticated,
                    info: info.clone(),
                    tx: self.tx.clone(),
                },
            );
            if matches!(previous, Some(ref p) if p.conn_id != self.conn_id) {
                debug!(station = %sender, "Replacing older registration");
            }
            // A replaced registration hands over its pin.
            previous.is_none()
        };

        if let Some(old) = self.station.replace(sender) {
            if old != sender {
                self.shared.unregister(old, self.conn_id);
            }
        }
        self.set_state(ConnectionState::Authenticated);

        ctx.peers.upsert(info.clone());
        if newly_registered {
            ctx.peers.pin(sender);
        }
        ctx.events
            .emit(StationEvent::PeerUpdated(ctx.peers.get(sender).unwrap_or(info)));

        let reply = WireMessage::reply(MessageKind::JoinRet, local, true, None)
            .with_station(&ctx.station_name, &ctx.provider)
            .with_port(self.shared.local_addr.port())
            .with_commits(ctx.local_log());
        let (written_tx, written_rx) = oneshot::channel();
        if self.tx.send(Outbound::Message(reply, Some(written_tx))).is_err() {
            return Err(NetError::Connection("writer closed before MVR_JOIN_RET".into()));
        }
        if !matches!(written_rx.await, Ok(true)) {
            return Err(NetError::Connection("MVR_JOIN_RET was not delivered".into()));
        }
        self.set_state(ConnectionState::Serving);
        info!(peer = %self.remote, station = %sender, "Peer joined");

        self.accept_commits(sender, msg.commits(sender));
        Ok(())
    }

    fn on_leave(&mut self, msg: WireMessage) -> Result<(), NetError> {
        let sender = msg.sender()?;
        self.send(WireMessage::reply(MessageKind::LeaveRet, self.local(), true, None));
        if let Some(station) = self.station.take() {
            self.shared.unregister(station, self.conn_id);
        }
        self.set_state(ConnectionState::Accepted);
        let _ = self.tx.send(Outbound::Close);
        info!(peer = %self.remote, station = %sender, "Peer left");
        Ok(())
    }

    fn on_commit(&mut self, msg: WireMessage) -> Result<(), NetError> {
        let sender = msg.sender()?;
        if self.station != Some(sender) {
            self.send(WireMessage::reply(
                MessageKind::CommitRet,
                self.local(),
                false,
                Some("join before committing".into()),
            ));
            return Ok(());
        }
        self.accept_commits(sender, msg.commits(sender));
        self.send(WireMessage::reply(MessageKind::CommitRet, self.local(), true, None));
        Ok(())
    }

    fn on_file_request(&mut self, msg: WireMessage) -> Result<(), NetError> {
        let requester = msg.sender()?;
        let local = self.local();
        let Some(uuid) = msg.file_uuid else {
            self.send(WireMessage::reply(
                MessageKind::FileRequestRet,
                local,
                false,
                Some("missing FileUUID".into()),
            ));
            return Ok(());
        };

        match self.shared.resolve_artifact(uuid) {
            Ok(path) => {
                info!(peer = %self.remote, station = %requester, file = %uuid, path = %path.display(), "Serving scene file");
                self.shared.files_served.fetch_add(1, Ordering::Relaxed);
                let _ = self.tx.send(Outbound::File(path));
            }
            Err(e) => {
                debug!(peer = %self.remote, file = %uuid, "Requested file not available");
                self.send(WireMessage::reply(MessageKind::FileRequestRet, local, false, Some(e.to_string())).with_file(uuid));
            }
        }
        Ok(())
    }

    fn accept_commits(&self, station: StationUuid, commits: Vec<Commit>) {
        if commits.is_empty() {
            return;
        }
        let ctx = &self.shared.ctx;
        let accepted = match ctx.commits.merge(station, commits) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(station = %station, error = %e, "Failed to store received commits");
                return;
            }
        };
        if accepted.is_empty() {
            return;
        }

        info!(station = %station, count = accepted.len(), "Received commits");
        ctx.events.emit(StationEvent::CommitsReceived {
            station,
            commits: accepted.clone(),
        });

        if self.shared.config.auto_download {
            let source = self
                .shared
                .live
                .lock()
                .ok()
                .and_then(|live| live.get(&station).map(|p| p.info.clone()))
                .and_then(|info| info.socket_addr().ok());
            match source {
                Some(source) => {
                    for commit in &accepted {
                        ctx.transfers.request(commit, source, None);
                    }
                }
                None => debug!(station = %station, "No address for peer, skipping downloads"),
            }
        }
    }

    fn finish(&mut self, result: Result<(), NetError>) {
        match result {
            Ok(()) => debug!(peer = %self.remote, conn = self.conn_id, "Connection closed"),
            Err(e) => warn!(peer = %self.remote, conn = self.conn_id, error = %e, "Connection lost"),
        }
        if let Some(station) = self.station.take() {
            if self.shared.unregister(station, self.conn_id) {
                info!(station = %station, "Peer removed from live set");
            }
        }
    }
}
