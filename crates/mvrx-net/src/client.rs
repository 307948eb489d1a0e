//! Outbound session to one selected peer.
//!
//! A [`Client`] owns at most one session. The session runs in its own task
//! with a read loop and a write loop over the same TCP connection; the
//! client talks to it through a command channel, mirroring how the swarm
//! task is driven elsewhere in the stack.
//!
//! ```text
//! Disconnected -> Connecting -> Joining -> Joined -> Leaving -> Disconnected
//! ```
//!
//! A negative join acknowledgement drops `Joining` back to `Disconnected`.
//! A fault while `Joined` goes straight to `Disconnected` and emits
//! [`StationEvent::ConnectionLost`]; there is no automatic reconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mvrx_shared::constants::LEAVE_GRACE_MS;
use mvrx_shared::{Commit, MessageKind, PeerInfo, StationUuid, WireMessage};

use crate::codec::{self, Frame};
use crate::context::StationContext;
use crate::error::NetError;
use crate::events::StationEvent;
use crate::peers::PeerDirectory;
use crate::transfer::{SessionId, TransferHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joining,
    Joined,
    Leaving,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Zero leaves the connect deadline to the OS.
    pub connect_timeout: Duration,
    /// Zero waits for the join acknowledgement indefinitely.
    pub join_timeout: Duration,
    pub leave_grace: Duration,
    /// Request the file of every newly received commit.
    pub auto_download: bool,
    /// Port of the local listener, announced in JOIN so the peer can reach us.
    pub listen_port: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
            leave_grace: Duration::from_millis(LEAVE_GRACE_MS),
            auto_download: true,
            listen_port: None,
        }
    }
}

type JoinAck = Result<StationUuid, String>;

enum SessionCommand {
    Send(WireMessage),
    /// Shut the write side down and end the session.
    Close,
}

enum SessionEnd {
    /// The peer closed the transport.
    Closed,
    /// Closed by us, or after the peer's LEAVE was acknowledged.
    Local,
    Rejected,
    Fault(NetError),
}

/// State shared by the client and its session task.
///
/// Only the session whose id is currently active may change the state, so a
/// late-finishing old session cannot clobber a newer one.
struct StateCell {
    tx: watch::Sender<SessionState>,
    active: AtomicU64,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Disconnected);
        Self {
            tx,
            active: AtomicU64::new(0),
        }
    }

    fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// The state if `id` is still the active session.
    fn get_for(&self, id: SessionId) -> Option<SessionState> {
        let state = self.tx.borrow();
        (self.active.load(Ordering::Acquire) == id).then_some(*state)
    }

    fn activate(&self, id: SessionId, state: SessionState) {
        self.tx.send_modify(|s| {
            self.active.store(id, Ordering::Release);
            *s = state;
        });
    }

    fn set_for(&self, id: SessionId, state: SessionState) {
        self.tx.send_if_modified(|s| {
            if self.active.load(Ordering::Acquire) != id || *s == state {
                return false;
            }
            debug!(session = id, from = ?*s, to = ?state, "Client state change");
            *s = state;
            true
        });
    }
}

struct SessionShared {
    id: SessionId,
    closing: AtomicBool,
    remote_left: AtomicBool,
    pending_join: Mutex<Option<oneshot::Sender<JoinAck>>>,
    remote_station: Mutex<Option<StationUuid>>,
    /// Directory entry kept from eviction while joined.
    pinned: Mutex<Option<StationUuid>>,
}

impl SessionShared {
    fn release(&self, peers: &PeerDirectory) {
        let station = self.pinned.lock().ok().and_then(|mut p| p.take());
        if let Some(station) = station {
            peers.unpin(station);
        }
    }
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    remote: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

pub struct Client {
    ctx: StationContext,
    config: ClientConfig,
    state: Arc<StateCell>,
    session: Option<ActiveSession>,
    last_peer: Option<PeerInfo>,
}

impl Client {
    pub fn new(ctx: StationContext, config: ClientConfig) -> Self {
        Self {
            ctx,
            config,
            state: Arc::new(StateCell::new()),
            session: None,
            last_peer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Wait up to `timeout` for the client to reach `target`.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut rx = self.state.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// The peer selected by the last `connect`.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.last_peer.as_ref()
    }

    /// The station that acknowledged our JOIN, if any.
    pub fn remote_station(&self) -> Option<StationUuid> {
        let session = self.session.as_ref()?;
        let station = session.shared.remote_station.lock().ok()?;
        *station
    }

    /// Open the transport to `peer` and start the session task.
    pub async fn connect(&mut self, peer: &PeerInfo) -> Result<(), NetError> {
        let current = self.state();
        if current != SessionState::Disconnected {
            return Err(NetError::InvalidState(current));
        }
        if peer.station_uuid.is_nil() {
            return Err(NetError::InvalidPeer("nil station UUID".into()));
        }
        let remote = peer
            .socket_addr()
            .map_err(|e| NetError::InvalidPeer(e.to_string()))?;

        if let Some(old) = self.session.take() {
            old.task.abort();
            old.shared.release(&self.ctx.peers);
        }

        let id = self.ctx.next_session_id();
        self.state.activate(id, SessionState::Connecting);
        self.last_peer = Some(peer.clone());

        let stream = match codec::connect(remote, self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to connect to peer");
                self.state.set_for(id, SessionState::Disconnected);
                return Err(e);
            }
        };
        info!(peer = %remote, station = %peer.station_uuid, session = id, "Connected to peer");

        let shared = Arc::new(SessionShared {
            id,
            closing: AtomicBool::new(false),
            remote_left: AtomicBool::new(false),
            pending_join: Mutex::new(None),
            remote_station: Mutex::new(None),
            pinned: Mutex::new(None),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let session = Session {
            ctx: self.ctx.clone(),
            auto_download: self.config.auto_download,
            state: self.state.clone(),
            shared: shared.clone(),
            peer: peer.clone(),
            remote,
            commands: commands_tx.clone(),
        };
        let task = tokio::spawn(session.run(stream, commands_rx));

        self.session = Some(ActiveSession {
            shared,
            remote,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    /// Send JOIN and wait for the acknowledgement.
    ///
    /// On success the peer's commit log has been merged and the client is
    /// `Joined`. A refusal leaves the client `Disconnected`.
    pub async fn join(&mut self) -> Result<StationUuid, NetError> {
        let state = self.state();
        let Some(session) = self.session.as_ref() else {
            return Err(NetError::NotConnected);
        };
        if state != SessionState::Connecting {
            return Err(NetError::InvalidState(state));
        }
        let id = session.shared.id;

        let (ack_tx, ack_rx) = oneshot::channel();
        match session.shared.pending_join.lock() {
            Ok(mut pending) => *pending = Some(ack_tx),
            Err(_) => return Err(NetError::Connection("session state poisoned".into())),
        }
        self.state.set_for(id, SessionState::Joining);

        let mut join = WireMessage::new(MessageKind::Join, self.ctx.station_uuid())
            .with_station(&self.ctx.station_name, &self.ctx.provider)
            .with_commits(self.ctx.local_log());
        if let Some(port) = self.config.listen_port {
            join = join.with_port(port);
        }
        debug!(session = id, "Sending MVR_JOIN");
        if session.commands.send(SessionCommand::Send(join)).is_err() {
            self.state.set_for(id, SessionState::Disconnected);
            return Err(NetError::Connection("session closed before JOIN".into()));
        }

        let ack = if self.config.join_timeout.is_zero() {
            ack_rx.await
        } else {
            match tokio::time::timeout(self.config.join_timeout, ack_rx).await {
                Ok(ack) => ack,
                Err(_) => {
                    warn!(session = id, "No MVR_JOIN_RET in time, dropping session");
                    self.stop();
                    return Err(NetError::Timeout("waiting for MVR_JOIN_RET".into()));
                }
            }
        };

        match ack {
            Ok(Ok(station)) => Ok(station),
            Ok(Err(reason)) => {
                self.session = None;
                Err(NetError::JoinRejected(reason))
            }
            Err(_) => Err(NetError::Connection("connection lost while joining".into())),
        }
    }

    /// Send LEAVE, give it a grace period to flush, then tear down.
    /// Does nothing when already disconnected.
    pub async fn leave(&mut self) -> Result<(), NetError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let id = session.shared.id;
        if self.state.get_for(id) == Some(SessionState::Disconnected) {
            session.task.abort();
            return Ok(());
        }

        session.shared.closing.store(true, Ordering::Release);
        self.state.set_for(id, SessionState::Leaving);

        let leave = WireMessage::new(MessageKind::Leave, self.ctx.station_uuid());
        let _ = session.commands.send(SessionCommand::Send(leave));
        tokio::time::sleep(self.config.leave_grace).await;
        let _ = session.commands.send(SessionCommand::Close);

        let mut task = session.task;
        if tokio::time::timeout(self.config.leave_grace, &mut task).await.is_err() {
            task.abort();
        }
        session.shared.release(&self.ctx.peers);

        self.state.set_for(id, SessionState::Disconnected);
        info!(peer = %session.remote, session = id, "Left peer");
        Ok(())
    }

    /// Request the artifact of `commit` from the joined peer.
    pub fn request_file(&self, commit: &Commit) -> Result<TransferHandle, NetError> {
        match &self.session {
            Some(session) if self.state.get_for(session.shared.id) == Some(SessionState::Joined) => {
                Ok(self
                    .ctx
                    .transfers
                    .request(commit, session.remote, Some(session.shared.id)))
            }
            _ => Err(NetError::NotConnected),
        }
    }

    /// Tear the session down immediately, cancelling the transfers it started.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.shared.id;
        session.shared.closing.store(true, Ordering::Release);
        session.task.abort();
        session.shared.release(&self.ctx.peers);

        let cancelled = self.ctx.transfers.cancel_owned_by(id);
        self.state.set_for(id, SessionState::Disconnected);
        info!(peer = %session.remote, session = id, cancelled, "Client session stopped");
    }

    /// Connect to the last selected peer again and join.
    pub async fn rejoin(&mut self) -> Result<StationUuid, NetError> {
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(NetError::InvalidState(state));
        }
        let peer = self.last_peer.clone().ok_or(NetError::NotConnected)?;
        info!(station = %peer.station_uuid, "Rejoining peer");
        self.connect(&peer).await?;
        self.join().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
            session.shared.release(&self.ctx.peers);
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct Session {
    ctx: StationContext,
    auto_download: bool,
    state: Arc<StateCell>,
    shared: Arc<SessionShared>,
    peer: PeerInfo,
    remote: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl Session {
    async fn run(self, stream: TcpStream, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let write_loop = async {
            while let Some(cmd) = commands.recv().await {
                match cmd {
                    SessionCommand::Send(msg) => {
                        if let Err(e) = codec::write_message(&mut write_half, &msg).await {
                            return SessionEnd::Fault(e);
                        }
                    }
                    SessionCommand::Close => {
                        let _ = write_half.shutdown().await;
                        return SessionEnd::Local;
                    }
                }
            }
            SessionEnd::Local
        };

        let end = tokio::select! {
            end = self.read_loop(&mut reader) => end,
            end = write_loop => end,
        };
        self.finish(end);
    }

    async fn read_loop(&self, reader: &mut BufReader<OwnedReadHalf>) -> SessionEnd {
        loop {
            let frame = match codec::read_frame(reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Fault(e),
            };

            match frame {
                Frame::Message(msg) => match self.handle_message(msg) {
                    Ok(Some(end)) => return end,
                    Ok(None) => {}
                    Err(e) => warn!(peer = %self.remote, error = %e, "Ignoring invalid message"),
                },
                Frame::Malformed(e) => {
                    warn!(peer = %self.remote, error = %e, "Ignoring malformed message");
                }
                Frame::File(len) => {
                    debug!(peer = %self.remote, bytes = len, "Discarding unsolicited file payload");
                    if let Err(e) = codec::discard(reader, len).await {
                        return SessionEnd::Fault(e);
                    }
                }
            }
        }
    }

    fn handle_message(&self, msg: WireMessage) -> Result<Option<SessionEnd>, NetError> {
        let sender = msg.sender()?;
        self.ctx.peers.touch(sender);
        let local = self.ctx.station_uuid();
        if msg.kind != MessageKind::JoinRet {
            self.note_peer_info(sender, &msg);
        }

        match msg.kind {
            MessageKind::JoinRet => return Ok(self.on_join_ret(sender, msg)),
            MessageKind::Commit => {
                self.accept_commits(sender, msg.commits(sender));
                self.send(WireMessage::reply(MessageKind::CommitRet, local, true, None));
            }
            MessageKind::Leave => {
                info!(peer = %self.remote, station = %sender, "Peer ended the session");
                self.shared.remote_left.store(true, Ordering::Release);
                self.send(WireMessage::reply(MessageKind::LeaveRet, local, true, None));
                let _ = self.commands.send(SessionCommand::Close);
            }
            MessageKind::FileRequest => {
                self.send(WireMessage::reply(
                    MessageKind::FileRequestRet,
                    local,
                    false,
                    Some("file requests are served by the station listener".into()),
                ));
            }
            MessageKind::Join | MessageKind::LeaveRet | MessageKind::CommitRet | MessageKind::FileRequestRet => {
                debug!(peer = %self.remote, kind = ?msg.kind, "Ignoring message on client session");
            }
        }
        Ok(None)
    }

    fn on_join_ret(&self, sender: StationUuid, msg: WireMessage) -> Option<SessionEnd> {
        let id = self.shared.id;
        let ack = self.shared.pending_join.lock().ok().and_then(|mut p| p.take());
        let Some(ack) = ack else {
            debug!(peer = %self.remote, "Unsolicited MVR_JOIN_RET");
            return None;
        };
        if let Ok(mut station) = self.shared.remote_station.lock() {
            *station = Some(sender);
        }

        if !msg.is_ok() {
            let reason = msg.message.clone().unwrap_or_else(|| "join refused".into());
            warn!(peer = %self.remote, station = %sender, reason = %reason, "Join rejected");
            self.state.set_for(id, SessionState::Disconnected);
            self.ctx.events.emit(StationEvent::JoinResult {
                station: Some(sender),
                ok: false,
                message: Some(reason.clone()),
            });
            let _ = ack.send(Err(reason));
            return Some(SessionEnd::Rejected);
        }

        if sender != self.peer.station_uuid {
            warn!(expected = %self.peer.station_uuid, actual = %sender, "Peer answered with a different station UUID");
        }
        info!(peer = %self.remote, station = %sender, session = id, "Joined peer");
        self.state.set_for(id, SessionState::Joined);
        self.ctx.events.emit(StationEvent::JoinResult {
            station: Some(sender),
            ok: true,
            message: None,
        });

        let mut info = self.peer.clone();
        info.station_uuid = sender;
        info.station_name = msg.station_name.clone().unwrap_or_default();
        info.provider_name = msg.provider.clone().unwrap_or_default();
        if self.ctx.peers.upsert(info) {
            if let Some(updated) = self.ctx.peers.get(sender) {
                self.ctx.events.emit(StationEvent::PeerUpdated(updated));
            }
        }
        if self.ctx.peers.pin(sender) {
            if let Ok(mut pinned) = self.shared.pinned.lock() {
                *pinned = Some(sender);
            }
        }

        self.accept_commits(sender, msg.commits(sender));
        let _ = ack.send(Ok(sender));
        None
    }

    /// Any message naming its station or provider refreshes the directory.
    fn note_peer_info(&self, sender: StationUuid, msg: &WireMessage) {
        if msg.station_name.is_none() && msg.provider.is_none() {
            return;
        }
        let mut info = match self.ctx.peers.get(sender) {
            Some(known) => known,
            None if sender == self.peer.station_uuid => self.peer.clone(),
            None => return,
        };
        if let Some(name) = &msg.station_name {
            info.station_name = name.clone();
        }
        if let Some(provider) = &msg.provider {
            info.provider_name = provider.clone();
        }
        if self.ctx.peers.upsert(info) {
            if let Some(updated) = self.ctx.peers.get(sender) {
                self.ctx.events.emit(StationEvent::PeerUpdated(updated));
            }
        }
    }

    fn accept_commits(&self, station: StationUuid, commits: Vec<Commit>) {
        if commits.is_empty() {
            return;
        }
        let accepted = match self.ctx.commits.merge(station, commits) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(station = %station, error = %e, "Failed to store received commits");
                return;
            }
        };
        if accepted.is_empty() {
            debug!(station = %station, "All received commits already known");
            return;
        }

        info!(station = %station, count = accepted.len(), "Received commits");
        self.ctx.events.emit(StationEvent::CommitsReceived {
            station,
            commits: accepted.clone(),
        });
        if self.auto_download {
            for commit in &accepted {
                self.ctx.transfers.request(commit, self.remote, Some(self.shared.id));
            }
        }
    }

    fn send(&self, msg: WireMessage) {
        if self.commands.send(SessionCommand::Send(msg)).is_err() {
            debug!(peer = %self.remote, "Session writer gone, dropping message");
        }
    }

    fn finish(&self, end: SessionEnd) {
        let id = self.shared.id;
        // Wakes a join() still waiting for its acknowledgement.
        if let Ok(mut pending) = self.shared.pending_join.lock() {
            pending.take();
        }
        self.shared.release(&self.ctx.peers);

        let station = self.shared.remote_station.lock().ok().and_then(|s| *s);
        let closing = self.shared.closing.load(Ordering::Acquire);
        let remote_left = self.shared.remote_left.load(Ordering::Acquire);
        let was_joined = self.state.get_for(id) == Some(SessionState::Joined);

        match end {
            SessionEnd::Rejected => debug!(session = id, "Session closed after rejected join"),
            _ if closing => debug!(session = id, "Session closed locally"),
            SessionEnd::Local if !remote_left => debug!(session = id, "Session writer closed"),
            SessionEnd::Fault(e) => warn!(peer = %self.remote, session = id, error = %e, "Session lost"),
            SessionEnd::Closed | SessionEnd::Local => info!(peer = %self.remote, session = id, "Session closed by peer"),
        }

        if !closing && was_joined {
            self.ctx.events.emit(StationEvent::ConnectionLost { station });
        }
        self.state.set_for(id, SessionState::Disconnected);
    }
}
