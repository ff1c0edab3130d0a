//! The per-torrent engine.
//!
//! An [`Engine`] owns every component of one torrent (storage, picker,
//! choker, downloader, uploader, connecter, encrypter and tracker client)
//! and drives them from a single task. Socket traffic, timers, tracker
//! replies and user commands arrive one at a time, so a handler's updates
//! to the components are never interleaved with another handler's.
//!
//! Control goes through the [`EngineHandle`] returned alongside the engine:
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmcore::config::Config;
//! use swarmcore::engine::Engine;
//! use swarmcore::metainfo::Metainfo;
//! use swarmcore::session::Session;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Metainfo::from_file("debian.iso.torrent")?;
//! let session = Arc::new(Session::new());
//! let (engine, mut handle) =
//!     Engine::new(&metainfo, "./downloads", Config::default(), session).await?;
//! let task = tokio::spawn(engine.run());
//!
//! handle.wait_for(|status| status.seeding).await?;
//! handle.stop()?;
//! task.await??;
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::EngineError;

use crate::bencode::FromBencode;
use crate::choker::{Choker, PeerView};
use crate::config::{AllocType, Config};
use crate::connecter::{Connecter, ConnecterOptions, PeerEvent};
use crate::constants::{
    ALLOC_INTERVAL, CONNECT_RETRY_DELAY, CONNECT_TIMEOUT, PICKER_SHUFFLE_INTERVAL,
    SUPER_SEED_INTERVAL,
};
use crate::download::{DownloadContext, DownloadEvent, DownloadOptions, Downloader};
use crate::encrypter::{reannounce_delay, Admitted, Encrypter, EncrypterOptions};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::PeerId;
use crate::picker::{PiecePicker, SuperSeedAction};
use crate::rawserver::{Outgoing, RawEvent, RawServer, SocketId, TaskId};
use crate::session::Session;
use crate::storage::{FileEntry, Snapshot, StorageBackend, StorageOptions, StorageWrapper};
use crate::tracker::{AnnounceOutcome, AnnounceRequest, Rerequester, TrackerEvent};
use crate::upload::{PumpState, UploadOptions, Uploader};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Requests sent to a running engine through its [`EngineHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Announce `stopped`, save resume state and close every connection.
    Stop,
    /// Queue peer addresses for connecting.
    AddPeers(Vec<SocketAddr>),
    /// New rate caps in KiB/s, 0 for unlimited.
    SetRateLimits { upload: u64, download: u64 },
    /// Choke everyone until resumed.
    Pause,
    Resume,
    /// Drop verified pieces whose data changed on disk.
    Invalidate(Vec<Range<usize>>),
}

/// A snapshot of torrent progress, republished after every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub pieces: usize,
    pub have: usize,
    /// Bytes still missing.
    pub left: u64,
    /// Totals include what earlier sessions saved in the resume snapshot.
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes per second.
    pub upload_rate: f64,
    pub download_rate: f64,
    pub peers: usize,
    pub seeding: bool,
    pub endgame: bool,
    /// False once the engine has shut down.
    pub running: bool,
}

/// Control side of an [`Engine`]. Cheap to clone.
///
/// Dropping every handle stops the engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    listen_addr: SocketAddr,
    peer_id: PeerId,
}

impl EngineHandle {
    /// The address the engine accepts peers on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Waits until `done` holds for the published status.
    pub async fn wait_for(
        &mut self,
        done: impl FnMut(&Status) -> bool,
    ) -> Result<Status, EngineError> {
        let status = self
            .status
            .wait_for(done)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(status.clone())
    }

    pub fn add_peers(&self, addrs: Vec<SocketAddr>) -> Result<(), EngineError> {
        self.send(Command::AddPeers(addrs))
    }

    pub fn set_rate_limits(&self, upload: u64, download: u64) -> Result<(), EngineError> {
        self.send(Command::SetRateLimits { upload, download })
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(Command::Resume)
    }

    pub fn invalidate(&self, ranges: Vec<Range<usize>>) -> Result<(), EngineError> {
        self.send(Command::Invalidate(ranges))
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.send(Command::Stop)
    }

    pub fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Choke,
    KeepAlive,
    TimeoutScan,
    HandshakeTimeout,
    Pex,
    Flush,
    Allocate,
    Shuffle,
    SuperSeed,
    /// Resume a rate-limited upload.
    Pump(SocketId),
    /// Retry connects held back by the session quota.
    Connect,
    Announce,
}

/// Where a socket is in its life. Handshaking sockets live in the
/// encrypter, established ones in the connecter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Established,
}

enum Wake {
    Raw(RawEvent<Task>),
    Command(Command),
    Announced(AnnounceOutcome),
}

pub struct Engine {
    config: Config,
    info_hash: [u8; 20],
    peer_id: PeerId,
    listen_port: u16,
    pex_enabled: bool,
    session: Arc<Session>,

    raw: RawServer<Task>,
    storage: StorageWrapper,
    picker: PiecePicker,
    choker: Choker<SocketId>,
    downloader: Downloader,
    uploader: Uploader,
    connecter: Connecter,
    encrypter: Encrypter,
    rerequester: Rerequester,

    phases: HashMap<SocketId, Phase>,
    /// Uploads waiting for their socket to drain.
    backlogged: HashSet<SocketId>,
    /// Uploads with a scheduled resume after hitting the rate cap.
    throttled: HashSet<SocketId>,

    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
    announce_tx: mpsc::UnboundedSender<AnnounceOutcome>,
    announce_rx: mpsc::UnboundedReceiver<AnnounceOutcome>,
    workers: Vec<JoinHandle<()>>,
    announce_task: Option<TaskId>,
    connect_retry: Option<TaskId>,
    /// Event for the next announce; cleared once a tracker accepts it.
    pending_event: TrackerEvent,
    sent_event: TrackerEvent,

    snapshot_path: PathBuf,
    uploaded_base: u64,
    downloaded_base: u64,
    was_complete: bool,
}

impl Engine {
    /// Opens storage under `download_dir`, binds the listener and builds
    /// every component. Nothing runs until [`run`](Self::run) is awaited.
    ///
    /// A resume snapshot left by an earlier session is picked up from
    /// beside the data; without one, existing files are hashed.
    pub async fn new(
        metainfo: &Metainfo,
        download_dir: impl Into<PathBuf>,
        mut config: Config,
        session: Arc<Session>,
    ) -> Result<(Self, EngineHandle), EngineError> {
        config.normalize();
        let now = Instant::now();
        let dir = download_dir.into();
        let info = &metainfo.info;
        let info_hash = *metainfo.info_hash.as_bytes();

        let files = info.files.iter().map(FileEntry::from).collect();
        let backend = StorageBackend::open(dir.clone(), files).await?;
        let snapshot_path = dir.join(format!(".{}.resume", metainfo.info_hash.to_hex()));
        let snapshot = load_snapshot(&snapshot_path).await;
        let (uploaded_base, downloaded_base) = snapshot
            .as_ref()
            .map_or((0, 0), |s| (s.uploaded, s.downloaded));
        let storage = StorageWrapper::open(
            backend,
            info.pieces.clone(),
            info.piece_length,
            StorageOptions::from(&config),
            snapshot,
            |done| trace!("checked {:.0}% of existing data", done * 100.0),
        )
        .await?;

        let mut picker = PiecePicker::new(storage.piece_count(), config.rarest_first_cutoff);
        for piece in storage.have_list().iter_set() {
            picker.complete(piece);
        }
        if config.stream_window > 0 {
            picker.set_streaming(config.stream_window);
        }
        if config.super_seeder && storage.is_complete() {
            picker.set_super_seed();
        }

        let raw = RawServer::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
        let listen_addr = raw
            .local_addr()
            .ok_or_else(|| io::Error::other("listener has no local address"))?;
        let peer_id = PeerId::generate();

        let pex_max = if info.private {
            0
        } else {
            config.ut_pex_max_addrs_from_peer
        };
        let connecter = Connecter::new(ConnecterOptions {
            piece_count: storage.piece_count(),
            listen_port: listen_addr.port(),
            pex_max,
            overlay_support: config.overlay_support,
        });
        let encrypter = Encrypter::new(
            EncrypterOptions::from(&config),
            info_hash,
            peer_id,
            Arc::clone(&session),
        );
        let rerequester = Rerequester::new(
            metainfo.tracker_tiers(),
            config.rerequest_interval,
            config.http_timeout,
            Arc::clone(&session),
        )?;

        let mut choker = Choker::new(&config, now);
        if let Some(ip) = config.ip.as_deref().and_then(|ip| ip.parse::<IpAddr>().ok()) {
            choker.set_local_ip(ip);
        }
        let downloader = Downloader::new(DownloadOptions::from(&config), now);
        let uploader = Uploader::new(UploadOptions::from(&config), now);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(Status::default());
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let was_complete = storage.is_complete();

        let mut engine = Self {
            config,
            info_hash,
            peer_id,
            listen_port: listen_addr.port(),
            pex_enabled: pex_max > 0,
            session,
            raw,
            storage,
            picker,
            choker,
            downloader,
            uploader,
            connecter,
            encrypter,
            rerequester,
            phases: HashMap::new(),
            backlogged: HashSet::new(),
            throttled: HashSet::new(),
            commands,
            status,
            announce_tx,
            announce_rx,
            workers: Vec::new(),
            announce_task: None,
            connect_retry: None,
            pending_event: TrackerEvent::Started,
            sent_event: TrackerEvent::None,
            snapshot_path,
            uploaded_base,
            downloaded_base,
            was_complete,
        };
        engine.publish_status(now);

        let handle = EngineHandle {
            commands: commands_tx,
            status: status_rx,
            listen_addr,
            peer_id,
        };
        Ok((engine, handle))
    }

    /// [`new`](Self::new) for a `.torrent` file on disk.
    pub async fn from_torrent_file(
        path: impl AsRef<Path>,
        download_dir: impl Into<PathBuf>,
        config: Config,
        session: Arc<Session>,
    ) -> Result<(Self, EngineHandle), EngineError> {
        let metainfo = Metainfo::from_file(path)?;
        Self::new(&metainfo, download_dir, config, session).await
    }

    /// Where the resume snapshot is written on stop.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Runs until stopped. A storage failure ends the torrent and is
    /// returned after the rest of the shutdown has been attempted.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.start();
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!("torrent failed: {}", e);
        }
        let stopped = self.shutdown(result.is_ok()).await;
        match result {
            Ok(()) => stopped,
            Err(e) => {
                if let Err(other) = stopped {
                    warn!("shutdown after failure also failed: {}", other);
                }
                Err(e)
            }
        }
    }

    fn start(&mut self) {
        info!(
            info_hash = %InfoHash(self.info_hash).to_hex(),
            pieces = self.storage.piece_count(),
            have = self.storage.have_list().count(),
            port = self.listen_port,
            "torrent started"
        );
        self.raw.schedule(self.config.choke_interval, Task::Choke);
        self.raw.schedule(self.config.keepalive_interval, Task::KeepAlive);
        self.raw.schedule(self.config.timeout_check_interval, Task::TimeoutScan);
        self.raw.schedule(PICKER_SHUFFLE_INTERVAL, Task::Shuffle);
        if self.pex_enabled {
            self.raw.schedule(self.config.pex_interval, Task::Pex);
        }
        if let Some(period) = self.config.flush_period() {
            self.raw.schedule(period, Task::Flush);
        }
        if self.config.alloc_type == AllocType::Background {
            self.raw.schedule(ALLOC_INTERVAL, Task::Allocate);
        }
        if self.picker.is_super_seeding() {
            self.raw.schedule(SUPER_SEED_INTERVAL, Task::SuperSeed);
        }
        self.announce();
    }

    async fn event_loop(&mut self) -> Result<(), EngineError> {
        loop {
            let wake = tokio::select! {
                event = self.raw.next_event() => Wake::Raw(event),
                command = self.commands.recv() => Wake::Command(command.unwrap_or(Command::Stop)),
                Some(outcome) = self.announce_rx.recv() => Wake::Announced(outcome),
            };
            let now = Instant::now();
            match wake {
                Wake::Raw(event) => self.handle_raw(event, now).await?,
                Wake::Command(Command::Stop) => return Ok(()),
                Wake::Command(command) => self.handle_command(command, now),
                Wake::Announced(outcome) => self.tracker_answered(outcome, now),
            }
            self.publish_status(now);
        }
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    async fn handle_raw(&mut self, event: RawEvent<Task>, now: Instant) -> Result<(), EngineError> {
        match event {
            RawEvent::Accepted { id, addr } => {
                match self.encrypter.accepted(id, addr, self.connecter.len(), now) {
                    Some(handshake) => self.handshaking(id, handshake),
                    None => self.raw.close(id),
                }
            }
            RawEvent::Connected { id, addr, permit } => {
                let handshake = self.encrypter.connected(id, addr, permit, now);
                self.handshaking(id, handshake);
            }
            RawEvent::ConnectFailed { addr, error } => {
                debug!("connect to {} failed: {}", addr, error);
                self.encrypter.connect_failed(addr);
                self.start_connects();
            }
            RawEvent::Data { id, data } => match self.phases.get(&id).copied() {
                Some(Phase::Handshaking) => {
                    match self.encrypter.receive(id, &data, &self.connecter) {
                        Ok(Some(admitted)) => self.established(id, admitted, now).await?,
                        Ok(None) => {}
                        Err(e) => {
                            debug!("handshake on {} failed: {}", id, e);
                            self.close(id, now);
                        }
                    }
                }
                Some(Phase::Established) => self.peer_data(id, &data, now).await?,
                None => {}
            },
            RawEvent::Flushed { id } => {
                if self.backlogged.remove(&id) {
                    self.pump(id, now).await?;
                }
            }
            RawEvent::Closed { id, error } => {
                if let Some(e) = error {
                    debug!("{} closed: {}", id, e);
                }
                self.drop_connection(id, now);
            }
            RawEvent::Task(task) => self.run_task(task, now).await?,
        }
        Ok(())
    }

    fn handshaking(&mut self, id: SocketId, handshake: Bytes) {
        self.raw.send(id, handshake);
        self.phases.insert(id, Phase::Handshaking);
        self.raw
            .schedule(self.config.handshake_timeout, Task::HandshakeTimeout);
    }

    async fn established(
        &mut self,
        id: SocketId,
        admitted: Admitted,
        now: Instant,
    ) -> Result<(), EngineError> {
        let Admitted {
            addr,
            peer_id,
            locally_initiated,
            supports_extensions,
            rest,
        } = admitted;
        self.phases.insert(id, Phase::Established);

        // the bitfield must be the first message after the handshake
        let mut out = Outgoing::new();
        self.uploader.make_upload(id, addr.ip(), now);
        self.uploader.send_initial(
            id,
            &mut self.storage,
            self.picker.is_super_seeding(),
            &mut out,
        );
        self.connecter.connection_made(
            id,
            addr,
            peer_id,
            locally_initiated,
            supports_extensions,
            now,
            &mut out,
        );
        self.downloader
            .make_download(id, addr.ip(), self.storage.piece_count(), now);
        self.choker.connection_made(id);
        self.send_all(out, now);
        debug!(
            peer = %addr,
            client = peer_id.client_id().unwrap_or("unknown"),
            outbound = locally_initiated,
            "connection established"
        );

        if !rest.is_empty() {
            self.peer_data(id, &rest, now).await?;
        }
        Ok(())
    }

    async fn peer_data(&mut self, id: SocketId, data: &[u8], now: Instant) -> Result<(), EngineError> {
        let events = match self.connecter.receive(id, data, now) {
            Ok(events) => events,
            Err(e) => {
                debug!("closing {}: {}", id, e);
                self.close(id, now);
                return Ok(());
            }
        };
        for event in events {
            if self.phases.get(&id) != Some(&Phase::Established) {
                break;
            }
            self.peer_event(id, event, now).await?;
        }
        Ok(())
    }

    async fn peer_event(&mut self, id: SocketId, event: PeerEvent, now: Instant) -> Result<(), EngineError> {
        let mut out = Outgoing::new();
        let mut events = Vec::new();
        let mut peers = Vec::new();
        let mut rechoke = false;
        let mut pump = false;
        let mut refused = None;

        let mut ctx = DownloadContext {
            storage: &mut self.storage,
            picker: &mut self.picker,
        };
        match event {
            PeerEvent::Choke => self.downloader.got_choke(id, &mut ctx, &mut out, now),
            PeerEvent::Unchoke => self.downloader.got_unchoke(id, &mut ctx, &mut out, now),
            PeerEvent::Interested => {
                rechoke = self
                    .uploader
                    .get_mut(id)
                    .is_some_and(|upload| upload.got_interested());
            }
            PeerEvent::NotInterested => {
                rechoke = self
                    .uploader
                    .get_mut(id)
                    .is_some_and(|upload| upload.got_not_interested());
            }
            PeerEvent::Have(piece) => {
                self.downloader
                    .got_have(id, piece, &mut ctx, &mut out, now)
            }
            PeerEvent::Bitfield(have) => {
                self.downloader
                    .got_bitfield(id, have, &mut ctx, &mut out, now)
            }
            PeerEvent::Request(chunk) => {
                let max_slice = self.uploader.max_slice_length();
                if let Some(upload) = self.uploader.get_mut(id) {
                    match upload.got_request(chunk, ctx.storage, max_slice) {
                        Ok(()) => pump = true,
                        Err(e) => refused = Some(e),
                    }
                }
            }
            PeerEvent::Piece(block) => {
                events = self
                    .downloader
                    .got_piece(id, block, &mut ctx, &mut out, now)
                    .await?;
            }
            PeerEvent::Cancel(chunk) => {
                if let Some(upload) = self.uploader.get_mut(id) {
                    upload.got_cancel(&chunk);
                }
            }
            PeerEvent::Extensions(handshake) => {
                trace!(
                    "{} speaks {:?} ({})",
                    id,
                    handshake.extensions.keys().collect::<Vec<_>>(),
                    handshake.client.as_deref().unwrap_or("unnamed client")
                );
            }
            PeerEvent::Pex(message) => {
                peers = message.added.into_iter().map(|peer| peer.addr).collect();
            }
            PeerEvent::Overlay(payload) => {
                trace!("ignoring {} bytes of overlay traffic from {}", payload.len(), id);
            }
        }
        self.send_all(out, now);

        if let Some(e) = refused {
            debug!("dropping {}: {}", id, e);
            self.close(id, now);
            return Ok(());
        }
        if !peers.is_empty() {
            trace!("{} sent {} peers", id, peers.len());
            self.encrypter.enqueue(peers);
            self.start_connects();
        }
        self.download_events(events, now);
        if rechoke {
            self.rechoke(now);
        }
        if pump && self.phases.get(&id) == Some(&Phase::Established) {
            self.pump(id, now).await?;
        }
        Ok(())
    }

    fn download_events(&mut self, events: Vec<DownloadEvent>, now: Instant) {
        let mut completed = false;
        for event in events {
            match event {
                DownloadEvent::PieceComplete(piece) => {
                    let mut out = Outgoing::new();
                    self.connecter.broadcast_have(piece, &mut out);
                    self.send_all(out, now);
                    completed = true;
                }
                DownloadEvent::PieceFailed(piece) => {
                    debug!(piece, "piece goes back into the request pool");
                }
                DownloadEvent::Kick(ip) => self.close_ip(ip, now),
                DownloadEvent::Ban(ip) => {
                    self.session.ban(ip);
                    self.close_ip(ip, now);
                }
            }
        }
        if completed && !self.was_complete && self.storage.is_complete() {
            self.download_finished(now);
        }
    }

    fn download_finished(&mut self, now: Instant) {
        self.was_complete = true;
        info!(
            pieces = self.storage.piece_count(),
            downloaded = self.downloaded(),
            "download complete"
        );
        self.pending_event = TrackerEvent::Completed;
        self.announce();

        // seeds have nothing left to offer us
        let seeds: Vec<SocketId> = self
            .connecter
            .ids()
            .filter(|id| {
                self.downloader
                    .get(*id)
                    .is_some_and(|d| d.have().is_complete())
            })
            .collect();
        for id in seeds {
            self.close(id, now);
        }
        self.rechoke(now);
    }

    /// Queues the messages on their sockets.
    fn send_all(&mut self, out: Outgoing, now: Instant) {
        for (id, message) in out {
            if self.raw.send(id, message.encode()) {
                self.connecter.note_sent(id, now);
            }
        }
    }

    fn close(&mut self, id: SocketId, now: Instant) {
        self.raw.close(id);
        self.drop_connection(id, now);
    }

    fn close_ip(&mut self, ip: IpAddr, now: Instant) {
        let ids: Vec<SocketId> = self
            .connecter
            .iter()
            .filter(|(_, conn)| conn.addr().ip() == ip)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            self.close(id, now);
        }
    }

    /// Forgets a socket the raw server no longer has.
    fn drop_connection(&mut self, id: SocketId, now: Instant) {
        self.backlogged.remove(&id);
        self.throttled.remove(&id);
        match self.phases.remove(&id) {
            None => return,
            Some(Phase::Handshaking) => {
                self.encrypter.closed(id);
            }
            Some(Phase::Established) => {
                let addr = self.connecter.lost_connection(id).map(|conn| conn.addr());
                let upload = self.uploader.lost_connection(id);
                let mut out = Outgoing::new();
                let mut ctx = DownloadContext {
                    storage: &mut self.storage,
                    picker: &mut self.picker,
                };
                self.downloader.lost_connection(id, &mut ctx, &mut out, now);
                self.choker.connection_lost(id);
                if let Some(addr) = addr {
                    self.picker.super_seed_lost_peer(addr);
                    debug!(peer = %addr, "connection lost");
                }
                self.send_all(out, now);

                if upload.is_some_and(|u| u.is_interested() && !u.is_choked()) {
                    self.rechoke(now);
                }
                if self.connecter.is_empty()
                    && !self.rerequester.in_flight()
                    && self
                        .rerequester
                        .contacted_within(now, self.config.rerequest_interval)
                {
                    let delay = reannounce_delay();
                    debug!("swarm is empty, announcing again in {:?}", delay);
                    if let Some(task) = self.announce_task.take() {
                        self.raw.cancel(task);
                    }
                    self.announce_task = Some(self.raw.schedule(delay, Task::Announce));
                }
            }
        }
        self.start_connects();
    }

    fn start_connects(&mut self) {
        let connects = self.encrypter.next_connects(self.connecter.len());
        for (addr, permit) in connects.start {
            trace!("connecting to {}", addr);
            self.raw.connect(addr, CONNECT_TIMEOUT, Some(permit));
        }
        if connects.deferred && self.connect_retry.is_none() {
            self.connect_retry = Some(self.raw.schedule(CONNECT_RETRY_DELAY, Task::Connect));
        }
    }

    // ------------------------------------------------------------------
    // Uploading and choking
    // ------------------------------------------------------------------

    async fn pump(&mut self, id: SocketId, now: Instant) -> Result<(), EngineError> {
        if self.throttled.contains(&id) {
            return Ok(());
        }
        let mut out = Outgoing::new();
        let queued = self.raw.queued(id);
        let pumped = self
            .uploader
            .pump(id, &mut self.storage, queued, &mut out, now)
            .await?;
        self.send_all(out, now);

        match pumped.state {
            PumpState::Idle => {}
            PumpState::Backlogged => {
                self.backlogged.insert(id);
            }
            PumpState::Throttled(delay) => {
                self.throttled.insert(id);
                self.raw.schedule(delay, Task::Pump(id));
            }
        }

        if !pumped.lost.is_empty() {
            for &piece in &pumped.lost {
                self.picker.invalidate(piece);
            }
            let mut out = Outgoing::new();
            let mut ctx = DownloadContext {
                storage: &mut self.storage,
                picker: &mut self.picker,
            };
            self.downloader.check_interests(&mut ctx, &mut out);
            self.send_all(out, now);
            self.was_complete = self.storage.is_complete();
        }
        Ok(())
    }

    fn peer_views(&mut self, now: Instant) -> HashMap<SocketId, PeerView> {
        let ids: Vec<SocketId> = self.connecter.ids().collect();
        let mut views = HashMap::with_capacity(ids.len());
        for id in ids {
            let snubbed = self.downloader.is_snubbed(id, now);
            let download_rate = self.downloader.get_mut(id).map_or(0.0, |d| d.rate(now));
            let Some(upload) = self.uploader.get_mut(id) else {
                continue;
            };
            views.insert(
                id,
                PeerView {
                    interested: upload.is_interested(),
                    choked: upload.is_choked(),
                    download_rate,
                    upload_rate: upload.rate(now),
                    snubbed,
                    ip: Some(upload.ip()),
                    forward: None,
                },
            );
        }
        views
    }

    fn rechoke(&mut self, now: Instant) {
        let views = self.peer_views(now);
        let seeding = self.storage.is_complete();
        let decisions = self.choker.rechoke(seeding, |id| views.get(id).copied());
        self.apply_choke(decisions, now);
    }

    fn apply_choke(&mut self, decisions: Vec<(SocketId, bool)>, now: Instant) {
        let mut out = Outgoing::new();
        for (id, unchoke) in decisions {
            self.uploader.set_choked(id, !unchoke, &mut out);
        }
        self.send_all(out, now);
    }

    fn super_seed_round(&mut self, now: Instant) {
        let mut out = Outgoing::new();
        let mut hidden_seeds = Vec::new();
        let ids: Vec<SocketId> = self.connecter.ids().collect();
        for id in ids {
            let (Some(conn), Some(download), Some(upload)) = (
                self.connecter.get(id),
                self.downloader.get(id),
                self.uploader.get_mut(id),
            ) else {
                continue;
            };
            let ever_interested = upload.ever_interested();
            let action = self.picker.next_have(
                conn.addr(),
                download.have(),
                ever_interested,
                &mut upload.skipped,
                false,
                now,
            );
            match action {
                SuperSeedAction::Wait => {}
                SuperSeedAction::Offer(piece) => upload.offer(piece, &mut out),
                SuperSeedAction::Close => hidden_seeds.push(id),
            }
        }
        self.send_all(out, now);
        for id in hidden_seeds {
            debug!("{} never took an offered piece, closing", id);
            self.close(id, now);
        }
    }

    // ------------------------------------------------------------------
    // Timers and commands
    // ------------------------------------------------------------------

    async fn run_task(&mut self, task: Task, now: Instant) -> Result<(), EngineError> {
        match task {
            Task::Choke => {
                let mut out = Outgoing::new();
                let mut ctx = DownloadContext {
                    storage: &mut self.storage,
                    picker: &mut self.picker,
                };
                let snubbed = self.downloader.check_snubs(&mut ctx, &mut out, now);
                if !snubbed.is_empty() {
                    debug!("{} peers are snubbing us", snubbed.len());
                }
                self.send_all(out, now);

                let views = self.peer_views(now);
                let seeding = self.storage.is_complete();
                let decisions = self
                    .choker
                    .round_robin(now, seeding, |id| views.get(id).copied());
                self.apply_choke(decisions, now);
                self.raw.schedule(self.config.choke_interval, Task::Choke);
            }
            Task::KeepAlive => {
                let mut out = Outgoing::new();
                self.connecter
                    .keepalives(now, self.config.keepalive_interval, &mut out);
                self.send_all(out, now);
                self.raw.schedule(self.config.keepalive_interval, Task::KeepAlive);
            }
            Task::TimeoutScan => {
                for id in self.connecter.expired(now, self.config.timeout) {
                    debug!("{} timed out", id);
                    self.close(id, now);
                }
                self.raw
                    .schedule(self.config.timeout_check_interval, Task::TimeoutScan);
            }
            Task::HandshakeTimeout => {
                for id in self.encrypter.expire(now) {
                    debug!("handshake on {} timed out", id);
                    self.phases.remove(&id);
                    self.raw.close(id);
                }
                self.start_connects();
            }
            Task::Pex => {
                let mut out = Outgoing::new();
                self.connecter.pex_round(&mut out);
                self.send_all(out, now);
                self.raw.schedule(self.config.pex_interval, Task::Pex);
            }
            Task::Flush => {
                self.storage.flush().await?;
                if let Some(period) = self.config.flush_period() {
                    self.raw.schedule(period, Task::Flush);
                }
            }
            Task::Allocate => {
                let budget =
                    (self.config.alloc_rate * 1024.0 * 1024.0 * ALLOC_INTERVAL.as_secs_f64()) as u64;
                if self.storage.allocate_step(budget).await? {
                    self.raw.schedule(ALLOC_INTERVAL, Task::Allocate);
                } else {
                    debug!("background allocation finished");
                }
            }
            Task::Shuffle => {
                self.picker.shuffle();
                self.raw.schedule(PICKER_SHUFFLE_INTERVAL, Task::Shuffle);
            }
            Task::SuperSeed => {
                self.super_seed_round(now);
                self.raw.schedule(SUPER_SEED_INTERVAL, Task::SuperSeed);
            }
            Task::Pump(id) => {
                self.throttled.remove(&id);
                if self.phases.get(&id) == Some(&Phase::Established) {
                    self.pump(id, now).await?;
                }
            }
            Task::Connect => {
                self.connect_retry = None;
                self.start_connects();
            }
            Task::Announce => {
                self.announce_task = None;
                self.announce();
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Stop => {}
            Command::AddPeers(addrs) => {
                self.encrypter.enqueue(addrs);
                self.start_connects();
            }
            Command::SetRateLimits { upload, download } => {
                self.uploader.set_max_rate(upload * 1024);
                self.downloader.set_max_rate(download * 1024);
            }
            Command::Pause => {
                self.choker.pause();
                self.rechoke(now);
            }
            Command::Resume => {
                self.choker.unpause();
                self.rechoke(now);
            }
            Command::Invalidate(ranges) => self.invalidate(&ranges, now),
        }
    }

    /// Drops held pieces inside `ranges`; partial pieces are left alone so
    /// their outstanding requests stay valid.
    fn invalidate(&mut self, ranges: &[Range<usize>], now: Instant) {
        let held: Vec<usize> = ranges
            .iter()
            .flat_map(|range| range.clone())
            .filter(|&piece| self.storage.do_i_have(piece))
            .collect();
        for &piece in &held {
            if self.storage.live_invalidate(piece) {
                self.picker.invalidate(piece);
            }
        }
        if held.is_empty() {
            return;
        }
        warn!("{} pieces invalidated", held.len());
        self.was_complete = false;

        let mut out = Outgoing::new();
        let mut ctx = DownloadContext {
            storage: &mut self.storage,
            picker: &mut self.picker,
        };
        self.downloader.check_interests(&mut ctx, &mut out);
        self.downloader.fill_all(&mut ctx, &mut out, now);
        self.send_all(out, now);
    }

    // ------------------------------------------------------------------
    // Tracker
    // ------------------------------------------------------------------

    fn uploaded(&self) -> u64 {
        self.uploaded_base + self.uploader.total()
    }

    fn downloaded(&self) -> u64 {
        self.downloaded_base + self.downloader.total()
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        let saturated = self.connecter.len() >= self.config.connection_limit();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id.0,
            port: self.listen_port,
            uploaded: self.uploaded(),
            downloaded: self.downloaded(),
            left: self.storage.amount_left(),
            event,
            numwant: if saturated || event == TrackerEvent::Stopped {
                0
            } else {
                self.config.numwant
            },
            ip: self.config.ip.clone(),
        }
    }

    /// Starts an announce on a worker task unless one is running.
    fn announce(&mut self) {
        let request = self.announce_request(self.pending_event);
        let Some(walk) = self.rerequester.announce(request) else {
            return;
        };
        self.sent_event = self.pending_event;
        if let Some(task) = self.announce_task.take() {
            self.raw.cancel(task);
        }
        let tx = self.announce_tx.clone();
        self.workers.retain(|worker| !worker.is_finished());
        self.workers.push(tokio::spawn(async move {
            let _ = tx.send(walk.await);
        }));
    }

    fn tracker_answered(&mut self, outcome: AnnounceOutcome, now: Instant) {
        match self.rerequester.finished(outcome, now) {
            Ok(announced) => {
                if self.pending_event == self.sent_event {
                    self.pending_event = TrackerEvent::None;
                }
                info!(
                    url = %announced.url,
                    peers = announced.peers.len(),
                    seeders = announced.complete.unwrap_or(0),
                    leechers = announced.incomplete.unwrap_or(0),
                    "announced"
                );
                self.encrypter.enqueue(announced.peers);
                self.start_connects();
            }
            Err(e) => warn!("announce failed: {}", e),
        }

        // an event that came up while the last announce ran goes out now
        let delay = if self.pending_event == TrackerEvent::None {
            self.rerequester.next_delay()
        } else {
            Duration::ZERO
        };
        if let Some(task) = self.announce_task.take() {
            self.raw.cancel(task);
        }
        self.announce_task = Some(self.raw.schedule(delay, Task::Announce));
    }

    // ------------------------------------------------------------------
    // Status and shutdown
    // ------------------------------------------------------------------

    fn publish_status(&mut self, now: Instant) {
        let status = Status {
            pieces: self.storage.piece_count(),
            have: self.storage.have_list().count(),
            left: self.storage.amount_left(),
            uploaded: self.uploaded(),
            downloaded: self.downloaded(),
            upload_rate: self.uploader.rate(now),
            download_rate: self.downloader.rate(now),
            peers: self.connecter.len(),
            seeding: self.storage.is_complete(),
            endgame: self.downloader.is_endgame(),
            running: true,
        };
        self.status.send_replace(status);
    }

    /// Announces `stopped`, saves the resume snapshot and closes every
    /// socket. Storage is skipped when it already failed.
    async fn shutdown(&mut self, save: bool) -> Result<(), EngineError> {
        let now = Instant::now();
        info!("stopping torrent");
        if let Some(task) = self.announce_task.take() {
            self.raw.cancel(task);
        }
        for id in self.encrypter.close_all() {
            self.phases.remove(&id);
            self.raw.close(id);
        }

        if !self.rerequester.is_empty() {
            let walk = self
                .rerequester
                .announce_now(self.announce_request(TrackerEvent::Stopped));
            match tokio::time::timeout(self.config.http_timeout, walk).await {
                Ok(outcome) => {
                    if let Err(e) = self.rerequester.finished(outcome, now) {
                        warn!("stopped announce failed: {}", e);
                    }
                }
                Err(_) => warn!("stopped announce timed out"),
            }
        }

        let saved = if save { self.save().await } else { Ok(()) };
        self.raw.shutdown(self.config.stop_grace).await;
        self.phases.clear();
        self.join_workers().await;

        let mut status = self.status.borrow().clone();
        status.peers = 0;
        status.upload_rate = 0.0;
        status.download_rate = 0.0;
        status.running = false;
        self.status.send_replace(status);
        info!(
            uploaded = self.uploaded(),
            downloaded = self.downloaded(),
            "torrent stopped"
        );
        saved
    }

    async fn save(&mut self) -> Result<(), EngineError> {
        self.storage.flush().await?;
        let mut snapshot = self.storage.pickle();
        snapshot.uploaded = self.uploaded();
        snapshot.downloaded = self.downloaded();
        tokio::fs::write(&self.snapshot_path, snapshot.encode()).await?;
        self.storage.close().await?;
        debug!("resume state written to {}", self.snapshot_path.display());
        Ok(())
    }

    async fn join_workers(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        let aborts: Vec<AbortHandle> = workers.iter().map(|w| w.abort_handle()).collect();
        let grace = self.config.stop_grace;
        if tokio::time::timeout(grace, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("worker tasks still running after {:?}, aborting", grace);
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

async fn load_snapshot(path: &Path) -> Option<Snapshot> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("cannot read resume snapshot {}: {}", path.display(), e);
            return None;
        }
    };
    match Snapshot::from_bencode_bytes(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("ignoring damaged resume snapshot {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests;
