//! TCP transport.
//!
//! Advertising binds a listener; browsing dials a fixed list of seed
//! addresses and keeps redialing with backoff while the transport runs. Every
//! new socket goes through the same handshake:
//!
//! ```text
//! Hello   both directions   version, service namespace, peer id
//! Verdict lower id -> other whether this socket becomes the link
//! Welcome acceptor -> dialer invitation answer
//! ```
//!
//! Peers from a different namespace or protocol version are dropped before
//! anything is reported. Two peers that host and browse each other open two
//! sockets; the peer with the lower id reserves the link slot for the first
//! one it sees and declines the other, so both ends always agree on which
//! socket carries the link. After the handshake every frame is one opaque
//! envelope.
//!
//! Each link owns a writer task fed by an unbounded queue, so
//! [`Transport::send`] never waits on the socket. All tasks watch one
//! shutdown signal. TCP gives reliability and per-link ordering but no
//! encryption.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::framing::{FrameConfig, FrameError, read_frame, read_typed, write_frame, write_typed};
use crate::messages::PROTOCOL_VERSION;
use crate::peer::{PeerId, PeerIdError};
use crate::transport::{
    DEFAULT_INVITE_TIMEOUT, DEFAULT_SERVICE_TYPE, EventReceiver, EventSender, InviteResponder,
    Transport, TransportError, TransportEvent, await_invite_answer, event_channel,
};

const REDIAL_INITIAL: Duration = Duration::from_millis(500);
const REDIAL_MAX: Duration = Duration::from_secs(30);

/// Settings for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to listen on while advertising. Default: `0.0.0.0:7878`.
    pub listen_addr: SocketAddr,
    /// Addresses dialed while browsing.
    pub seeds: Vec<SocketAddr>,
    /// Service namespace; peers outside it are ignored.
    pub service: String,
    /// Frame limits.
    pub frame: FrameConfig,
    /// How long an inbound invitation may stay unanswered.
    pub invite_timeout: Duration,
    /// How long a new socket may take to complete the hello exchange.
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7878)),
            seeds: Vec::new(),
            service: DEFAULT_SERVICE_TYPE.to_string(),
            frame: FrameConfig::default(),
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// First frame sent by both ends of a new socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Hello {
    protocol_version: u8,
    service: String,
    peer_id: String,
}

/// Sent by the end with the lower peer id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Verdict {
    /// `false` when another socket already holds the link slot.
    keep: bool,
}

/// Invitation answer sent by the accepting end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Welcome {
    accepted: bool,
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("handshake timed out")]
    Timeout,
    #[error("peer speaks protocol version {0}")]
    Version(u8),
    #[error("peer belongs to service '{0}'")]
    Service(String),
    #[error("invalid peer id: {0}")]
    InvalidPeer(#[from] PeerIdError),
    #[error("connected to self")]
    SelfConnection,
    #[error("already linked to {0}")]
    AlreadyLinked(PeerId),
    #[error("invitation declined")]
    Declined,
    #[error("shutting down")]
    Shutdown,
}

/// One peer's slot in the link table.
struct Link {
    /// Identifies the socket that owns the slot.
    generation: u64,
    /// `None` until the handshake on that socket completes.
    queue: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

type LinkMap = Mutex<HashMap<PeerId, Link>>;

fn lock_links(links: &LinkMap) -> MutexGuard<'_, HashMap<PeerId, Link>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every connection task of one transport.
struct LinkContext {
    local: PeerId,
    service: String,
    frame: FrameConfig,
    invite_timeout: Duration,
    handshake_timeout: Duration,
    events: EventSender,
    links: LinkMap,
    generations: AtomicU64,
}

impl LinkContext {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn hello(&self) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            service: self.service.clone(),
            peer_id: self.local.as_str().to_string(),
        }
    }

    /// A link slot for `peer` is held, live or still handshaking.
    fn is_claimed(&self, peer: &PeerId) -> bool {
        lock_links(&self.links).contains_key(peer)
    }

    /// Free the slot for `peer` if socket `generation` still owns it.
    fn release(&self, peer: &PeerId, generation: u64) -> Option<Link> {
        let mut links = lock_links(&self.links);
        match links.get(peer) {
            Some(link) if link.generation == generation => links.remove(peer),
            _ => None,
        }
    }

    async fn exchange_hello(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        send_first: bool,
    ) -> Result<PeerId, HandshakeError> {
        let exchange = async {
            if send_first {
                write_typed(&mut *writer, &self.hello(), &self.frame).await?;
            }
            let theirs: Hello = read_typed(&mut *reader, &self.frame).await?;
            if !send_first {
                write_typed(&mut *writer, &self.hello(), &self.frame).await?;
            }
            Ok::<_, FrameError>(theirs)
        };
        let theirs = tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        if theirs.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::Version(theirs.protocol_version));
        }
        if theirs.service != self.service {
            return Err(HandshakeError::Service(theirs.service));
        }
        let remote = PeerId::new(theirs.peer_id)?;
        if remote == self.local {
            return Err(HandshakeError::SelfConnection);
        }
        Ok(remote)
    }

    /// Agree with `remote` on whether this socket becomes the link. Returns
    /// the generation that owns the reserved slot.
    async fn arbitrate(
        &self,
        remote: &PeerId,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<u64, HandshakeError> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        if self.local < *remote {
            let keep = match lock_links(&self.links).entry(remote.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Link {
                        generation,
                        queue: None,
                    });
                    true
                }
            };
            if let Err(e) = write_typed(&mut *writer, &Verdict { keep }, &self.frame).await {
                if keep {
                    self.release(remote, generation);
                }
                return Err(e.into());
            }
            if !keep {
                tracing::debug!("Declining second socket to {remote}");
                return Err(HandshakeError::AlreadyLinked(remote.clone()));
            }
            return Ok(generation);
        }

        let verdict = tokio::time::timeout(
            self.handshake_timeout,
            read_typed::<Verdict, _>(&mut *reader, &self.frame),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        if !verdict.keep {
            return Err(HandshakeError::AlreadyLinked(remote.clone()));
        }

        // The lower id only grants a slot it does not hold, so a live link
        // still on record here is already dead on the other end.
        let previous = lock_links(&self.links).insert(
            remote.clone(),
            Link {
                generation,
                queue: None,
            },
        );
        if previous.is_some_and(|link| link.queue.is_some()) {
            tracing::debug!("Replacing stale link to {remote}");
            self.emit(TransportEvent::PeerDisconnected(remote.clone()));
        }
        Ok(generation)
    }

    async fn answer_invite(
        &self,
        remote: &PeerId,
        writer: &mut OwnedWriteHalf,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HandshakeError> {
        let (responder, rx) = InviteResponder::new();
        self.emit(TransportEvent::InboundInvite {
            from: remote.clone(),
            responder,
        });
        let accepted = tokio::select! {
            accepted = await_invite_answer(rx, remote, self.invite_timeout) => accepted,
            _ = shutdown.changed() => return Err(HandshakeError::Shutdown),
        };
        write_typed(writer, &Welcome { accepted }, &self.frame).await?;
        if accepted {
            Ok(())
        } else {
            Err(HandshakeError::Declined)
        }
    }

    async fn await_welcome(&self, reader: &mut OwnedReadHalf) -> Result<(), HandshakeError> {
        // The acceptor may legitimately take the whole invite timeout.
        let wait = self.invite_timeout + self.handshake_timeout;
        let welcome: Welcome = tokio::time::timeout(wait, read_typed(reader, &self.frame))
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        if welcome.accepted {
            Ok(())
        } else {
            Err(HandshakeError::Declined)
        }
    }

    /// Accepting end: hello, verdict, invite, answer.
    async fn accept_connection(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), HandshakeError> {
        let (mut reader, mut writer) = stream.into_split();
        let remote = self.exchange_hello(&mut reader, &mut writer, false).await?;
        let generation = self.arbitrate(&remote, &mut reader, &mut writer).await?;

        if let Err(e) = self.answer_invite(&remote, &mut writer, shutdown.clone()).await {
            self.release(&remote, generation);
            return Err(e);
        }
        self.run_link(remote, generation, reader, writer, shutdown).await;
        Ok(())
    }

    /// Dialing end: hello, verdict, wait for the invitation answer. Returns
    /// the peer behind the socket once the link closes.
    async fn dial_connection(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PeerId, HandshakeError> {
        let (mut reader, mut writer) = stream.into_split();
        let remote = self.exchange_hello(&mut reader, &mut writer, true).await?;
        let generation = self.arbitrate(&remote, &mut reader, &mut writer).await?;

        self.emit(TransportEvent::PeerConnecting(remote.clone()));
        if let Err(e) = self.await_welcome(&mut reader).await {
            if self.release(&remote, generation).is_some() {
                self.emit(TransportEvent::PeerDisconnected(remote));
            }
            return Err(e);
        }
        self.run_link(remote.clone(), generation, reader, writer, shutdown)
            .await;
        Ok(remote)
    }

    /// Pump frames in both directions until the socket or the transport closes.
    async fn run_link(
        &self,
        remote: PeerId,
        generation: u64,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        match lock_links(&self.links).get_mut(&remote) {
            Some(link) if link.generation == generation => link.queue = Some(tx),
            _ => {
                tracing::debug!("Socket to {remote} was superseded during its handshake");
                return;
            }
        }
        self.emit(TransportEvent::PeerConnected(remote.clone()));
        tracing::info!("Linked with {remote}");

        let frame = self.frame;
        let writer_peer = remote.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes, &frame).await {
                    tracing::warn!("Write to {writer_peer} failed: {e}");
                    break;
                }
            }
        });

        let stopped = loop {
            tokio::select! {
                result = read_frame(&mut reader, &self.frame) => match result {
                    Ok(bytes) => self.emit(TransportEvent::DataReceived {
                        from: remote.clone(),
                        bytes,
                    }),
                    Err(FrameError::ConnectionClosed) => break false,
                    Err(e) => {
                        tracing::warn!("Read from {remote} failed: {e}");
                        break false;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break true;
                    }
                }
            }
        };

        let owned = self.release(&remote, generation).is_some();
        writer_task.abort();
        if owned && !stopped {
            self.emit(TransportEvent::PeerDisconnected(remote.clone()));
        }
        tracing::info!("Link with {remote} closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<LinkContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Could not set TCP_NODELAY for {addr}: {e}");
                }
                tracing::debug!("Accepted socket from {addr}");
                let ctx = Arc::clone(&ctx);
                let task_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctx.accept_connection(stream, task_shutdown).await {
                        tracing::debug!("Inbound socket from {addr} ended: {e}");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn dial_loop(seed: SocketAddr, ctx: Arc<LinkContext>, mut shutdown: watch::Receiver<bool>) {
    let mut delay = REDIAL_INITIAL;
    // Peer last seen behind `seed`; not redialed while a link to it exists.
    let mut known: Option<PeerId> = None;
    while !*shutdown.borrow() {
        let linked = known.as_ref().is_some_and(|peer| ctx.is_claimed(peer));
        if linked {
            delay = REDIAL_INITIAL;
        } else {
            match tokio::time::timeout(ctx.handshake_timeout, TcpStream::connect(seed)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    match Arc::clone(&ctx).dial_connection(stream, shutdown.clone()).await {
                        Ok(remote) => {
                            delay = REDIAL_INITIAL;
                            known = Some(remote);
                        }
                        Err(HandshakeError::AlreadyLinked(remote)) => known = Some(remote),
                        Err(e) => tracing::debug!("Link via {seed} ended: {e}"),
                    }
                }
                Ok(Err(e)) => tracing::trace!("Dial {seed} failed: {e}"),
                Err(_) => tracing::trace!("Dial {seed} timed out"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        if !linked {
            delay = (delay * 2).min(REDIAL_MAX);
        }
    }
    tracing::debug!("Dialer for {seed} stopped");
}

/// Transport over plain TCP sockets.
pub struct TcpTransport {
    ctx: Arc<LinkContext>,
    listen_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    bound_addr: Option<SocketAddr>,
    advertising: bool,
    browsing: bool,
    stopped: bool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpTransport {
    /// Create a transport for `peer`. Nothing is bound or dialed until
    /// [`Transport::advertise`] or [`Transport::browse`] is called.
    pub fn new(peer: PeerId, config: TcpConfig) -> (Self, EventReceiver) {
        let (events, rx) = event_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(LinkContext {
            local: peer,
            service: config.service,
            frame: config.frame,
            invite_timeout: config.invite_timeout,
            handshake_timeout: config.handshake_timeout,
            events,
            links: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        });
        let transport = Self {
            ctx,
            listen_addr: config.listen_addr,
            seeds: config.seeds,
            bound_addr: None,
            advertising: false,
            browsing: false,
            stopped: false,
            shutdown_tx,
            shutdown_rx,
        };
        (transport, rx)
    }

    /// Address the listener is bound to, once advertising.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Peers with a live link.
    pub fn linked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock_links(&self.ctx.links)
            .iter()
            .filter(|(_, link)| link.queue.is_some())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

impl Transport for TcpTransport {
    fn local_peer(&self) -> &PeerId {
        &self.ctx.local
    }

    fn advertise(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        if self.advertising {
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(self.listen_addr)
            .map_err(|e| TransportError::Advertise(format!("{}: {e}", self.listen_addr)))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let addr = listener.local_addr()?;

        tracing::info!("Advertising '{}' on {addr}", self.ctx.service);
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.ctx),
            self.shutdown_rx.clone(),
        ));
        self.bound_addr = Some(addr);
        self.advertising = true;
        Ok(())
    }

    fn browse(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        if self.browsing {
            return Ok(());
        }
        if self.seeds.is_empty() {
            tracing::warn!("Browsing with no seed addresses configured");
        }
        for &seed in &self.seeds {
            tokio::spawn(dial_loop(
                seed,
                Arc::clone(&self.ctx),
                self.shutdown_rx.clone(),
            ));
        }
        tracing::info!("Browsing {} seed(s)", self.seeds.len());
        self.browsing = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.advertising = false;
        self.browsing = false;
        let _ = self.shutdown_tx.send(true);
        lock_links(&self.ctx.links).clear();
        tracing::info!("TCP transport stopped");
    }

    fn send(&mut self, bytes: &[u8], to: &[PeerId]) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        let links = lock_links(&self.ctx.links);
        for peer in to {
            match links.get(peer).and_then(|link| link.queue.as_ref()) {
                Some(queue) => {
                    if queue.send(bytes.to_vec()).is_err() {
                        tracing::debug!("Writer for {peer} already closed");
                    }
                }
                None => tracing::trace!("No link to {peer}, skipping"),
            }
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
