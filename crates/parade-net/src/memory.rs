//! In-process transport.
//!
//! [`MemoryNetwork`] is a hub that stands in for a radio neighbourhood: every
//! [`MemoryTransport`] joins it under a service namespace, browsers discover
//! advertisers of the same namespace and invite them, and accepted
//! invitations link both sides. Each link delivers in send order because each
//! receiver drains one unbounded FIFO channel.
//!
//! Operations that start an invitation spawn a Tokio task, so they must be
//! called from within a runtime.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::peer::PeerId;
use crate::transport::{
    DEFAULT_INVITE_TIMEOUT, EventReceiver, EventSender, InviteResponder, Transport,
    TransportError, TransportEvent, await_invite_answer, event_channel,
};

struct Node {
    service: String,
    advertising: bool,
    browsing: bool,
    stopped: bool,
    events: EventSender,
    links: BTreeSet<PeerId>,
}

impl Node {
    fn emit(&self, event: TransportEvent) {
        // A closed receiver means the owning session is gone.
        let _ = self.events.send(event);
    }
}

struct PendingInvite {
    browser: PeerId,
    advertiser: PeerId,
    task: AbortHandle,
}

impl PendingInvite {
    fn involves(&self, peer: &PeerId) -> bool {
        &self.browser == peer || &self.advertiser == peer
    }

    fn pairs(&self, a: &PeerId, b: &PeerId) -> bool {
        self.involves(a) && self.involves(b)
    }
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, Node>,
    pending: Vec<PendingInvite>,
}

type SharedHub = Arc<Mutex<Hub>>;

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Hub {
    fn linked_or_pending(&self, a: &PeerId, b: &PeerId) -> bool {
        self.nodes.get(a).is_some_and(|n| n.links.contains(b))
            || self.pending.iter().any(|p| p.pairs(a, b))
    }

    /// Peers in `service` (other than `me`) that `filter` selects and that
    /// are not already linked to `me` or mid-invitation with it.
    fn candidates(&self, me: &PeerId, filter: impl Fn(&Node) -> bool) -> Vec<PeerId> {
        let Some(service) = self.nodes.get(me).map(|n| n.service.clone()) else {
            return Vec::new();
        };
        let mut found: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(id, node)| {
                *id != me && !node.stopped && node.service == service && filter(*node)
            })
            .map(|(id, _)| id.clone())
            .filter(|id| !self.linked_or_pending(me, id))
            .collect();
        found.sort();
        found
    }

    fn unlink(&mut self, a: &PeerId, b: &PeerId) -> bool {
        let removed = self.nodes.get_mut(a).is_some_and(|n| n.links.remove(b));
        if let Some(node) = self.nodes.get_mut(b) {
            node.links.remove(a);
        }
        removed
    }
}

/// Shared in-process network.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: SharedHub,
    invite_timeout: Duration,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// A network using [`DEFAULT_INVITE_TIMEOUT`].
    pub fn new() -> Self {
        Self::with_invite_timeout(DEFAULT_INVITE_TIMEOUT)
    }

    /// A network whose invitations expire after `invite_timeout`.
    pub fn with_invite_timeout(invite_timeout: Duration) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            invite_timeout,
        }
    }

    /// Attach a transport for `peer` in the `service` namespace.
    pub fn join(
        &self,
        peer: PeerId,
        service: &str,
    ) -> Result<(MemoryTransport, EventReceiver), TransportError> {
        let mut hub = lock(&self.hub);
        if hub.nodes.contains_key(&peer) {
            return Err(TransportError::DuplicatePeer(peer));
        }

        let (events, rx) = event_channel();
        hub.nodes.insert(
            peer.clone(),
            Node {
                service: service.to_string(),
                advertising: false,
                browsing: false,
                stopped: false,
                events,
                links: BTreeSet::new(),
            },
        );
        tracing::debug!("{peer} joined memory network in namespace '{service}'");

        let transport = MemoryTransport {
            peer,
            hub: Arc::clone(&self.hub),
            invite_timeout: self.invite_timeout,
        };
        Ok((transport, rx))
    }

    /// Drop the link between `a` and `b`, notifying both ends.
    pub fn sever(&self, a: &PeerId, b: &PeerId) -> bool {
        let mut hub = lock(&self.hub);
        if !hub.unlink(a, b) {
            return false;
        }
        if let Some(node) = hub.nodes.get(a) {
            node.emit(TransportEvent::PeerDisconnected(b.clone()));
        }
        if let Some(node) = hub.nodes.get(b) {
            node.emit(TransportEvent::PeerDisconnected(a.clone()));
        }
        tracing::debug!("Severed link {a} <-> {b}");
        true
    }

    /// Peers currently linked to `peer`.
    pub fn links(&self, peer: &PeerId) -> Vec<PeerId> {
        lock(&self.hub)
            .nodes
            .get(peer)
            .map(|n| n.links.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One participant's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    peer: PeerId,
    hub: SharedHub,
    invite_timeout: Duration,
}

impl MemoryTransport {
    fn invite(&self, hub: &mut Hub, browser: PeerId, advertiser: PeerId) {
        let (responder, rx) = InviteResponder::new();
        let Some(advertiser_node) = hub.nodes.get(&advertiser) else {
            return;
        };
        advertiser_node.emit(TransportEvent::InboundInvite {
            from: browser.clone(),
            responder,
        });
        if let Some(browser_node) = hub.nodes.get(&browser) {
            browser_node.emit(TransportEvent::PeerConnecting(advertiser.clone()));
        }

        let shared = Arc::clone(&self.hub);
        let timeout = self.invite_timeout;
        let (b, a) = (browser.clone(), advertiser.clone());
        let task = tokio::spawn(async move {
            let accepted = await_invite_answer(rx, &b, timeout).await;
            complete_invite(&shared, &b, &a, accepted);
        });

        hub.pending.push(PendingInvite {
            browser,
            advertiser,
            task: task.abort_handle(),
        });
    }

    fn ensure_active(&self, hub: &Hub) -> Result<(), TransportError> {
        match hub.nodes.get(&self.peer) {
            Some(node) if !node.stopped => Ok(()),
            _ => Err(TransportError::Stopped),
        }
    }
}

fn complete_invite(hub: &Mutex<Hub>, browser: &PeerId, advertiser: &PeerId, accepted: bool) {
    let mut hub = lock(hub);
    hub.pending
        .retain(|p| !(&p.browser == browser && &p.advertiser == advertiser));

    let both_live = [browser, advertiser]
        .iter()
        .all(|id| hub.nodes.get(*id).is_some_and(|n| !n.stopped));

    if accepted && both_live {
        for (me, other) in [(browser, advertiser), (advertiser, browser)] {
            if let Some(node) = hub.nodes.get_mut(me) {
                node.links.insert(other.clone());
                node.emit(TransportEvent::PeerConnected(other.clone()));
            }
        }
        tracing::debug!("Linked {browser} <-> {advertiser}");
    } else if let Some(node) = hub.nodes.get(browser) {
        node.emit(TransportEvent::PeerDisconnected(advertiser.clone()));
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn advertise(&mut self) -> Result<(), TransportError> {
        let mut hub = lock(&self.hub);
        self.ensure_active(&hub)?;
        if let Some(node) = hub.nodes.get_mut(&self.peer) {
            node.advertising = true;
        }
        for browser in hub.candidates(&self.peer, |n| n.browsing) {
            self.invite(&mut hub, browser, self.peer.clone());
        }
        Ok(())
    }

    fn browse(&mut self) -> Result<(), TransportError> {
        let mut hub = lock(&self.hub);
        self.ensure_active(&hub)?;
        if let Some(node) = hub.nodes.get_mut(&self.peer) {
            node.browsing = true;
        }
        for advertiser in hub.candidates(&self.peer, |n| n.advertising) {
            self.invite(&mut hub, self.peer.clone(), advertiser);
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut hub = lock(&self.hub);
        let me = self.peer.clone();

        let (ours, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut hub.pending).into_iter().partition(|p| p.involves(&me));
        hub.pending = rest;
        for invite in ours {
            invite.task.abort();
            if invite.browser != me
                && let Some(node) = hub.nodes.get(&invite.browser)
            {
                node.emit(TransportEvent::PeerDisconnected(me.clone()));
            }
        }

        let links = match hub.nodes.get_mut(&me) {
            Some(node) => {
                node.stopped = true;
                node.advertising = false;
                node.browsing = false;
                std::mem::take(&mut node.links)
            }
            None => return,
        };
        for other in links {
            if let Some(node) = hub.nodes.get_mut(&other) {
                node.links.remove(&me);
                node.emit(TransportEvent::PeerDisconnected(me.clone()));
            }
        }
        tracing::debug!("{me} stopped");
    }

    fn send(&mut self, bytes: &[u8], to: &[PeerId]) -> Result<(), TransportError> {
        let hub = lock(&self.hub);
        self.ensure_active(&hub)?;
        let Some(node) = hub.nodes.get(&self.peer) else {
            return Err(TransportError::Stopped);
        };
        for target in to {
            if !node.links.contains(target) {
                tracing::trace!("{} not linked to {target}, skipping", self.peer);
                continue;
            }
            if let Some(other) = hub.nodes.get(target) {
                other.emit(TransportEvent::DataReceived {
                    from: self.peer.clone(),
                    bytes: bytes.to_vec(),
                });
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
        lock(&self.hub).nodes.remove(&self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    async fn answer_next_invite(rx: &mut EventReceiver, accept: bool) -> PeerId {
        match rx.recv().await {
            Some(TransportEvent::InboundInvite { from, responder }) => {
                responder.respond(accept);
                from
            }
            other => panic!("expected invite, got {other:?}"),
        }
    }

    async fn linked_pair(
        net: &MemoryNetwork,
    ) -> (MemoryTransport, EventReceiver, MemoryTransport, EventReceiver) {
        let (mut host, mut host_rx) = net.join(peer("Host"), "parade").unwrap();
        let (mut guest, mut guest_rx) = net.join(peer("Guest"), "parade").unwrap();
        host.advertise().unwrap();
        guest.browse().unwrap();

        assert_eq!(answer_next_invite(&mut host_rx, true).await, peer("Guest"));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnecting(p)) if p == peer("Host")));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnected(p)) if p == peer("Host")));
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::PeerConnected(p)) if p == peer("Guest")));
        (host, host_rx, guest, guest_rx)
    }

    #[tokio::test]
    async fn test_browser_discovers_advertiser_and_links() {
        let net = MemoryNetwork::new();
        let (_host, _hrx, _guest, _grx) = linked_pair(&net).await;
        assert_eq!(net.links(&peer("Host")), vec![peer("Guest")]);
        assert_eq!(net.links(&peer("Guest")), vec![peer("Host")]);
    }

    #[tokio::test]
    async fn test_advertiser_discovered_by_earlier_browser() {
        let net = MemoryNetwork::new();
        let (mut guest, mut guest_rx) = net.join(peer("Guest"), "parade").unwrap();
        let (mut host, mut host_rx) = net.join(peer("Host"), "parade").unwrap();
        guest.browse().unwrap();
        host.advertise().unwrap();

        answer_next_invite(&mut host_rx, true).await;
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnecting(_))));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnected(_))));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let net = MemoryNetwork::new();
        let (mut host, mut host_rx) = net.join(peer("Host"), "parade").unwrap();
        let (mut other, mut other_rx) = net.join(peer("Other"), "museum").unwrap();
        host.advertise().unwrap();
        other.browse().unwrap();

        tokio::task::yield_now().await;
        assert!(host_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
        assert!(net.links(&peer("Host")).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let net = MemoryNetwork::new();
        let _first = net.join(peer("Host"), "parade").unwrap();
        assert!(matches!(
            net.join(peer("Host"), "parade"),
            Err(TransportError::DuplicatePeer(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_invite_leaves_peers_apart() {
        let net = MemoryNetwork::new();
        let (mut host, mut host_rx) = net.join(peer("Host"), "parade").unwrap();
        let (mut guest, mut guest_rx) = net.join(peer("Guest"), "parade").unwrap();
        host.advertise().unwrap();
        guest.browse().unwrap();

        answer_next_invite(&mut host_rx, false).await;
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnecting(_))));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerDisconnected(p)) if p == peer("Host")));
        assert!(net.links(&peer("Host")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_invite_expires() {
        let net = MemoryNetwork::with_invite_timeout(Duration::from_secs(10));
        let (mut host, mut host_rx) = net.join(peer("Host"), "parade").unwrap();
        let (mut guest, mut guest_rx) = net.join(peer("Guest"), "parade").unwrap();
        host.advertise().unwrap();
        guest.browse().unwrap();

        // Hold the responder without answering.
        let _held = host_rx.recv().await;
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerConnecting(_))));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerDisconnected(_))));
        assert!(net.links(&peer("Guest")).is_empty());
    }

    #[tokio::test]
    async fn test_send_preserves_order_per_link() {
        let net = MemoryNetwork::new();
        let (mut host, _hrx, _guest, mut guest_rx) = linked_pair(&net).await;

        for i in 0u8..5 {
            host.send(&[i], &[peer("Guest")]).unwrap();
        }
        for i in 0u8..5 {
            match guest_rx.recv().await {
                Some(TransportEvent::DataReceived { from, bytes }) => {
                    assert_eq!(from, peer("Host"));
                    assert_eq!(bytes, vec![i]);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_unlinked_peer_is_skipped() {
        let net = MemoryNetwork::new();
        let (mut lone, _rx) = net.join(peer("Lone"), "parade").unwrap();
        assert!(lone.send(b"x", &[peer("Nobody")]).is_ok());
    }

    #[tokio::test]
    async fn test_stop_disconnects_other_side() {
        let net = MemoryNetwork::new();
        let (mut host, _hrx, _guest, mut guest_rx) = linked_pair(&net).await;

        host.stop();
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerDisconnected(p)) if p == peer("Host")));
        assert!(matches!(host.send(b"x", &[peer("Guest")]), Err(TransportError::Stopped)));
        assert!(matches!(host.advertise(), Err(TransportError::Stopped)));
    }

    #[tokio::test]
    async fn test_sever_notifies_both_ends() {
        let net = MemoryNetwork::new();
        let (_host, mut host_rx, _guest, mut guest_rx) = linked_pair(&net).await;

        assert!(net.sever(&peer("Host"), &peer("Guest")));
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::PeerDisconnected(_))));
        assert!(matches!(guest_rx.recv().await, Some(TransportEvent::PeerDisconnected(_))));
        assert!(!net.sever(&peer("Host"), &peer("Guest")));
    }

    #[tokio::test]
    async fn test_dropping_transport_frees_peer_id() {
        let net = MemoryNetwork::new();
        let (first, _rx) = net.join(peer("Host"), "parade").unwrap();
        drop(first);
        assert!(net.join(peer("Host"), "parade").is_ok());
    }
}
