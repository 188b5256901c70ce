//! End-to-end session scenarios over the in-process and TCP transports.

use std::time::Duration;

use glam::Vec3;
use parade_net::{DEFAULT_SERVICE_TYPE, MemoryNetwork, TcpConfig, TcpTransport};
use tokio::task::JoinHandle;

use super::*;
use crate::controller::AllowList;
use crate::stage::ParadePhase;

struct Participant {
    handle: SessionHandle,
    notes: NotificationReceiver,
    task: JoinHandle<()>,
}

fn peer(name: &str) -> PeerId {
    PeerId::new(name).unwrap()
}

fn spawn_with<T: Transport + 'static>(
    controller: SessionController<T>,
    events: parade_net::EventReceiver,
) -> Participant {
    let (runtime, handle, notes) = SessionRuntime::new(controller, events, ChatConfig::default());
    let task = tokio::spawn(runtime.run());
    Participant {
        handle,
        notes,
        task,
    }
}

fn join(net: &MemoryNetwork, name: &str) -> Participant {
    let (transport, events) = net.join(peer(name), DEFAULT_SERVICE_TYPE).unwrap();
    spawn_with(SessionController::new(transport), events)
}

/// Wait for the first notification `pick` accepts, skipping others.
async fn expect<R>(
    p: &mut Participant,
    mut pick: impl FnMut(&Notification) -> Option<R>,
) -> R {
    let wait = async {
        loop {
            let note = p.notes.recv().await.expect("runtime alive");
            if let Some(found) = pick(&note) {
                return found;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("notification within timeout")
}

async fn expect_joined(p: &mut Participant, who: &str) {
    let who = peer(who);
    expect(p, |n| matches!(n, Notification::PeerJoined(id) if *id == who).then_some(())).await;
}

async fn expect_chat(p: &mut Participant, text: &str) -> PeerId {
    expect(p, |n| match n {
        Notification::ChatReceived { sender, text: t } if t == text => Some(sender.clone()),
        _ => None,
    })
    .await
}

fn loopback(seeds: Vec<std::net::SocketAddr>) -> TcpConfig {
    TcpConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        seeds,
        ..TcpConfig::default()
    }
}

/// Host `x` and browser `y`, linked.
async fn linked_pair(net: &MemoryNetwork) -> (Participant, Participant) {
    let mut x = join(net, "X");
    let mut y = join(net, "Y");
    x.handle.start_hosting().unwrap();
    y.handle.start_browsing().unwrap();
    expect_joined(&mut x, "Y").await;
    expect_joined(&mut y, "X").await;
    (x, y)
}

#[tokio::test]
async fn test_chat_reaches_peer_once() {
    let net = MemoryNetwork::new();
    let (x, mut y) = linked_pair(&net).await;

    x.handle.send_chat("hi").unwrap();
    assert_eq!(expect_chat(&mut y, "hi").await, peer("X"));

    let log = y.handle.chat_log().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].sender, peer("X"));
    assert_eq!(log[0].text, "hi");

    // Outgoing chat is not echoed locally.
    assert!(x.handle.chat_log().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_move_does_not_override_create() {
    let net = MemoryNetwork::new();
    let (x, mut y) = linked_pair(&net).await;

    x.handle
        .broadcast(EntityUpdatePayload {
            entity_id: "tank1".into(),
            action: EntityAction::Created,
            transform: Transform::from_position(Vec3::ZERO),
            timestamp: 10,
        })
        .unwrap();
    x.handle
        .broadcast(EntityUpdatePayload {
            entity_id: "tank1".into(),
            action: EntityAction::Moved,
            transform: Transform::from_position(Vec3::splat(5.0)),
            timestamp: 5,
        })
        .unwrap();
    // Per-link ordering: once this arrives both updates were processed.
    x.handle.send_chat("barrier").unwrap();
    expect_chat(&mut y, "barrier").await;

    let state = y.handle.entity("tank1").await.unwrap().unwrap();
    assert_eq!(state.transform.position, Vec3::ZERO);
    assert_eq!(state.timestamp, 10);
}

#[tokio::test]
async fn test_broadcast_while_idle_reaches_nobody() {
    let net = MemoryNetwork::new();
    let x = join(&net, "X");
    let mut y = join(&net, "Y");

    x.handle.send_chat("hello?").unwrap();
    assert!(x.handle.peers().await.unwrap().is_empty());

    let nothing = tokio::time::timeout(Duration::from_millis(200), y.notes.recv()).await;
    assert!(nothing.is_err());
    assert!(y.handle.chat_log().await.unwrap().is_empty());
    assert_eq!(x.handle.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_entity_lifecycle_notifications() {
    let net = MemoryNetwork::new();
    let (x, mut y) = linked_pair(&net).await;

    x.handle
        .broadcast_entity_update("jet-3", EntityAction::Created, Transform::default())
        .unwrap();
    let applied = expect(&mut y, |n| match n {
        Notification::EntityApplied { entity_id, .. } => Some(entity_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(applied, "jet-3");

    x.handle
        .broadcast_entity_update("jet-3", EntityAction::Selected, Transform::default())
        .unwrap();
    let by = expect(&mut y, |n| match n {
        Notification::EntitySelected { by, .. } => Some(by.clone()),
        _ => None,
    })
    .await;
    assert_eq!(by, peer("X"));

    tokio::time::sleep(Duration::from_millis(2)).await;
    x.handle
        .broadcast_entity_update("jet-3", EntityAction::Deleted, Transform::default())
        .unwrap();
    expect(&mut y, |n| {
        matches!(n, Notification::EntityRemoved { entity_id } if entity_id == "jet-3").then_some(())
    })
    .await;
    assert!(y.handle.entity("jet-3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stage_commands_propagate() {
    let net = MemoryNetwork::new();
    let (x, mut y) = linked_pair(&net).await;

    x.handle.change_perspective(CameraPerspective::Aerial).unwrap();
    let perspective = expect(&mut y, |n| match n {
        Notification::PerspectiveRequested { perspective, .. } => Some(*perspective),
        _ => None,
    })
    .await;
    assert_eq!(perspective, CameraPerspective::Aerial);

    x.handle.send_parade_control(ParadeAction::Start).unwrap();
    let phase = expect(&mut y, |n| match n {
        Notification::ParadeControlRequested { phase, .. } => Some(*phase),
        _ => None,
    })
    .await;
    assert_eq!(phase, ParadePhase::MarchingBegins);

    let (seen, parade) = y.handle.stage().await.unwrap();
    assert_eq!(seen, Some(CameraPerspective::Aerial));
    assert!(parade.playing);
}

#[tokio::test]
async fn test_three_peers_all_receive() {
    let net = MemoryNetwork::new();
    let mut host = join(&net, "Host");
    let mut a = join(&net, "A");
    let mut b = join(&net, "B");
    host.handle.start_hosting().unwrap();
    a.handle.start_browsing().unwrap();
    b.handle.start_browsing().unwrap();
    expect_joined(&mut a, "Host").await;
    expect_joined(&mut b, "Host").await;
    let mut joined = Vec::new();
    while joined.len() < 2 {
        joined.push(expect(&mut host, |n| match n {
            Notification::PeerJoined(p) => Some(p.clone()),
            _ => None,
        })
        .await);
    }
    joined.sort();
    assert_eq!(joined, vec![peer("A"), peer("B")]);

    host.handle.send_chat("all hands").unwrap();
    assert_eq!(expect_chat(&mut a, "all hands").await, peer("Host"));
    assert_eq!(expect_chat(&mut b, "all hands").await, peer("Host"));
}

#[tokio::test]
async fn test_rejected_invite_keeps_peers_apart() {
    let net = MemoryNetwork::new();
    let (transport, events) = net.join(peer("X"), DEFAULT_SERVICE_TYPE).unwrap();
    let x = spawn_with(
        SessionController::with_policy(transport, AllowList::new([peer("Friend")])),
        events,
    );
    let y = join(&net, "Y");

    x.handle.start_hosting().unwrap();
    y.handle.start_browsing().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(x.handle.peers().await.unwrap().is_empty());
    assert!(y.handle.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let net = MemoryNetwork::new();
    let x = join(&net, "X");
    let (transport, events) = net.join(peer("Y"), "museum-tour").unwrap();
    let y = spawn_with(SessionController::new(transport), events);

    x.handle.start_hosting().unwrap();
    y.handle.start_browsing().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(x.handle.peers().await.unwrap().is_empty());
    assert_eq!(y.handle.state(), SessionState::Browsing);
}

#[tokio::test]
async fn test_link_drop_reports_peer_left() {
    let net = MemoryNetwork::new();
    let (mut x, mut y) = linked_pair(&net).await;

    assert!(net.sever(&peer("X"), &peer("Y")));
    expect(&mut x, |n| matches!(n, Notification::PeerLeft(p) if *p == peer("Y")).then_some(()))
        .await;
    expect(&mut y, |n| matches!(n, Notification::PeerLeft(p) if *p == peer("X")).then_some(()))
        .await;
    assert_eq!(x.handle.state(), SessionState::Advertising);
}

#[tokio::test]
async fn test_stop_notifies_both_sides() {
    let net = MemoryNetwork::new();
    let (mut x, mut y) = linked_pair(&net).await;

    x.handle.stop().unwrap();
    expect(&mut x, |n| matches!(n, Notification::PeerLeft(p) if *p == peer("Y")).then_some(()))
        .await;
    expect(&mut y, |n| matches!(n, Notification::PeerLeft(p) if *p == peer("X")).then_some(()))
        .await;

    let mut states = x.handle.state_changes();
    states
        .wait_for(|s| *s == SessionState::Stopped)
        .await
        .unwrap();

    // Stopped is terminal; later commands are refused without a transport error.
    x.handle.start_hosting().unwrap();
    assert!(x.handle.peers().await.unwrap().is_empty());
    assert_eq!(x.handle.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_shutdown_ends_runtime() {
    let net = MemoryNetwork::new();
    let x = join(&net, "X");
    x.handle.shutdown().unwrap();
    tokio::time::timeout(Duration::from_secs(5), x.task)
        .await
        .expect("runtime exits")
        .unwrap();
    assert!(matches!(x.handle.peers().await, Err(SessionError::Closed)));
}

#[tokio::test]
async fn test_invalid_chat_is_refused_locally() {
    let net = MemoryNetwork::new();
    let x = join(&net, "X");
    assert!(matches!(
        x.handle.send_chat("   "),
        Err(SessionError::Chat(crate::chat::ChatRejection::Empty))
    ));
    assert!(matches!(
        x.handle.send_chat(&"y".repeat(600)),
        Err(SessionError::Chat(crate::chat::ChatRejection::TooLong { .. }))
    ));
}

#[tokio::test]
async fn test_local_edits_after_stop_are_dropped() {
    let net = MemoryNetwork::new();
    let x = join(&net, "X");
    x.handle
        .broadcast_entity_update("tank1", EntityAction::Created, Transform::default())
        .unwrap();
    assert!(x.handle.entity("tank1").await.unwrap().is_some());

    x.handle.stop().unwrap();
    x.handle
        .broadcast_entity_update("tank2", EntityAction::Created, Transform::default())
        .unwrap();
    x.handle
        .broadcast_entity_update("tank1", EntityAction::Moved, Transform::from_position(Vec3::X))
        .unwrap();
    x.handle.change_perspective(CameraPerspective::Aerial).unwrap();

    assert!(x.handle.entity("tank2").await.unwrap().is_none());
    let tank1 = x.handle.entity("tank1").await.unwrap().unwrap();
    assert_eq!(tank1.transform.position, Vec3::ZERO);
    let (perspective, _) = x.handle.stage().await.unwrap();
    assert_eq!(perspective, None);
}

#[tokio::test]
async fn test_chat_over_tcp() {
    let (transport, events) = TcpTransport::new(peer("Host"), loopback(Vec::new()));
    let mut controller = SessionController::new(transport);
    controller.start_hosting().unwrap();
    let addr = controller.transport().local_addr().unwrap();
    let mut host = spawn_with(controller, events);

    let (transport, events) = TcpTransport::new(peer("Guest"), loopback(vec![addr]));
    let mut guest = spawn_with(SessionController::new(transport), events);
    guest.handle.start_browsing().unwrap();

    expect_joined(&mut host, "Guest").await;
    expect_joined(&mut guest, "Host").await;

    guest.handle.send_chat("request permission to pass").unwrap();
    let sender = expect_chat(&mut host, "request permission to pass").await;
    assert_eq!(sender, peer("Guest"));
    host.handle.send_chat("granted").unwrap();
    assert_eq!(expect_chat(&mut guest, "granted").await, peer("Host"));

    let log = host.handle.chat_log().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "request permission to pass");
    assert_eq!(host.handle.peers().await.unwrap(), vec![peer("Guest")]);
}

#[tokio::test]
async fn test_advertise_on_taken_port_reports_transport_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = TcpConfig {
        listen_addr: taken.local_addr().unwrap(),
        ..loopback(Vec::new())
    };
    let (transport, events) = TcpTransport::new(peer("Host"), config);
    let mut host = spawn_with(SessionController::new(transport), events);

    host.handle.start_hosting().unwrap();
    let reason = expect(&mut host, |n| match n {
        Notification::TransportError { operation, reason } if *operation == "advertise" => {
            Some(reason.clone())
        }
        _ => None,
    })
    .await;
    assert!(!reason.is_empty());
    assert_eq!(host.handle.state(), SessionState::Idle);
}
