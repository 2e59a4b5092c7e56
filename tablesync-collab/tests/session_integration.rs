//! End-to-end session tests over the in-process transport.
//!
//! Peers share one `MemoryNetwork`; `pump` handles queued events on every
//! controller until the whole room is quiet.

use std::sync::Arc;

use tablesync_collab::protocol::{Action, FullSync};
use tablesync_collab::{
    ConnectionState, MemoryNetwork, MemorySessionStore, PeerRole, SessionConfig, SessionController,
    SessionEvent, SessionStore, TransportEvent,
};
use tablesync_core::{
    CombatState, Combatant, ElementKind, ElementPatch, FogState, GridSettings, Player, Point,
    Role, SessionDocument,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

type Peer = SessionController<MemoryNetwork>;

fn peer(network: &MemoryNetwork) -> Peer {
    SessionController::new(network.clone(), SessionConfig::for_testing())
}

/// Handle queued transport events until no peer has anything left.
fn pump(peers: &mut [&mut Peer]) {
    for _ in 0..64 {
        let handled: usize = peers.iter_mut().map(|p| p.process_pending()).sum();
        if handled == 0 {
            return;
        }
    }
    panic!("room never went quiet");
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn token(id: &str, x: f64, y: f64) -> ElementPatch {
    ElementPatch {
        kind: Some(ElementKind::Token),
        width: Some(50.0),
        height: Some(50.0),
        label: Some("Goblin".into()),
        color: Some("#4caf50".into()),
        ..ElementPatch::position(id, x, y)
    }
}

/// Host in room `r1` plus one synced follower.
async fn room(network: &MemoryNetwork) -> (Peer, Peer) {
    let mut host = peer(network);
    host.create_room("r1").await.unwrap();
    let mut follower = peer(network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);
    (host, follower)
}

#[tokio::test]
async fn test_follower_receives_full_sync_on_join() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 0.0, 0.0));
    host.set_grid(GridSettings {
        size: 70.0,
        ..GridSettings::default()
    });

    let mut follower = peer(&network);
    let mut events = follower.subscribe();
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    assert_eq!(follower.connection_state(), &ConnectionState::Connecting);
    pump(&mut [&mut host, &mut follower]);

    assert_eq!(follower.connection_state(), &ConnectionState::Connected);
    assert_eq!(follower.role(), Some(PeerRole::Follower));
    assert_eq!(follower.document().element("t1"), host.document().element("t1"));
    assert_eq!(follower.document().grid.size, 70.0);
    assert_eq!(follower.host_peer(), host.local_peer_id());
    assert!(drain(&mut events).contains(&SessionEvent::DocumentReplaced));

    // Roster holds both peers on both sides
    let follower_id = follower.local_peer_id().unwrap().to_string();
    let host_id = host.local_peer_id().unwrap().to_string();
    assert_eq!(host.document().players[&follower_id].name, "Ann");
    assert_eq!(follower.document().players[&host_id].role, Role::Host);
    assert_eq!(follower.document().players[&follower_id].role, Role::Player);
}

#[tokio::test]
async fn test_move_preserves_other_fields() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 0.0, 0.0));
    let mut follower = peer(&network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);

    assert!(follower.move_element("t1", 5.0, 5.0));
    pump(&mut [&mut host, &mut follower]);

    let moved = host.document().element("t1").unwrap();
    assert_eq!((moved.x, moved.y), (5.0, 5.0));
    assert_eq!(moved.label, "Goblin");
    assert_eq!(moved.color, "#4caf50");
    assert_eq!(moved.width, 50.0);
    assert_eq!(host.document().element("t1"), follower.document().element("t1"));
}

#[tokio::test]
async fn test_element_created_and_deleted_remotely() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    follower.upsert_element(token("door", 10.0, 20.0));
    pump(&mut [&mut host, &mut follower]);
    assert!(host.document().element("door").is_some());

    assert!(host.delete_element("door"));
    pump(&mut [&mut host, &mut follower]);
    assert!(follower.document().element("door").is_none());
    assert!(!follower.delete_element("door"));
}

#[tokio::test]
async fn test_fog_replaced_wholesale() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    follower.reveal_fog(vec![Point::new(0.0, 0.0), Point::new(5.0, 0.0), Point::new(0.0, 5.0)]);
    pump(&mut [&mut host, &mut follower]);

    let fog = FogState {
        enabled: true,
        revealed: vec![vec![Point::new(100.0, 100.0), Point::new(200.0, 100.0), Point::new(200.0, 200.0)]],
    };
    host.set_fog(fog.clone());
    pump(&mut [&mut host, &mut follower]);

    assert_eq!(follower.document().fog, fog);
}

#[tokio::test]
async fn test_combat_dice_and_chat_propagate() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    host.set_combat(Some(CombatState::start(vec![
        Combatant {
            id: "c1".into(),
            name: "Goblin".into(),
            initiative: 12,
            ..Combatant::default()
        },
        Combatant {
            id: "c2".into(),
            name: "Ann".into(),
            initiative: 17,
            ..Combatant::default()
        },
    ])));
    assert!(host.advance_turn());
    let roll = follower.roll_dice("1d20", vec![14]);
    let message = follower.send_chat("I attack!");
    pump(&mut [&mut host, &mut follower]);

    let combat = follower.document().combat.as_ref().unwrap();
    assert_eq!(combat.current().unwrap().name, "Goblin");
    assert_eq!(host.document().dice_log, vec![roll.clone()]);
    assert_eq!(host.document().chat_log, vec![message]);
    assert_eq!(roll.player_name, "Ann");

    host.set_combat(None);
    pump(&mut [&mut host, &mut follower]);
    assert!(follower.document().combat.is_none());
}

#[tokio::test]
async fn test_digests_match_after_sync() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 1.0, 1.0));
    let mut follower = peer(&network);
    let mut events = follower.subscribe();
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);

    assert_eq!(host.store().digest(), follower.store().digest());
    assert!(host.broadcast_digest());
    pump(&mut [&mut host, &mut follower]);

    assert!(!follower.is_desynced());
    assert!(!drain(&mut events).iter().any(|e| matches!(e, SessionEvent::DesyncChanged(true))));
}

#[tokio::test]
async fn test_local_undo_is_flagged_then_repaired() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 0.0, 0.0));
    let mut follower = peer(&network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);
    let mut events = follower.subscribe();

    follower.move_element("t1", 5.0, 5.0);
    pump(&mut [&mut host, &mut follower]);
    // Undo stays local, so the follower now disagrees with the host
    assert!(follower.undo().is_some());
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(host.document().element("t1").unwrap().x, 5.0);
    assert_eq!(follower.document().element("t1").unwrap().x, 0.0);

    host.broadcast_digest();
    pump(&mut [&mut host, &mut follower]);
    assert!(follower.is_desynced());
    assert!(drain(&mut events).contains(&SessionEvent::DesyncChanged(true)));

    assert!(follower.request_sync());
    pump(&mut [&mut host, &mut follower]);
    assert!(!follower.is_desynced());
    assert_eq!(follower.document().element("t1").unwrap().x, 5.0);
    assert_eq!(follower.history().undo_len(), 0);
    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::DocumentReplaced));
    assert!(events.contains(&SessionEvent::DesyncChanged(false)));
}

#[tokio::test]
async fn test_rebroadcast_shares_undo() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    host.upsert_element(token("t1", 0.0, 0.0));
    host.move_element("t1", 8.0, 8.0);
    pump(&mut [&mut host, &mut follower]);

    let undone = host.undo().unwrap();
    assert!(host.rebroadcast(&undone));
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(follower.document().element("t1").unwrap().x, 0.0);

    // Undoing the create rebroadcasts as a delete
    let undone = host.undo().unwrap();
    host.rebroadcast(&undone);
    pump(&mut [&mut host, &mut follower]);
    assert!(follower.document().element("t1").is_none());
    assert_eq!(host.store().digest(), follower.store().digest());
}

#[tokio::test]
async fn test_remote_changes_not_recorded_and_invalidate() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    host.upsert_element(token("t1", 0.0, 0.0));
    host.set_fog(FogState { enabled: true, revealed: Vec::new() });
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(follower.history().undo_len(), 0);

    follower.move_element("t1", 3.0, 3.0);
    follower.upsert_element(token("t2", 9.0, 9.0));
    assert_eq!(follower.history().undo_len(), 2);

    // A remote edit of t1 drops only the entry that touched t1
    host.move_element("t1", 4.0, 4.0);
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(follower.history().undo_len(), 1);
    let undone = follower.undo().unwrap();
    assert_eq!(undone.entity_id.as_deref(), Some("t2"));
    assert_eq!(follower.document().element("t1").unwrap().x, 4.0);
}

#[tokio::test]
async fn test_stale_full_sync_is_dropped() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;
    let host_id = host.local_peer_id().unwrap().to_string();
    let applied = host.sync_seq();
    assert!(applied >= 1);

    let mut stale = SessionDocument::new("Stale");
    stale.upsert_element(&token("ghost", 0.0, 0.0));
    let payload = Action::Sync(Box::new(FullSync {
        document: stale,
        sync_seq: applied,
    }))
    .encode()
    .unwrap();
    follower.handle_transport_event(TransportEvent::Message {
        channel: "sync".into(),
        payload,
        from: host_id,
    });

    assert!(follower.document().element("ghost").is_none());
    assert_ne!(follower.document().name, "Stale");
    pump(&mut [&mut host, &mut follower]);
}

#[tokio::test]
async fn test_malformed_payload_is_ignored() {
    let network = MemoryNetwork::new();
    let (host, mut follower) = room(&network).await;
    let revision = follower.store().revision();

    follower.handle_transport_event(TransportEvent::Message {
        channel: "elUpdate".into(),
        payload: b"{not json".to_vec(),
        from: host.local_peer_id().unwrap().to_string(),
    });
    follower.handle_transport_event(TransportEvent::Message {
        channel: "bogus".into(),
        payload: b"{}".to_vec(),
        from: host.local_peer_id().unwrap().to_string(),
    });

    assert_eq!(follower.store().revision(), revision);
    assert_eq!(follower.connection_state(), &ConnectionState::Connected);
}

#[tokio::test]
async fn test_cursor_and_ping_are_transient() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;
    let mut events = host.subscribe();
    let revision = host.store().revision();

    assert!(follower.send_cursor(Point::new(12.0, 34.0)));
    assert!(follower.send_ping(Point::new(1.0, 2.0)));
    pump(&mut [&mut host, &mut follower]);

    let follower_id = follower.local_peer_id().unwrap().to_string();
    assert_eq!(host.cursors()[&follower_id], Point::new(12.0, 34.0));
    assert_eq!(host.store().revision(), revision);
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Ping { ping, .. } if ping.color == "#1e88e5" && ping.x == 1.0
    )));
}

#[tokio::test]
async fn test_follower_leave_cleans_host_roster() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;
    let follower_id = follower.local_peer_id().unwrap().to_string();
    follower.send_cursor(Point::new(1.0, 1.0));
    pump(&mut [&mut host, &mut follower]);
    assert!(host.document().players.contains_key(&follower_id));

    follower.leave_room();
    follower.leave_room();
    pump(&mut [&mut host, &mut follower]);

    assert!(!host.document().players.contains_key(&follower_id));
    assert!(host.cursors().is_empty());
    assert!(host.peers().is_empty());
    assert_eq!(follower.connection_state(), &ConnectionState::Disconnected);
    assert_eq!(network.peer_count("tablesync", "r1"), 1);
}

#[tokio::test]
async fn test_host_leaving_keeps_follower_document() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 0.0, 0.0));
    let mut follower = peer(&network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);
    let mut events = follower.subscribe();

    host.leave_room();
    pump(&mut [&mut host, &mut follower]);

    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::HostLost));
    assert!(follower.document().element("t1").is_some());
    assert_eq!(follower.host_peer(), None);
    assert_eq!(follower.connection_state(), &ConnectionState::Connected);
}

#[tokio::test]
async fn test_transport_close_sets_error() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    network.close_room("tablesync", "r1", "room expired");
    pump(&mut [&mut host, &mut follower]);

    assert_eq!(host.connection_state(), &ConnectionState::Error("room expired".into()));
    assert_eq!(follower.connection_state(), &ConnectionState::Error("room expired".into()));
    assert!(!host.send_cursor(Point::new(0.0, 0.0)));
}

#[tokio::test]
async fn test_rejoin_after_open_failure() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    network.set_unavailable(Some("offline"));
    assert!(host.create_room("r1").await.is_err());
    assert!(matches!(host.connection_state(), ConnectionState::Error(_)));

    network.set_unavailable(None);
    host.create_room("r1").await.unwrap();
    assert_eq!(host.connection_state(), &ConnectionState::Connected);
}

#[tokio::test]
async fn test_host_digest_timer_fires() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;
    assert!(host.last_digest_sent_at().is_none());

    for _ in 0..10 {
        if host.last_digest_sent_at().is_some() {
            break;
        }
        let handled = timeout(Duration::from_secs(1), host.process_next()).await;
        assert_eq!(handled.ok(), Some(true));
    }
    assert!(host.last_digest_sent_at().is_some());

    pump(&mut [&mut host, &mut follower]);
    assert!(!follower.is_desynced());
}

#[tokio::test]
async fn test_host_saves_after_debounce() {
    let network = MemoryNetwork::new();
    let saved = Arc::new(MemorySessionStore::new());
    let mut host = peer(&network).with_store(saved.clone());
    host.create_room("r1").await.unwrap();
    host.new_session("Crypt");
    host.upsert_element(token("t1", 0.0, 0.0));
    assert!(host.has_pending_save());

    for _ in 0..10 {
        if !host.has_pending_save() {
            break;
        }
        let _ = timeout(Duration::from_secs(1), host.process_next()).await;
    }
    assert!(!host.has_pending_save());

    let recent = saved.list_recent(10).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].name, "Crypt");
    assert!(recent[0].is_host);
    assert_eq!(saved.load(recent[0].id).unwrap().elements.len(), 1);
}

#[tokio::test]
async fn test_follower_saves_on_leave() {
    let network = MemoryNetwork::new();
    let saved = Arc::new(MemorySessionStore::new());
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    let mut follower = peer(&network).with_store(saved.clone());
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    pump(&mut [&mut host, &mut follower]);

    follower.upsert_element(token("t1", 0.0, 0.0));
    follower.leave_room();

    let recent = saved.list_recent(10).unwrap();
    assert_eq!(recent.len(), 1);
    assert!(!recent[0].is_host);
    assert_eq!(recent[0].player_count, 0);
}

#[tokio::test]
async fn test_conflicting_edits_converge_after_resync() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    for i in 0..5 {
        host.upsert_element(token(&format!("e{i}"), i as f64, 0.0));
    }
    pump(&mut [&mut host, &mut follower]);

    // Interleave edits from both sides without delivering in between
    follower.move_element("e0", 10.0, 10.0);
    host.move_element("e0", 20.0, 20.0);
    follower.delete_element("e1");
    host.upsert_element(token("e1", 7.0, 7.0));
    host.delete_element("e2");
    follower.move_element("e2", 3.0, 3.0);
    follower.upsert_element(token("f1", 1.0, 1.0));
    pump(&mut [&mut host, &mut follower]);

    assert!(follower.request_sync());
    pump(&mut [&mut host, &mut follower]);

    assert_eq!(host.store().digest(), follower.store().digest());
    assert_eq!(host.document().elements, follower.document().elements);
}

#[tokio::test]
async fn test_full_sync_matches_host_digest_at_send_time() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    host.upsert_element(token("t1", 0.0, 0.0));
    let mut follower = peer(&network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    let follower_id = follower.local_peer_id().unwrap().to_string();

    // The join answer leaves before the host has heard from the follower
    host.process_pending();
    assert_eq!(host.sync_seq(), 1);
    let sent = host.store().digest();
    follower.process_pending();
    assert_eq!(follower.store().digest(), sent);
    assert!(!follower.document().players.contains_key(&follower_id));

    // plyJoin is queued ahead of reqSync, so the answer lists the follower
    host.process_pending();
    assert_eq!(host.sync_seq(), 2);
    let sent = host.store().digest();
    follower.process_pending();
    assert_eq!(follower.store().digest(), sent);
    assert_eq!(follower.document().players[&follower_id].name, "Ann");

    // Nothing else is outstanding
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(host.sync_seq(), 2);
    assert!(host.broadcast_digest());
    pump(&mut [&mut host, &mut follower]);
    assert!(!follower.is_desynced());
}

#[tokio::test]
async fn test_second_follower_joins_existing_room() {
    let network = MemoryNetwork::new();
    let (mut host, mut ann) = room(&network).await;
    host.upsert_element(token("t0", 0.0, 0.0));
    pump(&mut [&mut host, &mut ann]);

    let mut bob = peer(&network);
    bob.join_room("r1", "Bob", "#e53935").await.unwrap();
    pump(&mut [&mut host, &mut ann, &mut bob]);

    let ann_id = ann.local_peer_id().unwrap().to_string();
    let bob_id = bob.local_peer_id().unwrap().to_string();
    assert_eq!(bob.connection_state(), &ConnectionState::Connected);
    assert_eq!(bob.host_peer(), host.local_peer_id());
    assert!(bob.document().element("t0").is_some());
    assert!(ann.peers().contains(&bob_id));
    assert!(bob.peers().contains(&ann_id));
    for p in [&host, &ann, &bob] {
        assert_eq!(p.document().players.len(), 3);
        assert_eq!(p.document().players[&ann_id].name, "Ann");
        assert_eq!(p.document().players[&bob_id].name, "Bob");
    }

    // Follower edits reach the other follower without another full sync
    let syncs = host.sync_seq();
    ann.upsert_element(token("t1", 1.0, 2.0));
    pump(&mut [&mut host, &mut ann, &mut bob]);
    assert_eq!(bob.document().element("t1"), ann.document().element("t1"));

    assert!(bob.move_element("t1", 9.0, 9.0));
    bob.send_chat("over here");
    pump(&mut [&mut host, &mut ann, &mut bob]);
    assert_eq!(ann.document().element("t1").unwrap().x, 9.0);
    assert_eq!(ann.document().chat_log.len(), 1);
    assert_eq!(host.sync_seq(), syncs);

    let digest = host.store().digest();
    assert_eq!(ann.store().digest(), digest);
    assert_eq!(bob.store().digest(), digest);
    assert!(host.broadcast_digest());
    pump(&mut [&mut host, &mut ann, &mut bob]);
    assert!(!ann.is_desynced());
    assert!(!bob.is_desynced());
}

#[tokio::test]
async fn test_player_join_cannot_claim_host() {
    let network = MemoryNetwork::new();
    let mut host = peer(&network);
    host.create_room("r1").await.unwrap();
    let mut follower = peer(&network);
    follower.join_room("r1", "Ann", "#1e88e5").await.unwrap();
    let claim = |name: &str| {
        let player = Player::new("spoofed", name, "#000000", Role::Host);
        TransportEvent::Message {
            channel: "plyJoin".into(),
            payload: Action::PlayerJoin(player).encode().unwrap(),
            from: "intruder".into(),
        }
    };

    // Arrives before any sync or digest from the real host
    follower.handle_transport_event(claim("Mallory"));
    assert_eq!(follower.host_peer(), None);
    assert_eq!(follower.document().players["intruder"].role, Role::Player);
    assert!(!follower.document().players.contains_key("spoofed"));

    pump(&mut [&mut host, &mut follower]);
    let host_id = host.local_peer_id().unwrap().to_string();
    assert_eq!(follower.host_peer(), Some(host_id.as_str()));

    // Same claim after the sync: recorded as a player, host unchanged
    let mut events = follower.subscribe();
    follower.handle_transport_event(TransportEvent::PeerJoined("intruder".into()));
    follower.handle_transport_event(claim("Mallory II"));
    assert_eq!(follower.host_peer(), Some(host_id.as_str()));
    assert_eq!(follower.document().players["intruder"].role, Role::Player);
    assert_eq!(follower.document().players[&host_id].role, Role::Host);

    follower.handle_transport_event(TransportEvent::PeerLeft("intruder".into()));
    assert!(!drain(&mut events).contains(&SessionEvent::HostLost));
    assert_eq!(follower.host_peer(), Some(host_id.as_str()));
}

#[tokio::test]
async fn test_new_element_stacks_on_top() {
    let network = MemoryNetwork::new();
    let (mut host, mut follower) = room(&network).await;

    host.upsert_element(ElementPatch {
        z_index: Some(4),
        ..token("map", 0.0, 0.0)
    });
    pump(&mut [&mut host, &mut follower]);

    follower.upsert_element(token("t1", 1.0, 1.0));
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(follower.document().element("t1").unwrap().z_index, 5);
    assert_eq!(host.document().element("t1").unwrap().z_index, 5);

    // Moves keep the stacking order
    assert!(host.move_element("map", 3.0, 3.0));
    pump(&mut [&mut host, &mut follower]);
    assert_eq!(follower.document().element("map").unwrap().z_index, 4);
}
