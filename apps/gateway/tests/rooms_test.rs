mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use common::{Cluster, TestClient};
use roomcast_gateway::db::kv::KeyValueStore;
use roomcast_gateway::gateway::broker::{Broker, BrokerMessage};
use roomcast_gateway::gateway::events::{
    OP_ADD_USER, OP_ERROR, OP_JOIN_ROOM, OP_LEAVE_ROOM, OP_REMOVE_USER, OP_ROOM_JOIN_REQUEST,
};

/// Record everything published on `channel`.
async fn tap(cluster: &Cluster, channel: &str) -> Arc<Mutex<Vec<BrokerMessage>>> {
    let seen: Arc<Mutex<Vec<BrokerMessage>>> = Arc::default();
    let sink = seen.clone();
    Broker::new(cluster.store.clone())
        .subscribe(channel, Arc::new(move |m: BrokerMessage| sink.lock().push(m)))
        .await
        .unwrap();
    seen
}

// ---------------------------------------------------------------------------
// JOIN_ROOM
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_public_room_replies_with_roster_and_announces() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("u");
    cluster.add_user("v");
    cluster.add_room("r", "u", false);
    let room_channel = tap(&cluster, "room.r").await;

    let mut owner = TestClient::connect(&node);
    owner.authenticate(&node, "u", None).await;
    owner.send(&node, OP_JOIN_ROOM, json!("r")).await;
    owner.envelopes();
    room_channel.lock().clear();

    let mut guest = TestClient::connect(&node);
    let guest_session = guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let replies = guest.take(OP_JOIN_ROOM);
    assert_eq!(replies.len(), 1);
    let reply = &replies[0].d;
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["room"]["id"], "r");
    assert_eq!(reply["room"]["ownerId"], "u");
    let users: Vec<&str> = reply["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_str().unwrap())
        .collect();
    assert_eq!(users, vec!["u", "v"]);
    assert_eq!(reply["permissions"], json!(["QUEUE_ADD"]));

    // The owner, already in the room locally, sees the newcomer.
    let added = owner.take(OP_ADD_USER);
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].d["user"]["id"], "v");
    assert_eq!(added[0].d["user"]["displayName"], "User v");

    // The room channel carries the same announcement for other processes.
    let published = room_channel.lock().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message.op, OP_ADD_USER);
    assert_eq!(published[0].message.d["user"]["id"], "v");
    assert!(published[0].target.is_ignored(&guest_session));

    assert_eq!(guest.conn.room_id().as_deref(), Some("r"));
    let stored = node.sessions.get(&guest_session).await.unwrap().unwrap();
    assert_eq!(stored.room_id.as_deref(), Some("r"));
}

#[tokio::test]
async fn owner_gets_every_permission() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("u");
    cluster.add_room("r", "u", true);

    let mut owner = TestClient::connect(&node);
    owner.authenticate(&node, "u", None).await;
    owner.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let reply = &owner.take(OP_JOIN_ROOM)[0].d;
    assert_eq!(reply["status"], 200);
    assert_eq!(
        reply["permissions"],
        json!(["QUEUE_ADD", "QUEUE_EDIT", "VIDEO_REMOTE", "MANAGE_ROOM", "KICK_MEMBERS"])
    );
}

#[tokio::test]
async fn rejoin_without_force_is_a_no_op() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_room("r", "u", false);
    let room_channel = tap(&cluster, "room.r").await;

    let mut guest = TestClient::connect(&node);
    let session_id = guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;
    guest.envelopes();
    let published_before = room_channel.lock().len();

    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let replies = guest.take(OP_JOIN_ROOM);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].d, json!({ "status": 200, "roomId": "r" }));
    assert_eq!(room_channel.lock().len(), published_before);
    assert_eq!(
        node.presence.sessions_for("r", "v").await.unwrap(),
        vec![session_id]
    );
    assert_eq!(node.dispatcher.subscription_count("room.r").await, 1);
}

#[tokio::test]
async fn unknown_room_replies_404() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");

    let mut guest = TestClient::connect(&node);
    guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("nowhere")).await;

    let replies = guest.take(OP_JOIN_ROOM);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].d, json!({ "status": 404 }));
    assert!(guest.conn.room_id().is_none());
}

#[tokio::test]
async fn joining_a_second_room_leaves_the_first() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_room("r1", "u", false);
    cluster.add_room("r2", "u", false);
    let first_channel = tap(&cluster, "room.r1").await;

    let mut guest = TestClient::connect(&node);
    let session_id = guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r1")).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r2")).await;

    assert_eq!(guest.conn.room_id().as_deref(), Some("r2"));
    assert!(node.presence.sessions_for("r1", "v").await.unwrap().is_empty());
    assert_eq!(
        node.presence.sessions_for("r2", "v").await.unwrap(),
        vec![session_id]
    );
    assert!(first_channel
        .lock()
        .iter()
        .any(|m| m.message.op == OP_REMOVE_USER && m.message.d == json!("v")));

    assert_eq!(node.dispatcher.subscription_count("room.r1").await, 0);
    assert_eq!(node.dispatcher.subscription_count("room.r2").await, 1);
}

// ---------------------------------------------------------------------------
// Private rooms
// ---------------------------------------------------------------------------

#[tokio::test]
async fn private_room_without_invite_asks_the_owner() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("u");
    cluster.add_user("v");
    cluster.add_room("r", "u", true);

    let mut owner = TestClient::connect(&node);
    owner.authenticate(&node, "u", None).await;

    let mut guest = TestClient::connect(&node);
    guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;

    // No reply to the requester, no membership change.
    assert!(guest.envelopes().is_empty());
    assert!(guest.conn.room_id().is_none());
    assert!(node.presence.get_user_ids("r").await.unwrap().is_empty());

    let requests = owner.take(OP_ROOM_JOIN_REQUEST);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].d, json!({ "userId": "v" }));
}

#[tokio::test]
async fn accepted_request_grants_a_single_entry() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("u");
    cluster.add_user("v");
    cluster.add_room("r", "u", true);

    let mut owner = TestClient::connect(&node);
    owner.authenticate(&node, "u", None).await;
    owner.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let mut guest = TestClient::connect(&node);
    guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;
    owner.envelopes();

    owner.send(&node, OP_ROOM_JOIN_REQUEST, json!("v")).await;
    let notices = guest.take(OP_ROOM_JOIN_REQUEST);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].d, json!({ "roomId": "r" }));

    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;
    assert_eq!(guest.take(OP_JOIN_ROOM)[0].d["status"], 200);
    assert!(cluster.store.hget("rooms.invites.r", "v").await.unwrap().is_none());

    // The invite was consumed: leaving and coming back needs approval again.
    guest.send(&node, OP_LEAVE_ROOM, json!(null)).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;
    assert!(guest.take(OP_JOIN_ROOM).is_empty());
    assert!(guest.conn.room_id().is_none());
}

#[tokio::test]
async fn members_cannot_accept_join_requests() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_user("w");
    cluster.add_room("r", "u", false);

    let mut member = TestClient::connect(&node);
    member.authenticate(&node, "v", None).await;
    member.send(&node, OP_JOIN_ROOM, json!("r")).await;
    member.envelopes();

    let mut other = TestClient::connect(&node);
    other.authenticate(&node, "w", None).await;

    member.send(&node, OP_ROOM_JOIN_REQUEST, json!("w")).await;

    assert!(cluster.store.hget("rooms.invites.r", "w").await.unwrap().is_none());
    assert!(other.take(OP_ROOM_JOIN_REQUEST).is_empty());
    assert!(member.take(OP_ERROR).is_empty());
}

// ---------------------------------------------------------------------------
// LEAVE_ROOM
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_leave_clears_the_stored_room() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_room("r", "u", false);
    let room_channel = tap(&cluster, "room.r").await;

    let mut guest = TestClient::connect(&node);
    let session_id = guest.authenticate(&node, "v", None).await;
    guest.send(&node, OP_JOIN_ROOM, json!("r")).await;
    guest.send(&node, OP_LEAVE_ROOM, json!(null)).await;

    assert!(guest.conn.room_id().is_none());
    let stored = node.sessions.get(&session_id).await.unwrap().unwrap();
    assert!(stored.room_id.is_none());
    assert!(cluster.store.hget("rooms.sessions.r", "v").await.unwrap().is_none());
    assert_eq!(node.dispatcher.subscription_count("room.r").await, 0);

    let removes: Vec<_> = room_channel
        .lock()
        .iter()
        .filter(|m| m.message.op == OP_REMOVE_USER)
        .cloned()
        .collect();
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].message.d, json!("v"));

    // Leaving again is a no-op.
    guest.envelopes();
    guest.send(&node, OP_LEAVE_ROOM, json!(null)).await;
    assert!(guest.envelopes().is_empty());
}

/// ADD_USER goes out for every joining session, but REMOVE_USER only when
/// the user's last session leaves. Clients must de-duplicate additions.
#[tokio::test]
async fn join_and_leave_broadcasts_are_asymmetric() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_room("r", "u", false);
    let room_channel = tap(&cluster, "room.r").await;

    let mut first = TestClient::connect(&node);
    first.authenticate(&node, "v", None).await;
    first.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let mut second = TestClient::connect(&node);
    second.authenticate(&node, "v", None).await;
    second.send(&node, OP_JOIN_ROOM, json!("r")).await;

    let count = |op: u8| room_channel.lock().iter().filter(|m| m.message.op == op).count();
    assert_eq!(count(OP_ADD_USER), 2);
    assert_eq!(node.presence.get_user_ids("r").await.unwrap(), vec!["v"]);

    second.send(&node, OP_LEAVE_ROOM, json!(null)).await;
    assert_eq!(count(OP_REMOVE_USER), 0);
    assert_eq!(node.presence.get_user_ids("r").await.unwrap(), vec!["v"]);

    first.send(&node, OP_LEAVE_ROOM, json!(null)).await;
    assert_eq!(count(OP_REMOVE_USER), 1);
    assert!(node.presence.get_user_ids("r").await.unwrap().is_empty());
}

#[tokio::test]
async fn room_channel_is_counted_per_connection() {
    let cluster = Cluster::new();
    let node = cluster.node();
    cluster.add_user("v");
    cluster.add_user("w");
    cluster.add_room("r", "u", false);

    let mut a = TestClient::connect(&node);
    a.authenticate(&node, "v", None).await;
    a.send(&node, OP_JOIN_ROOM, json!("r")).await;
    let mut b = TestClient::connect(&node);
    b.authenticate(&node, "w", None).await;
    b.send(&node, OP_JOIN_ROOM, json!("r")).await;

    assert_eq!(node.dispatcher.subscription_count("room.r").await, 2);
    assert_eq!(cluster.store.subscriber_count("room.r"), 1);

    a.send(&node, OP_LEAVE_ROOM, json!(null)).await;
    assert_eq!(cluster.store.subscriber_count("room.r"), 1);
    b.disconnect(&node).await;
    assert_eq!(cluster.store.subscriber_count("room.r"), 0);
}
