use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use weave_collab::broadcast::BroadcastGroup;
use weave_collab::events::{EventContext, EventListeners, RoomEvent};
use weave_collab::presence::{AwarenessMessage, PresenceRoom, Viewport};
use weave_collab::protocol::{PeerInfo, SyncMessage};
use weave_core::{Point, Presence, UserInfo};

// ─── Wire protocol ───────────────────────────────────────────────

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let delta = vec![0u8; 64]; // Typical single-field update

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), "canvas-1", black_box(1), black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(Uuid::new_v4(), "canvas-1", 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_event_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let event = RoomEvent::NodeUpdated { node_id: 7 };

    c.bench_function("event_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::event(black_box(peer), "canvas-1", 1, black_box(&event)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let cursor = AwarenessMessage::Cursor {
        user_id: peer,
        position: Some(Point::new(150.0, 250.0)),
        timestamp: 42,
    };

    c.bench_function("cursor_msg_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(peer, "canvas-1", 1, black_box(&cursor)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

// ─── Fan-out ─────────────────────────────────────────────────────

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    receivers.push(group.add_peer(PeerInfo::new(format!("Peer{i}"))).await);
                }

                let from = Uuid::new_v4();
                for i in 0..1000u64 {
                    group.broadcast_raw(from, black_box(Arc::new(vec![i as u8; 64])));
                }
            });
        })
    });
}

fn bench_listener_dispatch(c: &mut Criterion) {
    let listeners = EventListeners::new();
    for i in 0..8 {
        listeners.register(format!("listener-{i}"), Arc::new(|ctx: &EventContext| {
            black_box(ctx.event.kind());
        }));
    }
    let context = EventContext {
        connection_id: Uuid::new_v4(),
        event: RoomEvent::NodeCreated { node_id: 1 },
    };

    c.bench_function("dispatch_8_listeners", |b| {
        b.iter(|| black_box(listeners.dispatch(black_box(&context))))
    });
}

// ─── Presence ────────────────────────────────────────────────────

fn bench_presence_handle_cursor(c: &mut Criterion) {
    let remote = Uuid::new_v4();
    let mut room = PresenceRoom::new(Uuid::new_v4(), Presence::initial(UserInfo::anonymous()));
    room.handle_message(&AwarenessMessage::Join {
        user_id: remote,
        presence: Presence::initial(UserInfo::from_identity(Some("Bob"), None, None)),
    });
    let mut timestamp = 0u64;

    c.bench_function("presence_handle_cursor", |b| {
        b.iter(|| {
            timestamp += 1;
            room.handle_message(black_box(&AwarenessMessage::Cursor {
                user_id: remote,
                position: Some(Point::new(timestamp as f64, 10.0)),
                timestamp,
            }));
        })
    });
}

fn bench_local_cursor_throttled(c: &mut Criterion) {
    let mut room = PresenceRoom::with_interval(
        Uuid::new_v4(),
        Presence::initial(UserInfo::anonymous()),
        Duration::from_millis(16),
    );
    let viewport = Viewport {
        container_left: 40.0,
        container_top: 60.0,
        pan_x: -120.0,
        pan_y: 35.0,
        zoom: 1.5,
    };

    c.bench_function("pointer_move_to_presence", |b| {
        b.iter(|| {
            let position = viewport.to_canvas(black_box(640.0), black_box(480.0));
            black_box(room.update_local_cursor(Some(position)));
        })
    });
}

fn bench_others_selected_nodes(c: &mut Criterion) {
    let mut room = PresenceRoom::new(Uuid::new_v4(), Presence::initial(UserInfo::anonymous()));
    for i in 0..20 {
        let user_id = Uuid::new_v4();
        room.handle_message(&AwarenessMessage::Join {
            user_id,
            presence: Presence::initial(UserInfo::from_identity(Some(&format!("User{i}")), None, None)),
        });
        room.handle_message(&AwarenessMessage::Selection {
            user_id,
            node_ids: (0..5).map(|n| n + i).collect(),
        });
    }

    c.bench_function("others_selected_nodes_20_peers", |b| {
        b.iter(|| black_box(room.others_selected_nodes()))
    });
}

criterion_group!(
    protocol_benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_event_encode,
    bench_cursor_encode,
);

criterion_group!(fanout_benches, bench_broadcast_1000_messages, bench_listener_dispatch);

criterion_group!(
    presence_benches,
    bench_presence_handle_cursor,
    bench_local_cursor_throttled,
    bench_others_selected_nodes,
);

criterion_main!(protocol_benches, fanout_benches, presence_benches);
