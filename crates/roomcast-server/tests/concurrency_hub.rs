use roomcast_server::envelope::{Envelope, EnvelopeKind};
use roomcast_server::hub::{RoomHub, SessionHandle, SessionKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

const ROOMS: i64 = 4;
const USERS: i64 = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_churn_keeps_presence_consistent() {
    let hub = RoomHub::new();
    let mut tasks = Vec::new();

    for user_id in 1..=USERS {
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let room_id = user_id % ROOMS;
            let mut keep = None;
            for round in 0..25 {
                let (tx, mut rx) = mpsc::channel(1024);
                let key = SessionKey::new(room_id, user_id);
                let handle = SessionHandle::new(key, format!("user-{user_id}"), tx, Arc::new(Notify::new()));
                hub.register(handle).await;

                let envelope = Envelope::new(EnvelopeKind::Typing, room_id, user_id, "");
                hub.broadcast(room_id, &envelope).await;
                while rx.try_recv().is_ok() {}

                // Even users end with one session left open.
                if user_id % 2 == 0 && round == 24 {
                    keep = Some(rx);
                } else {
                    hub.unregister(key).await;
                }
            }
            keep
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(10), futures_util::future::join_all(tasks))
        .await
        .expect("hub deadlocked under churn");

    let mut receivers = Vec::new();
    for result in results {
        if let Some(rx) = result.unwrap() {
            receivers.push(rx);
        }
    }

    let online = hub.online_users().await;
    let expected: Vec<i64> = (1..=USERS).filter(|id| id % 2 == 0).collect();
    assert_eq!(online, expected);

    let mut total = 0;
    for room_id in 0..ROOMS {
        let users = hub.room_users(room_id).await;
        assert!(users.iter().all(|id| id % ROOMS == room_id && id % 2 == 0));
        total += hub.room_size(room_id).await;
    }
    assert_eq!(total, receivers.len());
}
