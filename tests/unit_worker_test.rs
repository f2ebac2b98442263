use std::collections::HashMap;
use std::time::Duration;

use sqlgate::core::monitor::{apply_update, ClusterSnapshot, ClusterUpdate};
use sqlgate::core::shared::Collector;
use sqlgate::core::users::UserDatabase;
use sqlgate::core::worker::{
    Inbox, SessionHandle, WorkerLifecycle, WorkerMessage, WorkerPool, WorkerSeed,
};
use tokio::sync::broadcast;

fn make_seeds(n: usize) -> Vec<WorkerSeed> {
    let (_sc, servers) =
        Collector::<ClusterSnapshot, ClusterUpdate, _>::new(ClusterSnapshot::default(), n, 16, apply_update);
    let (_uc, users) = Collector::<UserDatabase, UserDatabase, _>::new(
        UserDatabase::default(),
        n,
        16,
        |m: &mut UserDatabase, u| *m = u,
    );
    servers
        .into_iter()
        .zip(users)
        .enumerate()
        .map(|(id, (servers, users))| WorkerSeed {
            id,
            inbox_capacity: 64,
            pool_ttl: Duration::from_secs(60),
            pool_max_per_key: 2,
            users,
            servers,
        })
        .collect()
}

/// Posts a task and waits for it to run on the worker thread.
fn run_on_worker(pool: &WorkerPool, worker: usize, task: impl FnOnce() + Send + 'static) {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    pool.post_to(
        worker,
        WorkerMessage::Task(Box::new(move || {
            task();
            done_tx.send(()).unwrap();
        })),
    )
    .unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_inbox_preserves_arrival_order() {
    let (inbox, sender) = Inbox::new(8);
    sender.post(WorkerMessage::KillSession(1)).unwrap();
    sender.post(WorkerMessage::KillSession(2)).unwrap();
    sender.post(WorkerMessage::KillSession(3)).unwrap();
    let drained = inbox.drain();
    let ids: Vec<u64> = drained
        .iter()
        .map(|m| match m {
            WorkerMessage::KillSession(id) => *id,
            _ => panic!("unexpected message"),
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(inbox.drain().is_empty());
}

#[test]
fn test_inbox_full_returns_message() {
    let (_inbox, sender) = Inbox::new(1);
    sender.post(WorkerMessage::KillSession(1)).unwrap();
    let err = sender.post(WorkerMessage::KillSession(2));
    match err {
        Err((_, WorkerMessage::KillSession(2))) => {}
        _ => panic!("expected the message back"),
    }
}

#[tokio::test]
async fn test_post_with_backoff_eventually_fails() {
    let (_inbox, sender) = Inbox::new(1);
    sender.post(WorkerMessage::KillSession(1)).unwrap();
    let result = sender.post_with_backoff(WorkerMessage::KillSession(2)).await;
    assert!(result.is_err());
}

#[test]
fn test_worker_resize_draining_and_revival() {
    // 5 provisioned slots, 4 spawned: the concrete resize scenario.
    let pool = WorkerPool::new(make_seeds(5), 4);
    assert_eq!(pool.active_count(), 4);

    // Pin one fake session on each worker.
    for worker in 0..4 {
        run_on_worker(&pool, worker, move || {
            let ctx = sqlgate::core::worker::context();
            let (tx, _rx) = broadcast::channel(1);
            ctx.register_session(
                1000 + worker as u64,
                SessionHandle {
                    user: "app".to_string(),
                    shutdown_tx: tx,
                },
            );
        });
    }

    // Shrink to one worker: the surplus three drain, no session migrates.
    pool.resize(1).unwrap();
    assert_eq!(pool.active_count(), 1);
    let draining = pool
        .describe()
        .iter()
        .filter(|(_, state, _)| *state == WorkerLifecycle::Draining)
        .count();
    assert_eq!(draining, 3);

    // Closing each session flips its worker to Dormant.
    for worker in 1..4 {
        run_on_worker(&pool, worker, move || {
            let ctx = sqlgate::core::worker::context();
            ctx.unregister_session(1000 + worker as u64);
        });
    }
    let states: HashMap<usize, WorkerLifecycle> = pool
        .describe()
        .into_iter()
        .map(|(id, state, _)| (id, state))
        .collect();
    for worker in 1..4 {
        assert_eq!(states[&worker], WorkerLifecycle::Dormant);
    }

    // Growing to 5 revives the dormant three and spawns one fresh worker.
    pool.resize(5).unwrap();
    assert_eq!(pool.active_count(), 5);

    // Beyond the provisioned maximum resizing fails.
    assert!(pool.resize(6).is_err());

    pool.shutdown();
}

#[test]
fn test_assign_skips_draining_workers() {
    let pool = WorkerPool::new(make_seeds(2), 2);
    run_on_worker(&pool, 0, || {
        let ctx = sqlgate::core::worker::context();
        let (tx, _rx) = broadcast::channel(1);
        ctx.register_session(
            1,
            SessionHandle {
                user: "app".to_string(),
                shutdown_tx: tx,
            },
        );
    });
    pool.resize(1).unwrap();
    // Worker 1 (no sessions) went dormant immediately, worker 0 keeps its
    // session and stays the only assignable target... unless it was the
    // one drained. Either way exactly one Active worker remains.
    for _ in 0..8 {
        let (id, _) = pool.assign().unwrap();
        let states: HashMap<usize, WorkerLifecycle> = pool
            .describe()
            .into_iter()
            .map(|(wid, state, _)| (wid, state))
            .collect();
        assert_eq!(states[&id], WorkerLifecycle::Active);
    }
    pool.shutdown();
}
