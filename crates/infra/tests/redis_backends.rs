//! Tests against a live Redis. Run with:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379/15 cargo test -p jobrelay-infra -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobrelay_bus::{BusError, MessageBus};
use jobrelay_core::{Job, JobId, JobMessage, JobStatus};
use jobrelay_infra::config::RedisSettings;
use jobrelay_infra::event_bus::RedisStreamsBus;
use jobrelay_infra::jobs::{JobStore, JobStoreError, RedisJobStore};
use jobrelay_infra::rate_limit::{DurableRateLimiter, RateLimiter, RedisWindowCounter, WindowCounter};
use jobrelay_infra::RedisConnection;

async fn connect() -> RedisConnection {
    let addr = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    RedisConnection::connect(&RedisSettings {
        addr,
        password: None,
        db: 0,
    })
    .await
    .expect("redis reachable")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", JobId::new())
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn store_round_trip_and_ordering() {
    let conn = connect().await;
    let store = RedisJobStore::with_namespace(&conn, unique("test"));

    let older = Job::with_id(JobId::new(), "older", Utc::now() - chrono::Duration::seconds(5));
    let newer = Job::new("newer");
    store.create(&older).await.unwrap();
    store.create(&newer).await.unwrap();
    assert_eq!(
        store.create(&newer).await,
        Err(JobStoreError::AlreadyExists(newer.id()))
    );

    let listed: Vec<_> = store.list().await.unwrap().iter().map(Job::id).collect();
    assert_eq!(listed, vec![newer.id(), older.id()]);

    let mut running = store.get(older.id()).await.unwrap();
    running.start(Utc::now()).unwrap();
    store.update(&running).await.unwrap();
    assert_eq!(store.get(older.id()).await.unwrap().status(), JobStatus::Processing);

    store.delete(older.id()).await.unwrap();
    assert_eq!(
        store.delete(older.id()).await,
        Err(JobStoreError::NotFound(older.id()))
    );
    assert_eq!(
        store.update(&running).await,
        Err(JobStoreError::NotFound(older.id()))
    );
    store.delete(newer.id()).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn only_one_claim_of_a_pending_job_wins() {
    let conn = connect().await;
    let store = RedisJobStore::with_namespace(&conn, unique("claim"));
    let job = Job::new("contested");
    store.create(&job).await.unwrap();

    let mut first = store.get(job.id()).await.unwrap();
    let mut second = store.get(job.id()).await.unwrap();
    first.start(Utc::now()).unwrap();
    second.start(Utc::now()).unwrap();

    store.update_if(&first, JobStatus::Pending).await.unwrap();
    assert_eq!(
        store.update_if(&second, JobStatus::Pending).await,
        Err(JobStoreError::StatusChanged {
            id: job.id(),
            found: JobStatus::Processing
        })
    );

    let ghost = Job::new("ghost");
    assert_eq!(
        store.update_if(&ghost, JobStatus::Pending).await,
        Err(JobStoreError::NotFound(ghost.id()))
    );
    store.delete(job.id()).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn stream_bus_delivers_only_new_messages() {
    let conn = connect().await;
    let bus = Arc::new(RedisStreamsBus::new(&conn, Some(unique("stream"))).with_max_length(100));

    let before = JobMessage::new(JobId::new(), "before-subscribe");
    bus.publish(before).await.unwrap();

    let mut sub = bus.subscribe().await.unwrap();
    let sent: Vec<_> = (0..3)
        .map(|n| JobMessage::new(JobId::new(), format!("after-{n}")))
        .collect();
    for m in &sent {
        bus.publish(m.clone()).await.unwrap();
    }

    for expected in &sent {
        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, expected);
    }

    bus.close();
    assert_eq!(
        bus.publish(JobMessage::new(JobId::new(), "late")).await,
        Err(BusError::QueueClosed)
    );
    let end = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn redis_limiter_counts_per_client() {
    let conn = connect().await;
    let counter = RedisWindowCounter::new(&conn).with_prefix(unique("rl"));
    let limiter = DurableRateLimiter::new(counter, 3, Duration::from_secs(60));

    let mut rejected = 0;
    for _ in 0..4 {
        if !limiter.allow("10.1.1.1").await.allowed {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 1);
    assert!(limiter.allow("10.1.1.2").await.allowed);
}

async fn ttl_of_only_key(conn: &RedisConnection, prefix: &str) -> i64 {
    let mut manager = conn.manager();
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{prefix}:*"))
        .query_async(&mut manager)
        .await
        .unwrap();
    assert_eq!(keys.len(), 1, "{keys:?}");
    redis::cmd("TTL").arg(&keys[0]).query_async(&mut manager).await.unwrap()
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn window_keys_expire_from_the_first_hit() {
    let conn = connect().await;
    let prefix = unique("rl-ttl");
    let counter = RedisWindowCounter::new(&conn).with_prefix(prefix.clone());
    let hour = Duration::from_secs(3600);

    assert_eq!(counter.increment("10.2.2.2", hour).await.unwrap(), 1);
    let first = ttl_of_only_key(&conn, &prefix).await;
    assert!((3600..=3605).contains(&first), "ttl {first}");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(counter.increment("10.2.2.2", hour).await.unwrap(), 2);
    let second = ttl_of_only_key(&conn, &prefix).await;
    assert!(second < first, "ttl was reset: {first} -> {second}");
}
