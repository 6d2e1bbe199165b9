//! Integration tests for the Redis result backend
//!
//! These exercise storage, pub/sub delivery, and recovery races against a
//! live Redis. They are marked #[ignore] by default since they require
//! running infrastructure (redis://localhost:6379).

use std::time::Duration;

use conveyor_celery::{
    Backend, RedisResultBackend, RedisResultBackendConfig, ResultEnvelope, TaskError,
};
use redis::AsyncCommands;

async fn create_backend() -> RedisResultBackend {
    RedisResultBackend::connect(RedisResultBackendConfig::default())
        .await
        .expect("Failed to connect to Redis backend")
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open("redis://localhost:6379")
        .expect("Invalid Redis URL")
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis")
}

fn fresh_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_put_then_get() {
    let backend = create_backend().await;
    let task_id = fresh_task_id();

    let envelope = ResultEnvelope::success(task_id.clone(), serde_json::json!("foo"));
    backend.put(&envelope).await.unwrap();

    let received = backend
        .get(&task_id, Some(Duration::from_millis(15)))
        .await
        .unwrap();
    assert_eq!(received.task_id, task_id);
    assert_eq!(received.result, serde_json::json!("foo"));
    assert!(received.traceback.is_none());
    assert!(received.children.is_empty());

    backend.delete(&task_id).await.unwrap();
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_publish_before_get_settles_waiter() {
    let backend = std::sync::Arc::new(create_backend().await);
    let task_id = fresh_task_id();

    let waiter = {
        let backend = backend.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move { backend.get(&task_id, Some(Duration::from_secs(5))).await })
    };

    // Give the waiter a moment to park on the subscription, then announce
    // the result from a foreign connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let envelope = ResultEnvelope::success(task_id.clone(), serde_json::json!("foo"));
    let payload = serde_json::to_string(&envelope).unwrap();
    let mut conn = raw_connection().await;
    let _: i64 = conn
        .publish(format!("celery-task-meta-{}", task_id), payload)
        .await
        .unwrap();

    let received = waiter.await.unwrap().unwrap();
    assert_eq!(received.result, serde_json::json!("foo"));
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_result_stored_before_subscription_is_recovered() {
    let task_id = fresh_task_id();
    let envelope = ResultEnvelope::success(task_id.clone(), serde_json::json!(42));
    let payload = serde_json::to_string(&envelope).unwrap();

    // Store (and even publish into the void) before any backend exists.
    let mut conn = raw_connection().await;
    let key = format!("celery-task-meta-{}", task_id);
    let _: () = conn.set_ex(&key, &payload, 86400).await.unwrap();
    let _: i64 = conn.publish(&key, &payload).await.unwrap();

    // A backend created afterwards missed the announcement but still finds
    // the stored value through the GET fallback.
    let backend = create_backend().await;
    let received = backend
        .get(&task_id, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(received.result, serde_json::json!(42));

    backend.delete(&task_id).await.unwrap();
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_put_applies_ttl() {
    let backend = create_backend().await;
    let task_id = fresh_task_id();

    backend
        .put(&ResultEnvelope::success(task_id.clone(), serde_json::json!(1)))
        .await
        .unwrap();

    let mut conn = raw_connection().await;
    let key = format!("celery-task-meta-{}", task_id);
    let ttl: i64 = conn.ttl(&key).await.unwrap();
    assert!(ttl > 86398, "TTL should be about a day, got {}", ttl);

    let stored: String = conn.get(&key).await.unwrap();
    let parsed: ResultEnvelope = serde_json::from_str(&stored).unwrap();
    assert_eq!(parsed.task_id, task_id);

    backend.delete(&task_id).await.unwrap();
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_delete_removes_both_sides() {
    let backend = create_backend().await;
    let task_id = fresh_task_id();

    backend
        .put(&ResultEnvelope::success(task_id.clone(), serde_json::json!(1)))
        .await
        .unwrap();
    assert_eq!(backend.delete(&task_id).await.unwrap(), "1");

    let mut conn = raw_connection().await;
    let exists: i64 = conn
        .exists(format!("celery-task-meta-{}", task_id))
        .await
        .unwrap();
    assert_eq!(exists, 0);

    // Deleting again finds nothing on the Redis side.
    assert_eq!(backend.delete(&task_id).await.unwrap(), "0");
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_get_times_out_without_result() {
    let backend = create_backend().await;
    let err = backend
        .get(&fresh_task_id(), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Timeout(_)));
    backend.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_uri_reconstruction() {
    let backend = create_backend().await;
    assert_eq!(backend.uri().unwrap(), "redis://localhost:6379");
    backend.close().await.unwrap();
}
