//! Router-level idempotency behavior over the in-memory KV store: replay,
//! key validation, single execution under concurrency, retry after failure.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use rail_gateway::idempotency::{idempotency_layer, IdempotencyState, IDEMPOTENCY_HEADER};
use rail_gateway::kv::{KeyValue, MemoryKv};

fn test_router(hits: Arc<AtomicUsize>) -> Router {
    let kv: Arc<dyn KeyValue> = Arc::new(MemoryKv::new());
    let state = IdempotencyState { kv, ttl_secs: 3600 };

    let post_hits = Arc::clone(&hits);
    let put_hits = Arc::clone(&hits);
    Router::new()
        .route(
            "/payments/initiate",
            post(move || {
                let hits = Arc::clone(&post_hits);
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "transaction_id": format!("txn-{n}"), "hit": n }))
                }
            }),
        )
        .route(
            "/limits",
            put(move || {
                let hits = Arc::clone(&put_hits);
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "hit": n }))
                }
            }),
        )
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(state, idempotency_layer))
}

fn post_request(path: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(IDEMPOTENCY_HEADER, key);
    }
    builder.body(Body::from("{}")).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_repeated_posts_replay_first_response() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_router(Arc::clone(&hits));
    let key = Uuid::new_v4().to_string();

    let first = app
        .clone()
        .oneshot(post_request("/payments/initiate", Some(&key)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;

    let second = app
        .clone()
        .oneshot(post_request("/payments/initiate", Some(&key)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;

    assert_eq!(first_body, second_body);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "handler ran more than once");
}

#[tokio::test]
async fn test_distinct_keys_are_distinct_requests() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_router(Arc::clone(&hits));

    for _ in 0..2 {
        let key = Uuid::new_v4().to_string();
        let response = app
            .clone()
            .oneshot(post_request("/payments/initiate", Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_retries_execute_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_router(Arc::clone(&hits));
    let key = Uuid::new_v4().to_string();

    let (a, b) = tokio::join!(
        app.clone().oneshot(post_request("/payments/initiate", Some(&key))),
        app.clone().oneshot(post_request("/payments/initiate", Some(&key))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let body_a = body_json(a).await;
    let body_b = body_json(b).await;
    assert_eq!(body_a, body_b, "concurrent retries diverged");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_without_key_rejected() {
    let app = test_router(Arc::new(AtomicUsize::new(0)));

    let response = app
        .oneshot(post_request("/payments/initiate", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "MISSING_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn test_malformed_key_rejected() {
    let app = test_router(Arc::new(AtomicUsize::new(0)));

    let response = app
        .oneshot(post_request("/payments/initiate", Some("not-a-uuid")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn test_put_without_key_passes_through() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = test_router(Arc::clone(&hits));

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/limits")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    // No memoization without a key.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_get_bypasses_idempotency() {
    let app = test_router(Arc::new(AtomicUsize::new(0)));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_failures_are_not_memoized() {
    // Handler fails once, then succeeds. The failed attempt must leave no
    // record, so the retry reaches the handler; the success is then cached.
    let attempts = Arc::new(AtomicUsize::new(0));
    let kv: Arc<dyn KeyValue> = Arc::new(MemoryKv::new());
    let state = IdempotencyState { kv, ttl_secs: 3600 };

    let handler_attempts = Arc::clone(&attempts);
    let app = Router::new()
        .route(
            "/payments/initiate",
            post(move || {
                let attempts = Arc::clone(&handler_attempts);
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "attempt": n })))
                            .into_response()
                    } else {
                        (StatusCode::OK, Json(json!({ "attempt": n }))).into_response()
                    }
                }
            }),
        )
        .layer(middleware::from_fn_with_state(state, idempotency_layer));

    let key = Uuid::new_v4().to_string();

    let first = app
        .clone()
        .oneshot(post_request("/payments/initiate", Some(&key)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let second = app
        .clone()
        .oneshot(post_request("/payments/initiate", Some(&key)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["attempt"], 2);

    // The success is now the canonical response.
    let third = app
        .clone()
        .oneshot(post_request("/payments/initiate", Some(&key)))
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    assert_eq!(body_json(third).await["attempt"], 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
