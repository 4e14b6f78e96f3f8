use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode};
use crate::kv::KeyValue;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Marker persisted while the first flight is still processing.
const IN_FLIGHT: &str = "in-flight";
const IN_FLIGHT_TTL_SECS: u64 = 10;

/// How long a concurrent retry waits for the first flight's record.
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const POLL_ATTEMPTS: u32 = 40;

/// Response bodies are JSON and small; this is a hard safety bound.
const MAX_REPLAY_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct IdempotencyState {
    pub kv: Arc<dyn KeyValue>,
    pub ttl_secs: u64,
}

/// The canonical response persisted per idempotency key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status_code: u16,
    headers: BTreeMap<String, String>,
    body: String,
    created_at: i64,
}

impl StoredResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK));
        for (name, value) in &self.headers {
            if let Ok(v) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), v);
            }
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Deduplicates POSTs by the client-supplied `Idempotency-Key`.
///
/// A hit replays the persisted response verbatim. A miss claims an
/// in-flight marker, runs the inner handler, and persists the response if
/// it was 2xx. KV unavailability never blocks the request: reads degrade to
/// a miss, writes are logged and dropped.
pub async fn idempotency_layer(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    if method != Method::POST && method != Method::PUT && method != Method::PATCH {
        return next.run(request).await;
    }

    let raw_key = request
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let key = match raw_key {
        Some(raw) => match Uuid::parse_str(&raw) {
            Ok(key) => key,
            Err(_) => {
                return ApiError::new(
                    ErrorCode::InvalidIdempotencyKey,
                    "Idempotency-Key must be a valid UUID",
                )
                .into_response()
            }
        },
        None if method == Method::POST => {
            return ApiError::new(
                ErrorCode::MissingIdempotencyKey,
                "Idempotency-Key header is required for POST requests",
            )
            .into_response()
        }
        // PUT/PATCH without a key pass through unmemoized.
        None => return next.run(request).await,
    };

    let cache_key = format!("idempotency:{key}");

    match state.kv.get(&cache_key).await {
        Ok(Some(value)) => {
            if let Some(response) = replay(&value, key) {
                return response;
            }
            // First flight still in progress: wait briefly for its record.
            if let Some(response) = poll_for_record(&state, &cache_key, key).await {
                return response;
            }
        }
        Ok(None) => {
            match state.kv.set_nx_ex(&cache_key, IN_FLIGHT, IN_FLIGHT_TTL_SECS).await {
                Ok(true) => {}
                Ok(false) => {
                    // Lost the claim race; behave like the hit path.
                    if let Ok(Some(value)) = state.kv.get(&cache_key).await {
                        if let Some(response) = replay(&value, key) {
                            return response;
                        }
                    }
                    if let Some(response) = poll_for_record(&state, &cache_key, key).await {
                        return response;
                    }
                }
                Err(e) => warn!(error = %e, "idempotency marker write failed, proceeding"),
            }
        }
        Err(e) => warn!(error = %e, "idempotency cache read failed, proceeding"),
    }

    let response = next.run(request).await;

    if response.status().is_success() {
        persist_response(&state, &cache_key, response).await
    } else {
        // Leave nothing behind so the caller may safely retry.
        release_marker(&state, &cache_key).await;
        response
    }
}

fn replay(value: &str, key: Uuid) -> Option<Response> {
    if value == IN_FLIGHT {
        return None;
    }
    match serde_json::from_str::<StoredResponse>(value) {
        Ok(stored) => {
            info!(idempotency_key = %key, "replaying cached response");
            Some(stored.into_response())
        }
        Err(e) => {
            warn!(idempotency_key = %key, error = %e, "unreadable idempotency record, proceeding");
            None
        }
    }
}

/// Waits for the winning flight to persist its record. Gives up early when
/// the marker vanishes (the winner failed), letting the caller re-run the
/// handler; the payments unique constraint dedupes the write either way.
async fn poll_for_record(
    state: &IdempotencyState,
    cache_key: &str,
    key: Uuid,
) -> Option<Response> {
    for _ in 0..POLL_ATTEMPTS {
        tokio::time::sleep(POLL_INTERVAL).await;
        match state.kv.get(cache_key).await {
            Ok(Some(value)) => {
                if let Some(response) = replay(&value, key) {
                    return Some(response);
                }
            }
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "idempotency poll read failed, proceeding");
                return None;
            }
        }
    }
    warn!(idempotency_key = %key, "in-flight marker outlived the poll window, proceeding");
    None
}

async fn persist_response(
    state: &IdempotencyState,
    cache_key: &str,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_REPLAY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "response buffering failed, skipping idempotency persist");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let mut headers = BTreeMap::new();
    if let Some(ct) = parts.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        headers.insert(header::CONTENT_TYPE.to_string(), ct.to_string());
    }
    let stored = StoredResponse {
        status_code: parts.status.as_u16(),
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        created_at: chrono::Utc::now().timestamp(),
    };

    match serde_json::to_string(&stored) {
        Ok(json) => {
            // A failed write must not fail the already-successful operation.
            if let Err(e) = state.kv.set_ex(cache_key, &json, state.ttl_secs).await {
                warn!(error = %e, "idempotency record write failed");
            }
        }
        Err(e) => warn!(error = %e, "idempotency record serialization failed"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Clears our in-flight marker after a non-2xx outcome, taking care not to
/// clobber a completed record another flight may have stored meanwhile.
async fn release_marker(state: &IdempotencyState, cache_key: &str) {
    match state.kv.get(cache_key).await {
        Ok(Some(value)) if value == IN_FLIGHT => {
            if let Err(e) = state.kv.delete(cache_key).await {
                warn!(error = %e, "idempotency marker release failed");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "idempotency marker release read failed"),
    }
}
