use crate::error::ApiError;
use crate::normalize::normalize;
use crate::store::{EventStore, StoredEvent};
use axum::{
    Router,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use std::{path::Path, sync::Arc};
use tower_http::{cors::CorsLayer, services::ServeFile, trace::TraceLayer};
use tracing::{info, warn};

pub const EVENT_HEADER: &str = "x-github-event";

/// GitHub caps webhook deliveries at 25 MB.
pub const WEBHOOK_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Number of events returned by `GET /events`.
pub const RECENT_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
}

/// JSON values the ingress treats as "no payload".
fn is_blank(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            warn!("Missing X-GitHub-Event header");
            ApiError::InvalidPayload
        })?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!("Failed to parse webhook payload: {}", e);
        ApiError::InvalidPayload
    })?;

    if is_blank(&payload) {
        warn!("Empty {} webhook payload", event_type);
        return Err(ApiError::InvalidPayload);
    }

    info!("Received {} event", event_type);

    let Some(event) = normalize(event_type, payload) else {
        return Ok(Json(WebhookResponse { status: "ignored" }));
    };

    let kind = event.summary.kind.as_str();
    let id = state.store.append(event).await?;
    info!("Stored {} event as {}", kind, id);

    Ok(Json(WebhookResponse { status: "stored" }))
}

async fn list_events(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    Ok(Json(state.store.recent(RECENT_LIMIT).await?))
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({ "status": "running" }))
}

/// Builds the service router. `GET /` serves `index.html` from `static_dir`.
pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/webhook",
            post(handle_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .route("/events", get(list_events))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: EventStore,
        _static_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let static_dir = tempfile::tempdir().unwrap();
        std::fs::write(static_dir.path().join("index.html"), "<h1>events</h1>").unwrap();
        let store = EventStore::open_in_memory().unwrap();
        let app = router(
            AppState {
                store: store.clone(),
            },
            static_dir.path(),
        );
        Harness {
            app,
            store,
            _static_dir: static_dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn webhook(event_type: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::post("/webhook").header("content-type", "application/json");
        if let Some(event_type) = event_type {
            builder = builder.header("X-GitHub-Event", event_type);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    #[tokio::test]
    async fn health_is_fixed() {
        let h = harness();
        for _ in 0..3 {
            let request = Request::get("/health").body(Body::empty()).unwrap();
            assert_eq!(
                send(&h.app, request).await,
                (StatusCode::OK, json!({"status": "running"}))
            );
        }
    }

    #[tokio::test]
    async fn push_is_stored_and_listed() {
        let h = harness();
        let body = r#"{"pusher":{"name":"alice"},"ref":"refs/heads/main","head_commit":{"timestamp":"2024-01-01T00:00:00Z"}}"#;

        let stored = send(&h.app, webhook(Some("push"), body)).await;
        assert_eq!(stored, (StatusCode::OK, json!({"status": "stored"})));

        let request = Request::get("/events").body(Body::empty()).unwrap();
        let (status, events) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);

        let id = events[0]["_id"].as_str().unwrap().to_owned();
        assert_eq!(
            events,
            json!([{
                "_id": id,
                "type": "push",
                "author": "alice",
                "from_branch": null,
                "to_branch": "main",
                "timestamp": "2024-01-01T00:00:00Z"
            }])
        );
    }

    #[tokio::test]
    async fn closed_unmerged_pull_request_is_ignored() {
        let h = harness();
        let body = r#"{"action":"closed","pull_request":{"merged":false,"head":{"ref":"f"},"base":{"ref":"main"}},"sender":{"login":"bob"}}"#;

        let response = send(&h.app, webhook(Some("pull_request"), body)).await;

        assert_eq!(response, (StatusCode::OK, json!({"status": "ignored"})));
        assert!(h.store.recent(RECENT_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let h = harness();

        let response = send(&h.app, webhook(Some("issues"), r#"{"action":"opened"}"#)).await;

        assert_eq!(response, (StatusCode::OK, json!({"status": "ignored"})));
    }

    #[rstest]
    #[case(Some("push"), "")]
    #[case(Some("push"), "not json")]
    #[case(Some("push"), "{}")]
    #[case(Some("push"), "null")]
    #[case(Some("push"), "[]")]
    #[case(Some("push"), "false")]
    #[case(None, r#"{"ref":"refs/heads/main"}"#)]
    #[case(Some(""), r#"{"ref":"refs/heads/main"}"#)]
    #[tokio::test]
    async fn invalid_deliveries_are_rejected(#[case] event_type: Option<&str>, #[case] body: &str) {
        let h = harness();

        let response = send(&h.app, webhook(event_type, body)).await;

        assert_eq!(
            response,
            (
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid webhook payload"})
            )
        );
        assert!(h.store.recent(RECENT_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_larger_than_default_body_limit_is_stored() {
        let h = harness();
        let body = json!({
            "ref": "refs/heads/main",
            "commits": [{"message": "x".repeat(3 * 1024 * 1024)}]
        });

        let response = send(&h.app, webhook(Some("push"), &body.to_string())).await;

        assert_eq!(response, (StatusCode::OK, json!({"status": "stored"})));
        assert_eq!(h.store.recent(RECENT_LIMIT).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_on_webhook_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("events.db");
        let store = EventStore::open(db_path.to_str().unwrap()).unwrap();
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_inserts BEFORE INSERT ON events
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        let app = router(
            AppState {
                store: store.clone(),
            },
            dir.path(),
        );

        let response = send(&app, webhook(Some("push"), r#"{"ref":"refs/heads/main"}"#)).await;

        assert_eq!(
            response,
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "Internal server error"})
            )
        );
        assert!(store.recent(RECENT_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_are_capped_and_omit_raw() {
        let h = harness();
        for day in 1..=23 {
            let body = json!({
                "ref": format!("refs/heads/b{day}"),
                "head_commit": {"timestamp": format!("2024-01-{day:02}T00:00:00Z")}
            });
            let (status, _) = send(&h.app, webhook(Some("push"), &body.to_string())).await;
            assert_eq!(status, StatusCode::OK);
        }

        let request = Request::get("/events").body(Body::empty()).unwrap();
        let (_, events) = send(&h.app, request).await;
        let events = events.as_array().unwrap();

        assert_eq!(events.len(), RECENT_LIMIT);
        assert_eq!(events[0]["to_branch"], "b23");
        assert!(events.iter().all(|e| e.get("raw").is_none()));
        assert!(events.iter().all(|e| e["_id"].is_string()));
    }

    #[tokio::test]
    async fn landing_page_is_served() {
        let h = harness();
        let request = Request::get("/").body(Body::empty()).unwrap();

        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<h1>events</h1>");
    }

    #[rstest]
    #[case(json!(null), true)]
    #[case(json!(0), true)]
    #[case(json!(0.0), true)]
    #[case(json!(""), true)]
    #[case(json!(1), false)]
    #[case(json!(true), false)]
    #[case(json!([0]), false)]
    #[case(json!({"a": null}), false)]
    fn blank_payloads(#[case] payload: Value, #[case] blank: bool) {
        assert_eq!(is_blank(&payload), blank);
    }
}
