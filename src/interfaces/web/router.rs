use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{chat, health};

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .expose_headers([HeaderName::from_static(chat::RUN_ID_HEADER)])
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_endpoint))
        .route("/api/chat", post(chat::chat_stream_endpoint))
        .route("/api/chat/continue", post(chat::chat_stream_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors(&state.cors_origins))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::ScriptedAgent;
    use crate::core::run::{Message, PendingCall, PendingKind, Run, RunStatus};
    use crate::core::error::RelayError;
    use crate::core::store::{MemoryRunStore, RunMutator, RunStore, StoreError};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    /// Store whose database has gone away.
    struct UnavailableStore;

    #[async_trait]
    impl RunStore for UnavailableStore {
        async fn create(&self, _history: Vec<Message>, _model: Option<String>) -> Result<Run, StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
        async fn get(&self, _run_id: &str) -> Result<Run, StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
        async fn update(&self, _run_id: &str, _mutator: RunMutator<'_>) -> Result<Run, RelayError> {
            Err(StoreError::Unavailable("database is locked".into()).into())
        }
        async fn delete(&self, _run_id: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
        async fn purge_expired(&self, _ttl: Duration) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
    }

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(MemoryRunStore::default()),
            Arc::new(ScriptedAgent::demo()),
            "scripted-demo",
            vec!["http://localhost:5173".to_string()],
        )
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(raw) => Body::from(raw.to_string()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn awaiting_approval_run(state: &AppState) -> String {
        let run = state
            .store
            .create(vec![Message::user_text("Show revenue")], None)
            .await
            .unwrap();
        state
            .store
            .update(
                &run.id,
                Box::new(|run: &mut Run| {
                    run.pending_calls.insert(
                        "call_1".to_string(),
                        PendingCall {
                            call_id: "call_1".to_string(),
                            tool_name: "run_query".to_string(),
                            input: serde_json::json!({"sql": "SELECT 1"}),
                            kind: PendingKind::Approval,
                        },
                    );
                    run.transition(RunStatus::AwaitingApproval)
                }),
            )
            .await
            .unwrap();
        run.id
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state());

        let req = Request::builder()
            .method(Method::GET)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(
            resp.headers()
                .get("content-security-policy")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("default-src 'none'")
        );
    }

    #[tokio::test]
    async fn health_reports_model() {
        let app = build_api_router(test_state());
        let (status, json) = json_request(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model"], "scripted-demo");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = build_api_router(test_state());
        let (status, json) = json_request(app, Method::POST, "/api/chat", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
        assert!(json["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn fresh_request_without_user_message_is_rejected() {
        let app = build_api_router(test_state());
        let (status, json) =
            json_request(app, Method::POST, "/api/chat", Some(r#"{"messages":[]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = build_api_router(test_state());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/chat/continue",
            Some(r#"{"run_id":"run_missing","approvals":{"call_1":true},"messages":[]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "run_not_found");
    }

    #[tokio::test]
    async fn continuation_on_active_run_conflicts() {
        let state = test_state();
        let run = state
            .store
            .create(vec![Message::user_text("hello")], None)
            .await
            .unwrap();
        let body = format!(
            r#"{{"run_id":"{}","approvals":{{"call_1":true}},"messages":[]}}"#,
            run.id
        );
        let app = build_api_router(state);
        let (status, json) = json_request(app, Method::POST, "/api/chat", Some(&body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "conflicting_resume");
    }

    #[tokio::test]
    async fn mismatched_decision_is_unprocessable_and_leaves_run_alone() {
        let state = test_state();
        let run_id = awaiting_approval_run(&state).await;
        let body = format!(
            r#"{{"run_id":"{}","approvals":{{"call_9":true}},"messages":[]}}"#,
            run_id
        );
        let app = build_api_router(state.clone());
        let (status, json) = json_request(app, Method::POST, "/api/chat", Some(&body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "invalid_continuation");

        let run = state.store.get(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::AwaitingApproval);
        assert!(run.pending_calls.contains_key("call_1"));
    }

    #[tokio::test]
    async fn unavailable_store_is_rejected_before_streaming() {
        let state = AppState::new(
            Arc::new(UnavailableStore),
            Arc::new(ScriptedAgent::demo()),
            "scripted-demo",
            Vec::new(),
        );
        let bodies = [
            r#"{"messages":[{"role":"user","content":"hello"}]}"#,
            r#"{"run_id":"run_1","approvals":{"call_1":true},"messages":[]}"#,
        ];
        for body in bodies {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap();
            let resp = build_api_router(state.clone()).oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert!(resp.headers().get(chat::RUN_ID_HEADER).is_none());
            let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let text = String::from_utf8(bytes.to_vec()).unwrap();
            assert!(!text.contains("data:"), "unexpected frames: {text}");
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["error"]["code"], "storage_error");
            assert!(json["error"]["message"].as_str().unwrap().contains("database is locked"));
        }
    }

    #[tokio::test]
    async fn method_not_allowed_returns_405() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/chat")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn cors_preflight_allows_configured_origin() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/chat")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let paths = ["/health", "/api/chat", "/api/chat/continue"];

        let unique: HashSet<&str> = paths.iter().copied().collect();
        assert_eq!(unique.len(), paths.len(), "Duplicate routes found in route contract");

        let app = build_api_router(test_state());
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_ne!(
                resp.status(),
                StatusCode::NOT_FOUND,
                "Route missing from router: {}",
                path
            );
        }
    }
}
