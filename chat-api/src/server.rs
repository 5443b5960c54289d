use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post},
    Router,
};
use chat_core::SyncContext;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;
use crate::sessions::SessionRegistry;
use crate::websocket;

/// Shared request state: backend handles plus the per-session engines.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: SyncContext,
    pub sessions: Arc<SessionRegistry>,
}

impl ApiState {
    pub fn new(ctx: SyncContext) -> Self {
        let sessions = Arc::new(SessionRegistry::new(ctx.clone()));
        Self { ctx, sessions }
    }
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(|s| s.trim()) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = cors_layer(state.ctx.config.server.cors_origins.as_deref());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws/conversations/:id", get(websocket::websocket_handler))
        .route("/api/v1/conversations/:id/open", post(handlers::open_conversation))
        .route("/api/v1/conversations/:id/close", post(handlers::close_conversation))
        .route(
            "/api/v1/conversations/:id/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/api/v1/conversations/:id/read", post(handlers::mark_read))
        .route("/api/v1/unread", get(handlers::get_unread_counts))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(state: ApiState) -> Result<()> {
    let server = &state.ctx.config.server;
    let addr = format!("{}:{}", server.host, server.api_port);
    let sessions = state.sessions.clone();
    let app = router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped, closing {} sync sessions", sessions.len());
    sessions.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use chat_core::Config;
    use chat_store::InMemoryBackend;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn app(dir: &std::path::Path) -> Router {
        let mut config = Config::from_env();
        config.server.jwt_secret = SECRET.to_string();
        config.server.cors_origins = None;
        config.sync.watermark_dir = dir.to_path_buf();
        let backend = Arc::new(InMemoryBackend::new());
        router(ApiState::new(SyncContext::new(config, backend.clone(), backend)))
    }

    fn bearer(user_id: &str) -> String {
        let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as usize + 3600;
        let claims = auth::Claims {
            sub: user_id.to_string(),
            exp,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_ref())).unwrap();
        format!("Bearer {}", token)
    }

    fn request(method: &str, uri: &str, user: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, bearer(user))
            .header(auth::DEVICE_HEADER, "laptop");
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/conversations/m1/open")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_open_send_and_unread_flow() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        // sending before opening is rejected
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/conversations/m1/messages",
                "recruiter-1",
                Some(serde_json::json!({ "content": "hi" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/conversations/m1/open", "recruiter-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["messages"], serde_json::json!([]));

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/conversations/m1/messages",
                "recruiter-1",
                Some(serde_json::json!({ "content": "  Hello there  " })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["content"], "Hello there");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/conversations/m1/messages", "recruiter-1", None))
            .await
            .unwrap();
        let snapshot = json_body(response).await;
        assert_eq!(snapshot["messages"].as_array().map(Vec::len), Some(1));

        // the candidate has never read m1, so the recruiter's message is unread for them
        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/unread?conversation_ids=m1", "candidate-1", None))
            .await
            .unwrap();
        let counts = json_body(response).await;
        assert_eq!(counts["counts"]["m1"], 1);
        assert_eq!(counts["total"], 1);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/conversations/m1/read", "candidate-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/unread?conversation_ids=m1", "candidate-1", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["total"], 0);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/conversations/m1/close", "recruiter-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request("GET", "/api/v1/conversations/m1/messages", "recruiter-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
