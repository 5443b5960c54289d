use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing;

use crate::server::ApiState;

pub const DEVICE_HEADER: &str = "x-device-id";
pub const DEFAULT_DEVICE: &str = "default";
const MAX_DEVICE_ID_LEN: usize = 64;

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// The signed-in user of one request, scoped to the device it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub device_id: String,
}

/// Extract JWT token from Authorization header
fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

/// Verify JWT token and extract the user id
pub fn verify_token(token: &str, secret: &str) -> Result<String, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) if !token_data.claims.sub.trim().is_empty() => Ok(token_data.claims.sub),
        Ok(_) => {
            tracing::debug!("JWT carries an empty subject");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Device ids end up in file names, so only a conservative alphabet is accepted.
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolve the device id, falling back to the default device when absent.
pub fn resolve_device_id(device_id: Option<&str>) -> Result<String, StatusCode> {
    match device_id.map(str::trim) {
        None | Some("") => Ok(DEFAULT_DEVICE.to_string()),
        Some(id) if is_valid_device_id(id) => Ok(id.to_string()),
        Some(id) => {
            tracing::debug!("Rejected device id {:?}", id);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

fn device_from_headers(headers: &HeaderMap) -> Result<String, StatusCode> {
    let raw = match headers.get(DEVICE_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    resolve_device_id(raw)
}

/// Axum middleware for JWT authentication
pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, StatusCode> {
    // Health is public; WebSocket clients authenticate through the query string
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws") {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match extract_token(auth_header) {
        Some(t) => t,
        None => {
            tracing::debug!("Missing Authorization header");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let state = req
        .extensions()
        .get::<ApiState>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let user_id = verify_token(&token, &state.ctx.config.server.jwt_secret)?;
    let device_id = device_from_headers(req.headers())?;

    tracing::debug!("Authenticated user: {} on device {}", user_id, device_id);

    req.extensions_mut().insert(AuthenticatedUser { user_id, device_id });

    Ok(next.run(req).await)
}
