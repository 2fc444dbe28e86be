use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use constant_time_eq::constant_time_eq;

use crate::errors::AppError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests that do not carry the configured API key. When no key
/// is configured the server runs open and every request passes through.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing API key"))?;

    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(AppError::unauthorized("invalid API key"));
    }

    Ok(next.run(request).await)
}
