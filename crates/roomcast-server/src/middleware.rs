use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use roomcast_rooms::{find_user_by_token, RoomError, User};
use std::sync::Arc;

use crate::AppState;

/// The authenticated user, stored in request extensions.
#[derive(Clone, Debug)]
pub struct IdentityContext(pub User);

/// Pulls the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Looks up the active user holding `token`.
///
/// Any lookup failure other than a database fault is `401`.
pub async fn resolve_identity(state: &AppState, token: String) -> Result<User, StatusCode> {
    let pool = state.pool.clone();
    let user = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        match find_user_by_token(&conn, &token) {
            Ok(user) => Ok(user),
            Err(RoomError::NotFound(_)) => Err(StatusCode::UNAUTHORIZED),
            Err(e) => {
                tracing::error!(error = %e, "token lookup failed");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    if !user.is_active {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(user)
}

/// Middleware to authenticate requests via `Authorization: Bearer`.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let user = resolve_identity(&state, token).await?;
    req.extensions_mut().insert(IdentityContext(user));

    Ok(next.run(req).await)
}
