use super::error::{auth_err, err};
use super::handlers;
use super::types::{AppState, Request};
use crate::auth::TokenKind;

/// Methods callable without an access token.
const PUBLIC_METHODS: &[&str] = &[
    "health",
    "auth.login",
    "auth.refresh",
    "users.register",
    "schools.list",
    "schools.get",
    "schools.create",
];

pub fn is_public(method: &str) -> bool {
    PUBLIC_METHODS.contains(&method)
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if !is_public(&req.method) {
        match state.tokens.verify(req.token.as_deref(), TokenKind::Access) {
            Ok(claims) => {
                tracing::debug!(method = %req.method, user = %claims.sub, role = claims.role.as_str(), "authorized");
            }
            Err(e) => {
                tracing::warn!(method = %req.method, error = %e, "rejected request");
                return auth_err(&req.id, &e);
            }
        }
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::schools::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::subjects::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::assessment_types::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::marks::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
