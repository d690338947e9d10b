use crate::api::error::{auth_err, db_err, err, ok};
use crate::api::helpers::required_str;
use crate::api::types::{AppState, Request};
use crate::auth::{self, Role, TokenKind};
use rusqlite::OptionalExtension;
use serde_json::json;

use super::users::load_user;

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing password", None);
    };

    let found: Option<(String, String, String)> = match state
        .db
        .query_row(
            "SELECT id, password_hash, role FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };
    let Some((user_id, password_hash, role)) = found else {
        tracing::info!("login for unknown email");
        return err(
            &req.id,
            "invalid_credentials",
            "User with such credentials not found",
            None,
        );
    };
    if !auth::verify_password(password, &password_hash) {
        tracing::info!(user = %user_id, "login with wrong password");
        return err(&req.id, "invalid_credentials", "Invalid email or password", None);
    }
    let Some(role) = Role::parse(&role) else {
        return err(&req.id, "internal", format!("stored role {role:?} is unknown"), None);
    };

    let tokens = match state.tokens.issue_pair(&user_id, role) {
        Ok(t) => t,
        Err(e) => return auth_err(&req.id, &e),
    };
    let user = match load_user(&state.db, &user_id) {
        Ok(u) => u,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };

    tracing::info!(user = %user_id, "login succeeded");
    ok(
        &req.id,
        json!({
            "message": "Login successful",
            "user": user,
            "accessToken": tokens.access_token,
            "refreshToken": tokens.refresh_token,
        }),
    )
}

fn handle_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let token = req.params.get("refreshToken").and_then(|v| v.as_str());
    let claims = match state.tokens.verify(token, TokenKind::Refresh) {
        Ok(c) => c,
        Err(e) => return auth_err(&req.id, &e),
    };
    match state.tokens.issue_access(&claims.sub, claims.role) {
        Ok(access_token) => ok(&req.id, json!({ "accessToken": access_token })),
        Err(e) => auth_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.refresh" => Some(handle_refresh(state, req)),
        _ => None,
    }
}
