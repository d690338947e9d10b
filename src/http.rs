use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::api::{self, AppState, Request};

pub type SharedState = Arc<Mutex<AppState>>;

/// HTTP status for an envelope error code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "bad_params" | "bad_json" | "conflict" | "invalid_credentials" | "invalid_input"
        | "invalid_reference" | "invalid_student" | "no_data" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "not_found" | "not_implemented" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn success_status(method: &str) -> StatusCode {
    if method.ends_with(".create") || method.ends_with(".register") {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn error_response(code: &str, message: impl Into<String>) -> Response {
    (
        status_for(code),
        Json(json!({ "error": { "code": code, "message": message.into() } })),
    )
        .into_response()
}

/// Turns a dispatch envelope into an HTTP response: the bare `result` on
/// success, `{ "error": ... }` otherwise.
fn envelope_response(method: &str, mut envelope: serde_json::Value) -> Response {
    if envelope["ok"].as_bool() == Some(true) {
        let result = envelope["result"].take();
        return (success_status(method), Json(result)).into_response();
    }
    let error = envelope["error"].take();
    let code = error["code"].as_str().unwrap_or("internal");
    (status_for(code), Json(json!({ "error": error }))).into_response()
}

async fn dispatch(
    app: SharedState,
    method: &'static str,
    path_param: Option<(&'static str, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut params = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(v) => v,
            Err(e) => return error_response("bad_json", e.to_string()),
        }
    };
    let Some(map) = params.as_object_mut() else {
        return error_response("bad_params", "request body must be a JSON object");
    };
    if let Some((key, value)) = path_param {
        map.insert(key.to_string(), serde_json::Value::String(value));
    }

    let req = Request {
        id: Uuid::new_v4().to_string(),
        method: method.to_string(),
        params,
        token: bearer_token(&headers),
    };
    let request_id = req.id.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut state = app.lock().unwrap_or_else(PoisonError::into_inner);
        api::handle_request(&mut state, req)
    })
    .await;

    match joined {
        Ok(envelope) => {
            let resp = envelope_response(method, envelope);
            tracing::debug!(request = %request_id, method, status = resp.status().as_u16(), "handled");
            resp
        }
        Err(e) => {
            tracing::error!(request = %request_id, method, error = %e, "handler task failed");
            error_response("internal", "handler task failed")
        }
    }
}

macro_rules! plain {
    ($method:literal) => {
        |State(app): State<SharedState>, headers: HeaderMap, body: Bytes| async move {
            dispatch(app, $method, None, headers, body).await
        }
    };
}

macro_rules! with_path {
    ($method:literal, $key:literal) => {
        |State(app): State<SharedState>,
         Path(value): Path<String>,
         headers: HeaderMap,
         body: Bytes| async move {
            dispatch(app, $method, Some(($key, value)), headers, body).await
        }
    };
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(plain!("health")))
        .route("/auth/login", post(plain!("auth.login")))
        .route("/auth/access_token", post(plain!("auth.refresh")))
        .route("/users/register", post(plain!("users.register")))
        .route("/users", get(plain!("users.list")))
        .route(
            "/users/:id",
            get(with_path!("users.get", "id"))
                .put(with_path!("users.update", "id"))
                .delete(with_path!("users.delete", "id")),
        )
        .route("/all-schools", get(plain!("schools.list")))
        .route("/schools/create", post(plain!("schools.create")))
        .route(
            "/schools/:id",
            get(with_path!("schools.get", "id"))
                .put(with_path!("schools.update", "id"))
                .delete(with_path!("schools.delete", "id")),
        )
        .route(
            "/subjects",
            post(plain!("subjects.create")).get(plain!("subjects.list")),
        )
        .route(
            "/subjects/:id",
            get(with_path!("subjects.get", "id"))
                .put(with_path!("subjects.update", "id"))
                .delete(with_path!("subjects.delete", "id")),
        )
        .route(
            "/classes",
            post(plain!("classes.create")).get(plain!("classes.list")),
        )
        .route(
            "/classes/:id",
            get(with_path!("classes.get", "id"))
                .put(with_path!("classes.update", "id"))
                .delete(with_path!("classes.delete", "id")),
        )
        .route("/assessments", post(plain!("assessmentTypes.create")))
        .route("/assessment-types", get(plain!("assessmentTypes.list")))
        .route(
            "/assessment-types/:id",
            put(with_path!("assessmentTypes.update", "id"))
                .delete(with_path!("assessmentTypes.delete", "id")),
        )
        .route(
            "/marks",
            post(plain!("marks.create")).get(plain!("marks.list")),
        )
        // GET takes a student id, PUT/DELETE a mark id.
        .route(
            "/marks/:id",
            get(with_path!("marks.forStudent", "studentId"))
                .put(with_path!("marks.update", "id"))
                .delete(with_path!("marks.delete", "id")),
        )
        .route("/student-report", post(plain!("reports.generate")))
        .route(
            "/reports/:studentId",
            get(with_path!("reports.forStudent", "studentId")),
        )
        .fallback(|| async { error_response("not_found", "no such route") })
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(Arc::new(Mutex::new(state)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("http server error")?;
    Ok(())
}
