//! HTTP control API.
//!
//! | Method, path                       | Operation                     |
//! |------------------------------------|-------------------------------|
//! | `GET    /api/1/`                   | list VM names                 |
//! | `GET    /api/1/{name}`             | `{state, config}`             |
//! | `POST   /api/1/{name}`             | create                        |
//! | `PUT    /api/1/{name}`             | update (stopped VMs only)     |
//! | `DELETE /api/1/{name}`             | delete (stopped VMs only)     |
//! | `POST   /api/1/{name}/{action}`    | `start` / `stop`              |
//! | `GET    /api/1/{name}/console`     | upgrade to a raw console pipe |
//! | `CONNECT /api/1/{name}`            | same, for older clients       |
//!
//! The console endpoint answers `101 Switching Protocols` to a request
//! carrying `Upgrade: console`; after that the connection carries raw
//! console bytes in both directions. `CONNECT /api/1/{name}` is the older
//! form of the same tunnel: it needs no `Upgrade` header and answers
//! `200 OK` before the raw bytes start.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::console::ConsoleTunnel;
use crate::error::RegistryError;
use crate::registry::{PowerAction, Registry};
use crate::vm::{VmConfigPatch, VmStatus};

/// Protocol token expected in the `Upgrade` header of console requests.
pub const CONSOLE_PROTOCOL: &str = "console";

/// Build the API router over a shared registry.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/api/1/", get(list_vms))
        .route(
            "/api/1/{name}",
            get(get_vm)
                .post(create_vm)
                .put(update_vm)
                .delete(delete_vm)
                .connect(console),
        )
        .route("/api/1/{name}/console", get(console))
        .route("/api/1/{name}/{action}", post(power_action))
        .with_state(registry)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn upgrade_required() -> Self {
        Self::new(
            StatusCode::UPGRADE_REQUIRED,
            "upgrade_required",
            format!("console requests must carry 'Upgrade: {CONSOLE_PROTOCOL}'"),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::Conflict { .. } => StatusCode::CONFLICT,
            RegistryError::InvalidName { .. } | RegistryError::InvalidState { .. } => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::ConnectError { .. } => StatusCode::BAD_GATEWAY,
            RegistryError::Persistence { .. }
            | RegistryError::LoadCorruption { .. }
            | RegistryError::Exhausted { .. }
            | RegistryError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Parse a create/update body. An empty body is an empty patch.
fn parse_patch(body: &Bytes) -> Result<VmConfigPatch, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VmConfigPatch::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/1/
async fn list_vms(State(registry): State<Arc<Registry>>) -> Json<Vec<String>> {
    Json(registry.list().await)
}

/// GET /api/1/{name}
#[instrument(skip(registry), level = "debug")]
async fn get_vm(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<Json<VmStatus>, ApiError> {
    Ok(Json(registry.status(&name).await?))
}

/// POST /api/1/{name}
#[instrument(skip(registry, body), level = "info")]
async fn create_vm(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<VmStatus>, ApiError> {
    let patch = parse_patch(&body)?;
    Ok(Json(registry.create(&name, &patch).await?))
}

/// PUT /api/1/{name}
#[instrument(skip(registry, body), level = "info")]
async fn update_vm(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<VmStatus>, ApiError> {
    let patch = parse_patch(&body)?;
    Ok(Json(registry.update(&name, &patch).await?))
}

/// DELETE /api/1/{name}
#[instrument(skip(registry), level = "info")]
async fn delete_vm(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/1/{name}/{action}
#[instrument(skip(registry), level = "info")]
async fn power_action(
    State(registry): State<Arc<Registry>>,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<VmStatus>, ApiError> {
    let action: PowerAction = action.parse().map_err(ApiError::bad_request)?;
    Ok(Json(registry.set_power(&name, action).await?))
}

/// GET /api/1/{name}/console, CONNECT /api/1/{name}
///
/// Every precondition is checked and the console socket is connected before
/// the success status goes out, so failures still get a normal error
/// response.
#[instrument(skip(registry, request), level = "info")]
async fn console(
    State(registry): State<Arc<Registry>>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let vm = registry.get(&name).await?;

    let connect = request.method() == Method::CONNECT;
    let wants_console = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(CONSOLE_PROTOCOL));
    if !connect && !wants_console {
        return Err(ApiError::upgrade_required());
    }

    let tunnel = ConsoleTunnel::open(vm.as_ref()).await?;
    let on_upgrade = hyper::upgrade::on(request);

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                info!(vm = %name, port = tunnel.port(), "console attached");
                tunnel.run(TokioIo::new(upgraded)).await;
            }
            Err(e) => warn!(vm = %name, error = %e, "console upgrade failed"),
        }
    });

    if connect {
        return Ok(StatusCode::OK.into_response());
    }
    Ok((
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::CONNECTION, "upgrade"),
            (header::UPGRADE, CONSOLE_PROTOCOL),
        ],
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_status_codes() {
        let cases = [
            (RegistryError::NotFound { name: "x".into() }, StatusCode::NOT_FOUND),
            (RegistryError::Conflict { name: "x".into() }, StatusCode::CONFLICT),
            (
                RegistryError::InvalidName {
                    name: "../x".into(),
                    reason: "only letters, digits, '.', '_' and '-' are allowed",
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                RegistryError::InvalidState {
                    name: "x".into(),
                    operation: "modify",
                    state: "RUNNING".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                RegistryError::Unavailable {
                    name: "x".into(),
                    state: "STOPPED".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RegistryError::ConnectError {
                    name: "x".into(),
                    port: 3001,
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn empty_body_is_an_empty_patch() {
        assert_eq!(parse_patch(&Bytes::new()).unwrap(), VmConfigPatch::default());
        assert_eq!(
            parse_patch(&Bytes::from_static(b" \n")).unwrap(),
            VmConfigPatch::default()
        );
    }

    #[test]
    fn malformed_body_is_a_bad_request() {
        let err = parse_patch(&Bytes::from_static(b"{memory:")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = parse_patch(&Bytes::from_static(br#"{"memory": "lots"}"#)).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
