// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The internal HTTP server: metrics, liveness and realm status.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

use realm_controller::Controller;
use realm_types::{InstanceKey, RealmId, RealmStatus, SpecHash};

struct HttpState {
    controller: Arc<Controller>,
    registry: Registry,
}

pub fn router(controller: Arc<Controller>, registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/api/livez", get(handle_livez))
        .route("/api/realms", get(handle_realms))
        .route("/api/realms/:realm_id", get(handle_realm))
        .route(
            "/api/realms/:realm_id/instances/:spec_hash/:revision/recycle",
            post(handle_recycle),
        )
        .with_state(Arc::new(HttpState {
            controller,
            registry,
        }))
}

/// An error rendered as a plain text response.
struct HttpError(StatusCode, String);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl HttpError {
    fn internal(e: impl std::fmt::Display) -> HttpError {
        HttpError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<realm_controller::Error> for HttpError {
    fn from(e: realm_controller::Error) -> HttpError {
        HttpError::internal(e)
    }
}

async fn handle_metrics(State(state): State<Arc<HttpState>>) -> Result<String, HttpError> {
    let metric_families = state.registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(HttpError::internal)?;
    String::from_utf8(buffer).map_err(HttpError::internal)
}

async fn handle_livez() -> &'static str {
    "ok"
}

async fn handle_realms(
    State(state): State<Arc<HttpState>>,
) -> Result<Json<Vec<RealmStatus>>, HttpError> {
    Ok(Json(state.controller.statuses().await?))
}

async fn handle_realm(
    State(state): State<Arc<HttpState>>,
    Path(realm_id): Path<String>,
) -> Result<Json<RealmStatus>, HttpError> {
    let realm_id = RealmId::new(realm_id);
    match state.controller.status(&realm_id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(HttpError(
            StatusCode::NOT_FOUND,
            format!("no realm {realm_id}"),
        )),
    }
}

async fn handle_recycle(
    State(state): State<Arc<HttpState>>,
    Path((realm_id, spec_hash, revision)): Path<(String, String, u64)>,
) -> Result<StatusCode, HttpError> {
    let key = InstanceKey::new(RealmId::new(realm_id), SpecHash::new(spec_hash), revision);
    let status = state.controller.status(&key.realm_id).await?;
    let Some(instance) = status.as_ref().and_then(|s| s.instance(&key)) else {
        return Err(HttpError(
            StatusCode::NOT_FOUND,
            format!("no instance {key}"),
        ));
    };
    if instance.is_latest {
        return Err(HttpError(
            StatusCode::CONFLICT,
            format!("instance {key} serves the realm's traffic"),
        ));
    }
    info!(instance = %key, "recycling instance on request");
    state.controller.recycle_now(&key).await;
    Ok(StatusCode::ACCEPTED)
}
