use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::control::Controller;
use crate::error::ControlError;
use crate::state::{Mode, PumpState};

/// Message returned for every rejected pump request.
const INVALID_ACTION: &str = "Invalid action";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DataResponse {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_percent: Option<f64>,
    pub pump: PumpState,
    pub mode: Mode,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum PumpRequest {
    Toggle,
    SetMode { mode: String },
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/api/data", get(api_data))
        .route("/api/pump", post(api_pump))
        .route("/api/status", get(api_status))
        .with_state(controller)
}

async fn api_data(State(controller): State<Controller>) -> Json<DataResponse> {
    let snap = controller.state().snapshot().await;
    Json(DataResponse {
        temperature: snap.reading.temperature,
        humidity: snap.reading.humidity,
        soil_percent: snap.reading.soil_percent,
        pump: snap.pump_state,
        mode: snap.mode,
    })
}

async fn api_status(State(controller): State<Controller>) -> impl IntoResponse {
    Json(controller.state().status().await)
}

async fn api_pump(State(controller): State<Controller>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<PumpRequest>(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("rejected pump request body: {e}");
            return rejection(StatusCode::BAD_REQUEST, INVALID_ACTION);
        }
    };

    match request {
        PumpRequest::Toggle => match controller.toggle().await {
            Ok((pump, mode)) => Json(json!({ "status": "ok", "pump": pump, "mode": mode }))
                .into_response(),
            Err(e) => control_error(e),
        },
        PumpRequest::SetMode { mode } => match controller.set_mode(&mode).await {
            Ok(change) => Json(json!({ "status": "ok", "mode": change.mode })).into_response(),
            Err(e) => control_error(e),
        },
    }
}

fn control_error(e: ControlError) -> Response {
    if e.is_rejection() {
        rejection(StatusCode::BAD_REQUEST, INVALID_ACTION)
    } else {
        rejection(StatusCode::BAD_GATEWAY, &e.to_string())
    }
}

fn rejection(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(controller: Controller, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(controller))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
