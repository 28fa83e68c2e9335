//! REST API handlers

use axon_bus::SearchError;
use axon_core::RegNum;
use axon_discovery::RegistryError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn master_not_found(id: u32) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Bus master {} not found", id))
}

fn registry_error(e: RegistryError) -> Response {
    let status = match &e {
        RegistryError::NotFound(_) | RegistryError::UnknownMaster(_) => StatusCode::NOT_FOUND,
        RegistryError::DuplicateAttach(_) | RegistryError::DuplicateFamily(_) => StatusCode::CONFLICT,
        RegistryError::ChecksumMismatch(_) | RegistryError::InvalidId(_) => StatusCode::BAD_REQUEST,
        RegistryError::FamilyHook { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::NoPresence | RegistryError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::UnknownFamily(_) => StatusCode::NOT_FOUND,
        RegistryError::Allocation => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn search_error(e: SearchError) -> Response {
    let status = match &e {
        SearchError::Cancelled => StatusCode::CONFLICT,
        SearchError::NoResponse { .. } | SearchError::Transport(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(status, format!("Search failed: {}", e))
}

fn parse_reg_num(text: &str) -> Result<RegNum, Response> {
    text.parse()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("{}", e)))
}

/// List all bus masters
pub async fn list_masters(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.master_infos().await)
}

/// Get a specific bus master
pub async fn get_master(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    match state.master(id).await {
        Some(master) => Json(master.info().await).into_response(),
        None => master_not_found(id),
    }
}

/// Unregister a bus master and detach its slaves
pub async fn remove_master(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    info!(master = id, "Remove bus master requested");

    match state.registry.remove_master(id).await {
        Ok(()) => Json(serde_json::json!({
            "status": "removed",
            "master": id
        }))
        .into_response(),
        Err(e) => registry_error(e),
    }
}

/// List slaves attached to a master
pub async fn list_slaves(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    match state.master(id).await {
        Some(master) => Json(master.slaves().await).into_response(),
        None => master_not_found(id),
    }
}

/// Slave lookup across all masters
#[derive(Serialize)]
pub struct SlaveView {
    pub id: String,
    pub master: u32,
    pub family: String,
    pub refs: usize,
    pub attached_at: chrono::DateTime<chrono::Utc>,
}

/// Find a slave on any master
pub async fn get_slave(
    State(state): State<Arc<AppState>>,
    Path(slave): Path<String>,
) -> impl IntoResponse {
    let rn = match parse_reg_num(&slave) {
        Ok(rn) => rn,
        Err(resp) => return resp,
    };

    match state.registry.find_slave(rn).await {
        Ok(slave) => Json(SlaveView {
            id: slave.name(),
            master: slave.master_id(),
            family: slave.family().name().to_string(),
            // Exclude the reference held by this request
            refs: slave.refs().saturating_sub(1),
            attached_at: slave.attached_at(),
        })
        .into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Deserialize)]
pub struct CadenceRequest {
    pub cadence_ms: u64,
}

/// Set the background search cadence
pub async fn set_search_cadence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(req): Json<CadenceRequest>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };
    master.set_search_cadence(req.cadence_ms).await;
    Json(serde_json::json!({
        "status": "updated",
        "search_cadence_ms": req.cadence_ms
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct PullupRequest {
    pub enabled: bool,
}

/// Enable or disable the strong pullup
pub async fn set_pullup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(req): Json<PullupRequest>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };
    master.set_pullup(req.enabled).await;
    Json(serde_json::json!({
        "status": "updated",
        "enable_pullup": req.enabled
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct SlaveRequest {
    /// Registration number in `ff-dddddddddddd` form
    pub id: String,
}

/// Attach a slave by hand
pub async fn add_slave(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(req): Json<SlaveRequest>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };

    match master.add_slave_str(&req.id).await {
        Ok(rn) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "added",
                "slave": rn.name()
            })),
        )
            .into_response(),
        Err(e) => registry_error(e),
    }
}

/// Detach a slave by hand
pub async fn remove_slave(
    State(state): State<Arc<AppState>>,
    Path((id, slave)): Path<(u32, String)>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };

    match master.remove_slave_str(&slave).await {
        Ok(rn) => Json(serde_json::json!({
            "status": "removed",
            "slave": rn.name()
        }))
        .into_response(),
        Err(e) => registry_error(e),
    }
}

/// Run a sweep now
pub async fn trigger_search(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };

    info!(master = id, "Manual search triggered");
    match master.search_and_reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => search_error(e),
    }
}

#[derive(Deserialize, Default)]
pub struct VerifyRequest {
    /// Registration number that must be on the bus; omit for a presence check
    #[serde(default)]
    pub expected: Option<String>,
}

/// Presence check, or identity verification against `expected`
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    body: Option<Json<VerifyRequest>>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let result = match req.expected {
        Some(text) => {
            let rn = match parse_reg_num(&text) {
                Ok(rn) => rn,
                Err(resp) => return resp,
            };
            master.verify_identity(rn).await
        }
        None => master.check_presence().await,
    };

    match result {
        Ok(present) => Json(serde_json::json!({ "present": present })).into_response(),
        Err(e) => search_error(e),
    }
}

/// Devices signalling an alarm
pub async fn alarm_search(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };

    match master.alarm_search().await {
        Ok(found) => {
            let names: Vec<String> = found.iter().map(|rn| rn.name()).collect();
            Json(names).into_response()
        }
        Err(e) => search_error(e),
    }
}

#[derive(Deserialize)]
pub struct WriteRequest {
    pub data: Vec<u8>,
}

/// Send bytes to one device
pub async fn write_slave(
    State(state): State<Arc<AppState>>,
    Path((id, slave)): Path<(u32, String)>,
    Json(req): Json<WriteRequest>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };
    let rn = match parse_reg_num(&slave) {
        Ok(rn) => rn,
        Err(resp) => return resp,
    };

    match master.write_slave(rn, &req.data).await {
        Ok(()) => Json(serde_json::json!({
            "status": "written",
            "bytes": req.data.len()
        }))
        .into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Deserialize)]
pub struct ReadRequest {
    pub len: usize,
}

/// Read bytes from one device
pub async fn read_slave(
    State(state): State<Arc<AppState>>,
    Path((id, slave)): Path<(u32, String)>,
    Json(req): Json<ReadRequest>,
) -> impl IntoResponse {
    let Some(master) = state.master(id).await else {
        return master_not_found(id);
    };
    let rn = match parse_reg_num(&slave) {
        Ok(rn) => rn,
        Err(resp) => return resp,
    };

    match master.read_slave(rn, req.len).await {
        Ok(data) => Json(serde_json::json!({ "data": data })).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Serialize)]
pub struct FamilyView {
    pub code: String,
    pub name: String,
    pub users: usize,
}

/// Registered families
pub async fn list_families(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let families = state.registry.families();
    let views: Vec<FamilyView> = families
        .codes()
        .into_iter()
        .filter_map(|code| families.get(code))
        .map(|family| FamilyView {
            code: format!("{:02x}", family.fid()),
            name: family.name().to_string(),
            users: family.users(),
        })
        .collect();
    Json(views)
}

/// Pause every scheduler
pub async fn suspend(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.registry.suspend().await;
    Json(serde_json::json!({ "status": "suspended" }))
}

/// Restart every scheduler with identity re-verification
pub async fn resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.registry.resume().await;
    Json(serde_json::json!({ "status": "resumed" }))
}

#[derive(Deserialize)]
pub struct PlugRequest {
    pub id: String,
    #[serde(default)]
    pub alarm: bool,
}

/// Plug a device into a master's simulated bus
pub async fn plug_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(req): Json<PlugRequest>,
) -> impl IntoResponse {
    let Some(bus) = state.bus(id).await else {
        return master_not_found(id);
    };
    let rn = match parse_reg_num(&req.id) {
        Ok(rn) => rn,
        Err(resp) => return resp,
    };

    bus.add_device(rn);
    bus.set_alarm(rn, req.alarm);
    info!(master = id, device = %rn, "Device plugged into simulated bus");
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "plugged",
            "device": rn.name()
        })),
    )
        .into_response()
}

/// Unplug a device from a master's simulated bus
pub async fn unplug_device(
    State(state): State<Arc<AppState>>,
    Path((id, device)): Path<(u32, String)>,
) -> impl IntoResponse {
    let Some(bus) = state.bus(id).await else {
        return master_not_found(id);
    };
    let rn = match parse_reg_num(&device) {
        Ok(rn) => rn,
        Err(resp) => return resp,
    };

    if bus.remove_device(rn) {
        info!(master = id, device = %rn, "Device unplugged from simulated bus");
        Json(serde_json::json!({
            "status": "unplugged",
            "device": rn.name()
        }))
        .into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "Device not on bus")
    }
}
