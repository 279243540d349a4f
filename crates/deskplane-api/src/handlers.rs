//! REST API handlers.
//!
//! Each handler delegates to the lifecycle manager (instances, quotas,
//! quota-checked address allocation), the IP allocator (pool management),
//! or the scheduler's accountant (capacity registration), and returns
//! JSON responses with the error taxonomy mapped onto HTTP status codes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use deskplane_ipam::{AllocationRequest, IpPoolConfig, IpamError};
use deskplane_orchestrator::{CreateInstanceRequest, OrchestratorError};
use deskplane_quota::QuotaError;
use deskplane_scheduler::{SchedulerError, accountant};
use deskplane_state::{
    AllocationStrategy, Capacity, Host, HostStatus, QuotaConfig, QuotaScope, RentalMode,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

// ── Error taxonomy → HTTP status ───────────────────────────────────

fn scheduler_status(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::PoolNotFound(_)
        | SchedulerError::DatacenterNotFound(_)
        | SchedulerError::HostNotFound(_)
        | SchedulerError::VmNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ipam_status(e: &IpamError) -> StatusCode {
    match e {
        IpamError::PoolNotFound(_) | IpamError::AddressNotFound(_) => StatusCode::NOT_FOUND,
        IpamError::InvalidCidr(_) | IpamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        IpamError::InvalidState { .. } => StatusCode::CONFLICT,
        IpamError::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        IpamError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn orchestrator_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidState { .. } | OrchestratorError::Conflict(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Quota(QuotaError::Exceeded { .. }) => StatusCode::FORBIDDEN,
        OrchestratorError::Quota(QuotaError::State(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        OrchestratorError::Scheduler(e) => scheduler_status(e),
        OrchestratorError::Ipam(e) => ipam_status(e),
        OrchestratorError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn orchestrator_error(e: &OrchestratorError) -> axum::response::Response {
    error_response(&e.to_string(), orchestrator_status(e))
}

fn parse_scope(scope: &str) -> Result<QuotaScope, axum::response::Response> {
    match scope {
        "tenant" => Ok(QuotaScope::Tenant),
        "user" => Ok(QuotaScope::User),
        other => Err(error_response(
            &format!("unknown quota scope: {other}"),
            StatusCode::BAD_REQUEST,
        )),
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// GET /api/v1/instances?tenant=...
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match state.manager.list_instances(params.get("tenant").map(String::as_str)) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(req): Json<CreateInstanceRequest>,
) -> impl IntoResponse {
    match state.manager.create(req).await {
        Ok(instance) => (StatusCode::CREATED, ApiResponse::ok(instance)).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// GET /api/v1/instances/:id
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_instance(&id) {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// Start request body.
#[derive(serde::Deserialize, Default)]
pub struct StartRequest {
    pub resource_pool_id: Option<String>,
    pub rental_mode: Option<RentalMode>,
}

/// POST /api/v1/instances/:id/start
pub async fn start_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .start(&id, req.resource_pool_id.as_deref(), req.rental_mode)
        .await
    {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// POST /api/v1/instances/:id/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.stop(&id).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// DELETE /api/v1/instances/:id
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.delete(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

// ── Capacity registration ──────────────────────────────────────────

/// Datacenter registration body.
#[derive(serde::Deserialize)]
pub struct RegisterDatacenterRequest {
    pub id: String,
    pub name: String,
}

/// POST /api/v1/datacenters
pub async fn register_datacenter(
    State(state): State<ApiState>,
    Json(req): Json<RegisterDatacenterRequest>,
) -> impl IntoResponse {
    match accountant::register_datacenter(&state.store, &req.id, &req.name) {
        Ok(dc) => (StatusCode::CREATED, ApiResponse::ok(dc)).into_response(),
        Err(e) => error_response(&e.to_string(), scheduler_status(&e)),
    }
}

/// Pool registration body.
#[derive(serde::Deserialize)]
pub struct RegisterPoolRequest {
    pub id: String,
    pub datacenter_id: String,
    pub name: String,
    pub ip_pool_id: Option<String>,
}

/// POST /api/v1/pools
pub async fn register_pool(
    State(state): State<ApiState>,
    Json(req): Json<RegisterPoolRequest>,
) -> impl IntoResponse {
    match accountant::register_pool(
        &state.store,
        &req.id,
        &req.datacenter_id,
        &req.name,
        req.ip_pool_id,
    ) {
        Ok(pool) => (StatusCode::CREATED, ApiResponse::ok(pool)).into_response(),
        Err(e) => error_response(&e.to_string(), scheduler_status(&e)),
    }
}

/// Host registration body.
#[derive(serde::Deserialize)]
pub struct RegisterHostRequest {
    pub id: String,
    pub rental_mode: RentalMode,
    pub capacity: Capacity,
}

/// POST /api/v1/pools/:id/hosts
pub async fn register_host(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<RegisterHostRequest>,
) -> impl IntoResponse {
    let host = Host {
        id: req.id,
        pool_id,
        rental_mode: req.rental_mode,
        status: HostStatus::Active,
        capacity: req.capacity,
        allocated: Capacity::default(),
    };
    match accountant::register_host(&state.store, host) {
        Ok(host) => (StatusCode::CREATED, ApiResponse::ok(host)).into_response(),
        Err(e) => error_response(&e.to_string(), scheduler_status(&e)),
    }
}

/// GET /api/v1/pools/:id/hosts
pub async fn list_hosts(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_hosts_in_pool(&pool_id) {
        Ok(hosts) => ApiResponse::ok(hosts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Host status body.
#[derive(serde::Deserialize)]
pub struct HostStatusRequest {
    pub status: HostStatus,
}

/// POST /api/v1/pools/:id/hosts/:host_id/status
pub async fn set_host_status(
    State(state): State<ApiState>,
    Path((pool_id, host_id)): Path<(String, String)>,
    Json(req): Json<HostStatusRequest>,
) -> impl IntoResponse {
    match accountant::set_host_status(&state.store, &pool_id, &host_id, req.status) {
        Ok(host) => ApiResponse::ok(host).into_response(),
        Err(e) => error_response(&e.to_string(), scheduler_status(&e)),
    }
}

/// POST /api/v1/pools/:id/reconcile
pub async fn reconcile_pool(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
) -> impl IntoResponse {
    match deskplane_scheduler::reconcile_pool(&state.store, &pool_id) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => error_response(&e.to_string(), scheduler_status(&e)),
    }
}

// ── IP pools ───────────────────────────────────────────────────────

/// IP pool creation body.
#[derive(serde::Deserialize)]
pub struct CreateIpPoolRequest {
    pub name: String,
    pub cidr: String,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub reserved: Vec<Ipv4Addr>,
    pub strategy: AllocationStrategy,
    #[serde(default)]
    pub allow_range: bool,
}

/// POST /api/v1/ip-pools
pub async fn create_ip_pool(
    State(state): State<ApiState>,
    Json(req): Json<CreateIpPoolRequest>,
) -> impl IntoResponse {
    let config = IpPoolConfig {
        name: req.name,
        cidr: req.cidr,
        gateway: req.gateway,
        reserved: req.reserved,
        strategy: req.strategy,
        allow_range: req.allow_range,
    };
    match state.ipam.create_pool(config).await {
        Ok(pool) => (StatusCode::CREATED, ApiResponse::ok(pool)).into_response(),
        Err(e) => error_response(&e.to_string(), ipam_status(&e)),
    }
}

/// GET /api/v1/ip-pools
pub async fn list_ip_pools(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_ip_pools() {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/ip-pools/:id/stats
pub async fn ip_pool_stats(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
) -> impl IntoResponse {
    match state.ipam.pool_stats(&pool_id).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => error_response(&e.to_string(), ipam_status(&e)),
    }
}

/// Allocation body: `type` selects the mode.
#[derive(serde::Deserialize)]
pub struct AllocateIpRequest {
    pub instance_id: String,
    #[serde(flatten)]
    pub kind: AllocationKind,
}

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationKind {
    Specified { address: Ipv4Addr },
    Auto,
    Range { size: u16 },
}

impl From<AllocationKind> for AllocationRequest {
    fn from(kind: AllocationKind) -> Self {
        match kind {
            AllocationKind::Specified { address } => AllocationRequest::Specified { address },
            AllocationKind::Auto => AllocationRequest::Auto,
            AllocationKind::Range { size } => AllocationRequest::Range { size },
        }
    }
}

/// POST /api/v1/ip-pools/:id/allocate
pub async fn allocate_ip(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<AllocateIpRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .allocate_ip(&pool_id, &req.instance_id, req.kind.into())
        .await
    {
        Ok(rows) => (StatusCode::CREATED, ApiResponse::ok(rows)).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// Single-address body for release/reserve/freeze/unfreeze.
#[derive(serde::Deserialize)]
pub struct AddressRequest {
    pub address: Ipv4Addr,
}

/// POST /api/v1/ip-pools/:id/release
pub async fn release_ip(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> impl IntoResponse {
    match state.manager.release_ip(&pool_id, req.address).await {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

/// POST /api/v1/ip-pools/:id/reserve
pub async fn reserve_ip(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> impl IntoResponse {
    match state.ipam.reserve(&pool_id, req.address).await {
        Ok(row) => ApiResponse::ok(row).into_response(),
        Err(e) => error_response(&e.to_string(), ipam_status(&e)),
    }
}

/// POST /api/v1/ip-pools/:id/freeze
pub async fn freeze_ip(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> impl IntoResponse {
    match state.ipam.freeze(&pool_id, req.address).await {
        Ok(row) => ApiResponse::ok(row).into_response(),
        Err(e) => error_response(&e.to_string(), ipam_status(&e)),
    }
}

/// POST /api/v1/ip-pools/:id/unfreeze
pub async fn unfreeze_ip(
    State(state): State<ApiState>,
    Path(pool_id): Path<String>,
    Json(req): Json<AddressRequest>,
) -> impl IntoResponse {
    match state.ipam.unfreeze(&pool_id, req.address).await {
        Ok(row) => ApiResponse::ok(row).into_response(),
        Err(e) => error_response(&e.to_string(), ipam_status(&e)),
    }
}

// ── Quotas ─────────────────────────────────────────────────────────

/// PUT /api/v1/quotas/:scope/:subject
pub async fn set_quota(
    State(state): State<ApiState>,
    Path((scope, subject)): Path<(String, String)>,
    Json(config): Json<QuotaConfig>,
) -> impl IntoResponse {
    let scope = match parse_scope(&scope) {
        Ok(scope) => scope,
        Err(response) => return response,
    };
    match state.store.put_quota(scope, &subject, &config) {
        Ok(()) => ApiResponse::ok(config).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/quotas/:scope/:subject
pub async fn get_quota(
    State(state): State<ApiState>,
    Path((scope, subject)): Path<(String, String)>,
) -> impl IntoResponse {
    let scope = match parse_scope(&scope) {
        Ok(scope) => scope,
        Err(response) => return response,
    };
    match state.store.get_quota(scope, &subject) {
        Ok(Some(config)) => ApiResponse::ok(config).into_response(),
        Ok(None) => error_response("no quota configured", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/quotas/:scope/:subject/usage
pub async fn quota_usage(
    State(state): State<ApiState>,
    Path((scope, subject)): Path<(String, String)>,
) -> impl IntoResponse {
    let scope = match parse_scope(&scope) {
        Ok(scope) => scope,
        Err(response) => return response,
    };
    match state.manager.quota_usage(scope, &subject) {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}
