//! deskplane-api — REST API for DeskPlane.
//!
//! Provides axum route handlers over the orchestration surface: instance
//! lifecycle, capacity registration, IP pools, and quotas.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | List instances (optional `?tenant=`) |
//! | POST | `/api/v1/instances` | Create an instance (stopped) |
//! | GET | `/api/v1/instances/{id}` | Get instance details |
//! | POST | `/api/v1/instances/{id}/start` | Start (place + provision) |
//! | POST | `/api/v1/instances/{id}/stop` | Stop (release resources) |
//! | DELETE | `/api/v1/instances/{id}` | Soft-delete |
//! | POST | `/api/v1/datacenters` | Register a datacenter |
//! | POST | `/api/v1/pools` | Register a resource pool |
//! | POST | `/api/v1/pools/{id}/hosts` | Register a host |
//! | GET | `/api/v1/pools/{id}/hosts` | List hosts in a pool |
//! | POST | `/api/v1/pools/{id}/hosts/{host_id}/status` | Change host status |
//! | POST | `/api/v1/pools/{id}/reconcile` | Reconcile aggregates |
//! | POST | `/api/v1/ip-pools` | Create an IP pool from a CIDR |
//! | GET | `/api/v1/ip-pools` | List IP pools |
//! | GET | `/api/v1/ip-pools/{id}/stats` | Pool occupancy counters |
//! | POST | `/api/v1/ip-pools/{id}/allocate` | Allocate address(es) |
//! | POST | `/api/v1/ip-pools/{id}/release` | Release an address/range |
//! | POST | `/api/v1/ip-pools/{id}/reserve` | Reserve an address |
//! | POST | `/api/v1/ip-pools/{id}/freeze` | Freeze an address |
//! | POST | `/api/v1/ip-pools/{id}/unfreeze` | Unfreeze an address |
//! | GET | `/api/v1/quotas/{scope}/{subject}` | Get a quota config |
//! | PUT | `/api/v1/quotas/{scope}/{subject}` | Set a quota config |
//! | GET | `/api/v1/quotas/{scope}/{subject}/usage` | Usage vs caps |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use deskplane_ipam::IpAllocator;
use deskplane_orchestrator::InstanceLifecycleManager;
use deskplane_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub manager: Arc<InstanceLifecycleManager>,
    pub ipam: Arc<IpAllocator>,
}

/// Build the complete API router.
pub fn build_router(
    store: StateStore,
    manager: Arc<InstanceLifecycleManager>,
    ipam: Arc<IpAllocator>,
) -> Router {
    let state = ApiState {
        store,
        manager,
        ipam,
    };

    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{id}/start", post(handlers::start_instance))
        .route("/instances/{id}/stop", post(handlers::stop_instance))
        .route("/datacenters", post(handlers::register_datacenter))
        .route("/pools", post(handlers::register_pool))
        .route(
            "/pools/{id}/hosts",
            get(handlers::list_hosts).post(handlers::register_host),
        )
        .route(
            "/pools/{id}/hosts/{host_id}/status",
            post(handlers::set_host_status),
        )
        .route("/pools/{id}/reconcile", post(handlers::reconcile_pool))
        .route(
            "/ip-pools",
            get(handlers::list_ip_pools).post(handlers::create_ip_pool),
        )
        .route("/ip-pools/{id}/stats", get(handlers::ip_pool_stats))
        .route("/ip-pools/{id}/allocate", post(handlers::allocate_ip))
        .route("/ip-pools/{id}/release", post(handlers::release_ip))
        .route("/ip-pools/{id}/reserve", post(handlers::reserve_ip))
        .route("/ip-pools/{id}/freeze", post(handlers::freeze_ip))
        .route("/ip-pools/{id}/unfreeze", post(handlers::unfreeze_ip))
        .route(
            "/quotas/{scope}/{subject}",
            get(handlers::get_quota).put(handlers::set_quota),
        )
        .route("/quotas/{scope}/{subject}/usage", get(handlers::quota_usage))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
