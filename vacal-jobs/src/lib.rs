//! vacal-jobs library interface
//!
//! Job orchestration for verbal-autopsy classification and calibration. The
//! `serve` process accepts jobs over HTTP; each job runs in its own `worker`
//! process that shares nothing with the server but the Job Store.

pub mod api;
pub mod calibration;
pub mod causes;
pub mod config;
pub mod db;
pub mod engines;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::services::JobService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: JobService,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: JobService) -> Self {
        Self {
            service,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::job_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
