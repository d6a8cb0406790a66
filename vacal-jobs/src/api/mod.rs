//! HTTP API handlers for vacal-jobs
//!
//! A thin layer over [`crate::services::JobService`].

pub mod health;
pub mod jobs;

pub use health::health_routes;
pub use jobs::job_routes;
