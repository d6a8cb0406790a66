//! Job services
//!
//! Submission and queries (`job_service`), process launch (`launcher`), the
//! per-job worker and the pipeline stages it drives.

pub mod demo_data;
pub mod job_service;
pub mod launcher;
pub mod log_stream;
pub mod materializer;
pub mod normalizer;
pub mod orchestrator;
pub mod worker;

pub use job_service::{
    JobService, ResultsView, ServiceError, SubmitRequest, SubmitResponse, ValidationError,
};
pub use launcher::{JobLauncher, Launch};
pub use worker::{run_job, WorkerContext, WorkerOutcome};
