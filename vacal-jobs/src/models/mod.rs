//! Data models for vacal-jobs
//!
//! - Job lifecycle state machine
//! - Validated job parameters
//! - Input record tables
//! - Results, log entries and output files

pub mod job;
pub mod parameters;
pub mod records;
pub mod result;

pub use job::{Job, JobStatus, JobSummary, StateTransition, TransitionError};
pub use parameters::{
    canonical_country, AgeGroup, Algorithm, CalibrationVariant, JobParameters, JobType,
    McmcParams, KNOWN_COUNTRIES,
};
pub use records::{CauseAssignment, RecordError, RecordTable, ID_COLUMN};
pub use result::{
    CalibratedRow, ClassificationSummary, CsmfRow, DroppedAlgorithm, JobResult, LogEntry,
    MisclassificationRow, MisclassificationTable, OutputFile,
};
