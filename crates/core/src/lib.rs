#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models for microci: job status, Gitea webhook events and the job
//! log line format.

pub mod event;
pub mod log;
pub mod model;

mod util;

pub use util::{is_valid_job_id, new_job_id, now_ms};
