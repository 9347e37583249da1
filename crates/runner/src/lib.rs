#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Script execution for microci jobs: child process supervision with a
//! deadline and a cancellation token, and the shared job log writer.

pub mod exec_runner;
pub mod job_log;

pub use exec_runner::{run_script, ExecError, ExecRequest, ARTIFACT_DIR_VAR};
pub use job_log::JobLog;
