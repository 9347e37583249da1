use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Returns current unix epoch milliseconds.
///
/// A clock set before the epoch reads as `0`.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Generates a new job id: 128 random bits, lowercase hex, no dashes.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Returns true when `id` looks like something [`new_job_id`] could produce.
///
/// Used to reject path tricks before an id is joined onto the jobs root.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}
