#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! microci daemon: receives Gitea webhooks, runs the matching script for each
//! event on a worker pool and reports the result as a commit status.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod gitea;
pub mod http;
pub mod job;
pub mod manager;
pub mod queue;
pub mod status;
pub mod worker;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
