use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
};

pub mod auth;

pub mod clock;

pub mod config;

pub mod decrypt;

pub mod error;

pub mod leaderboard;

pub mod ledger;

pub mod play;

pub mod sandbox;

pub mod session;

pub mod store;

pub mod sync;

pub mod test_helpers;

pub mod types;

pub mod wheel;

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
