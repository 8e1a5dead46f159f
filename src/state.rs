// src/state.rs

use crate::config::Config;
use crate::services::maps::MapsProvider;
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Key for serializing aggregation passes: one slot per (office, employee).
pub type PassKey = (Uuid, String);

pub type PassLocks = DashMap<PassKey, Arc<Mutex<()>>>;

/// Fetch (or create) the serialization lock for one employee.
pub fn acquire_pass_lock(locks: &PassLocks, key: PassKey) -> Arc<Mutex<()>> {
    locks
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Drop the entry for an employee nobody is currently serializing on.
///
/// `remove_if` holds the shard lock while it checks, and `acquire_pass_lock`
/// needs that same lock to hand out a clone, so a count of one proves the
/// map holds the only reference.
pub fn sweep_pass_lock(locks: &PassLocks, key: &PassKey) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub maps: Arc<dyn MapsProvider>,
    /// Two passes for the same employee must not interleave their
    /// read-merge-write cycles; everyone else runs freely. Entries are
    /// swept after each pass so the map tracks in-flight employees, not
    /// everyone ever seen.
    pub pass_locks: Arc<PassLocks>,
}

impl AppState {
    pub fn new(db: PgPool, config: Config, maps: Arc<dyn MapsProvider>) -> Self {
        Self {
            db,
            config: Arc::new(config),
            maps,
            pass_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn pass_lock(&self, office_id: Uuid, phone: &str) -> Arc<Mutex<()>> {
        acquire_pass_lock(&self.pass_locks, (office_id, phone.to_string()))
    }

    pub fn release_pass_lock(&self, office_id: Uuid, phone: &str) {
        sweep_pass_lock(&self.pass_locks, &(office_id, phone.to_string()));
    }
}
