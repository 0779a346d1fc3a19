//! PostgreSQL store
//!
//! Each repository trait is implemented in its own module, mirroring the
//! `job` and `provision` tables.

mod job;
mod provision;

use sqlx::PgPool;

/// Store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Renders states as the text stored in `status` columns
fn state_names<S: ToString>(states: impl IntoIterator<Item = S>) -> Vec<String> {
    states.into_iter().map(|s| s.to_string()).collect()
}
