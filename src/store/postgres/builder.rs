use sqlx::{Pool, Postgres};

use crate::store::EventBroadcaster;

use super::event_store::InnerPgEventStore;
use super::migrations::Migrations;
use super::statements::Statements;
use super::PgEventStore;

const EVENTS_TABLE: &str = "events";

/// Struct used to build a brand new [`PgEventStore`].
pub struct PgEventStoreBuilder {
    pool: Pool<Postgres>,
    run_migrations: bool,
    broadcaster: EventBroadcaster,
}

impl PgEventStoreBuilder {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            run_migrations: true,
            broadcaster: EventBroadcaster::new(),
        }
    }

    /// Calling this function the caller avoids running migrations. It is
    /// recommended to run migrations at least once per store per startup.
    pub fn without_running_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    /// Share a broadcaster with other components (e.g. an already-built
    /// projection engine) instead of creating a fresh one.
    pub fn with_broadcaster(mut self, broadcaster: EventBroadcaster) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    /// Runs the store-owned migrations unless opted out, then returns the
    /// store.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if running migrations fails.
    pub async fn try_build(self) -> Result<PgEventStore, sqlx::Error> {
        if self.run_migrations {
            Migrations::run(&self.pool).await?;
        }

        Ok(PgEventStore::new(InnerPgEventStore {
            pool: self.pool,
            statements: Statements::new(EVENTS_TABLE),
            broadcaster: self.broadcaster,
        }))
    }
}
