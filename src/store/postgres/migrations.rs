use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres, Transaction};

/// Store-owned schema, applied atomically at builder time.
///
/// Projection tables are created by each handler's `init`; anything else
/// belongs to the external migrator, which records into the same
/// `schema_migrations` bookkeeping table.
pub struct Migrations;

const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "create_events",
        "CREATE TABLE IF NOT EXISTS events
         (
           instance_id       TEXT        NOT NULL,
           aggregate_type    TEXT        NOT NULL,
           aggregate_id      TEXT        NOT NULL,
           aggregate_version BIGINT      NOT NULL,
           event_type        TEXT        NOT NULL,
           revision          SMALLINT    NOT NULL,
           position          NUMERIC     NOT NULL,
           in_tx_order       INTEGER     NOT NULL,
           creator           TEXT        NOT NULL,
           owner             TEXT        NOT NULL,
           created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
           payload           JSONB,
           PRIMARY KEY (instance_id, aggregate_type, aggregate_id, aggregate_version)
         )",
    ),
    (
        2,
        "create_events_indexes",
        "CREATE UNIQUE INDEX IF NOT EXISTS events_position ON events (position, in_tx_order)",
    ),
    (
        3,
        "create_events_event_type_index",
        "CREATE INDEX IF NOT EXISTS events_instance_event_type ON events (instance_id, event_type)",
    ),
    (
        4,
        "create_events_owner_index",
        "CREATE INDEX IF NOT EXISTS events_instance_owner ON events (instance_id, owner)",
    ),
    (
        5,
        "create_events_created_at_index",
        "CREATE INDEX IF NOT EXISTS events_created_at ON events (created_at)",
    ),
    (
        6,
        "create_events_payload_index",
        "CREATE INDEX IF NOT EXISTS events_payload ON events USING GIN (payload)",
    ),
    (
        7,
        "create_projection_states",
        "CREATE TABLE IF NOT EXISTS projection_states
         (
           name                TEXT PRIMARY KEY,
           current_position    NUMERIC     NOT NULL DEFAULT 0,
           current_in_tx_order INTEGER     NOT NULL DEFAULT 0,
           status              TEXT        NOT NULL DEFAULT 'stopped',
           error_count         INTEGER     NOT NULL DEFAULT 0,
           last_error          TEXT,
           last_processed_at   TIMESTAMPTZ
         )",
    ),
    (
        8,
        "create_failed_events",
        "CREATE TABLE IF NOT EXISTS failed_events
         (
           projection_name TEXT        NOT NULL,
           instance_id     TEXT        NOT NULL,
           aggregate_id    TEXT        NOT NULL,
           event_type      TEXT        NOT NULL,
           position        NUMERIC     NOT NULL,
           in_tx_order     INTEGER     NOT NULL,
           error           TEXT        NOT NULL,
           retry_count     INTEGER     NOT NULL DEFAULT 0,
           last_failed_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
           PRIMARY KEY (projection_name, position, in_tx_order)
         )",
    ),
    (
        9,
        "create_logstore",
        "CREATE SCHEMA IF NOT EXISTS logstore",
    ),
    (
        10,
        "create_logstore_logs",
        "CREATE TABLE IF NOT EXISTS logstore.logs
         (
           instance_id TEXT,
           logged_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
           level       TEXT        NOT NULL,
           message     TEXT        NOT NULL,
           fields      JSONB
         )",
    ),
    (
        11,
        "create_logstore_execution_logs",
        "CREATE TABLE IF NOT EXISTS logstore.execution_logs
         (
           instance_id TEXT        NOT NULL,
           logged_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
           operation   TEXT        NOT NULL,
           took_ms     BIGINT      NOT NULL,
           fields      JSONB
         )",
    ),
    (
        12,
        "create_logstore_quota_logs",
        "CREATE TABLE IF NOT EXISTS logstore.quota_logs
         (
           instance_id TEXT        NOT NULL,
           logged_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
           unit        TEXT        NOT NULL,
           used        BIGINT      NOT NULL
         )",
    ),
];

const CREATE_SCHEMA_MIGRATIONS: &str = "CREATE TABLE IF NOT EXISTS schema_migrations
     (
       version    BIGINT PRIMARY KEY,
       name       TEXT        NOT NULL,
       applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
     )";

const RECORD_MIGRATION: &str =
    "INSERT INTO schema_migrations (version, name) VALUES ($1, $2) ON CONFLICT (version) DO NOTHING";

impl Migrations {
    pub async fn run(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
        let mut transaction: Transaction<Postgres> = pool.begin().await?;

        let _: PgQueryResult = sqlx::query(CREATE_SCHEMA_MIGRATIONS)
            .execute(&mut *transaction)
            .await?;

        for (version, name, migration) in MIGRATIONS {
            let _: PgQueryResult = sqlx::query(migration).execute(&mut *transaction).await?;
            let _: PgQueryResult = sqlx::query(RECORD_MIGRATION)
                .bind(version)
                .bind(name)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await
    }
}
