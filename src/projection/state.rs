use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Row};

use crate::event::StoredEvent;
use crate::store::StoreError;
use crate::types::Position;

/// Lifecycle status of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    Stopped,
    Running,
    Rebuilding,
    Error,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Rebuilding => "rebuilding",
            Self::Error => "error",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "rebuilding" => Self::Rebuilding,
            "error" => Self::Error,
            _ => Self::Stopped,
        }
    }
}

/// Durable per-projection bookkeeping row.
#[derive(Debug, Clone)]
pub struct ProjectionState {
    pub name: String,
    pub position: Position,
    pub status: ProjectionStatus,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Inserts the bookkeeping row if missing, keeping an existing cursor.
pub(crate) async fn register(pool: &PgPool, name: &str) -> Result<(), StoreError> {
    let _ = sqlx::query(
        "INSERT INTO projection_states (name, current_position, current_in_tx_order, status)
         VALUES ($1, 0, 0, 'stopped')
         ON CONFLICT (name) DO NOTHING",
    )
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn get(pool: &PgPool, name: &str) -> Result<ProjectionState, StoreError> {
    let row = sqlx::query(
        "SELECT name, current_position, current_in_tx_order, status, error_count, last_error, last_processed_at
         FROM projection_states WHERE name = $1",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;

    let global: Decimal = row.get(1);
    let in_tx_order: i32 = row.get(2);
    let status: String = row.get(3);

    Ok(ProjectionState {
        name: row.get(0),
        position: Position::new(global, in_tx_order),
        status: ProjectionStatus::from_str(&status),
        error_count: row.get(4),
        last_error: row.get(5),
        last_processed_at: row.get(6),
    })
}

pub(crate) async fn all(pool: &PgPool) -> Result<Vec<ProjectionState>, StoreError> {
    let rows = sqlx::query(
        "SELECT name, current_position, current_in_tx_order, status, error_count, last_error, last_processed_at
         FROM projection_states ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let global: Decimal = row.get(1);
            let in_tx_order: i32 = row.get(2);
            let status: String = row.get(3);
            ProjectionState {
                name: row.get(0),
                position: Position::new(global, in_tx_order),
                status: ProjectionStatus::from_str(&status),
                error_count: row.get(4),
                last_error: row.get(5),
                last_processed_at: row.get(6),
            }
        })
        .collect())
}

pub(crate) async fn set_status(pool: &PgPool, name: &str, status: ProjectionStatus) -> Result<(), StoreError> {
    let _ = sqlx::query("UPDATE projection_states SET status = $2 WHERE name = $1")
        .bind(name)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Advances the cursor inside the batch transaction, clearing the error
/// bookkeeping.
pub(crate) async fn advance_cursor(
    conn: &mut PgConnection,
    name: &str,
    position: Position,
) -> Result<(), StoreError> {
    let _ = sqlx::query(
        "UPDATE projection_states
         SET current_position = $2, current_in_tx_order = $3, error_count = 0, last_error = NULL,
             last_processed_at = now()
         WHERE name = $1",
    )
    .bind(name)
    .bind(position.global)
    .bind(position.in_tx_order)
    .execute(conn)
    .await?;
    Ok(())
}

/// Resets the cursor to zero (rebuild).
pub(crate) async fn reset_cursor(conn: &mut PgConnection, name: &str) -> Result<(), StoreError> {
    let _ = sqlx::query(
        "UPDATE projection_states
         SET current_position = 0, current_in_tx_order = 0, error_count = 0, last_error = NULL
         WHERE name = $1",
    )
    .bind(name)
    .execute(conn)
    .await?;
    Ok(())
}

/// Records a failed event for operator inspection and bumps the error
/// counter. Returns the new error count.
pub(crate) async fn record_failure(
    pool: &PgPool,
    name: &str,
    event: &StoredEvent,
    error: &str,
    retry_count: i32,
) -> Result<i32, StoreError> {
    let _ = sqlx::query(
        "INSERT INTO failed_events
         (projection_name, instance_id, aggregate_id, event_type, position, in_tx_order, error, retry_count)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (projection_name, position, in_tx_order)
         DO UPDATE SET error = EXCLUDED.error, retry_count = EXCLUDED.retry_count, last_failed_at = now()",
    )
    .bind(name)
    .bind(&event.instance_id)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(event.position.global)
    .bind(event.position.in_tx_order)
    .bind(error)
    .bind(retry_count)
    .execute(pool)
    .await?;

    let error_count: i32 = sqlx::query_scalar(
        "UPDATE projection_states
         SET error_count = error_count + 1, last_error = $2
         WHERE name = $1
         RETURNING error_count",
    )
    .bind(name)
    .bind(error)
    .fetch_one(pool)
    .await?;

    Ok(error_count)
}
