//! Thin writer for the `logstore` schema. Best-effort: a failed telemetry
//! write never fails the caller.

use std::time::Duration;

use sqlx::PgPool;

/// Appends one operational record to `logstore.execution_logs`.
pub(crate) async fn record_execution(
    pool: &PgPool,
    instance_id: &str,
    operation: &str,
    took: Duration,
    fields: serde_json::Value,
) {
    let result = sqlx::query(
        "INSERT INTO logstore.execution_logs (instance_id, operation, took_ms, fields)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(instance_id)
    .bind(operation)
    .bind(took.as_millis() as i64)
    .bind(fields)
    .execute(pool)
    .await;

    if let Err(err) = result {
        tracing::warn!(operation, error = %err, "failed to append execution log");
    }
}
