/// Prepared SQL text for the event store, built once per store instance.
#[derive(Clone, Debug)]
pub struct Statements {
    insert: String,
    current_version: String,
    tx_context: String,
    latest_position: String,
    latest_position_instance: String,
    distinct_instance_ids: String,
    purge_instance: String,
    select_prefix: String,
}

impl Statements {
    pub fn new(table_name: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {table_name}
                 (instance_id, aggregate_type, aggregate_id, aggregate_version, event_type, revision,
                  position, in_tx_order, creator, owner, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ),
            current_version: format!(
                "SELECT COALESCE(MAX(aggregate_version), 0) FROM {table_name}
                 WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3"
            ),
            // One timestamp and one decimal position per push transaction.
            tx_context: "SELECT now(), EXTRACT(EPOCH FROM clock_timestamp())::NUMERIC".to_owned(),
            latest_position: format!(
                "SELECT position, in_tx_order FROM {table_name}
                 ORDER BY position DESC, in_tx_order DESC LIMIT 1"
            ),
            latest_position_instance: format!(
                "SELECT position, in_tx_order FROM {table_name}
                 WHERE instance_id = $1
                 ORDER BY position DESC, in_tx_order DESC LIMIT 1"
            ),
            distinct_instance_ids: format!("SELECT DISTINCT instance_id FROM {table_name}"),
            purge_instance: format!("DELETE FROM {table_name} WHERE instance_id = $1"),
            select_prefix: format!(
                "SELECT instance_id, aggregate_type, aggregate_id, aggregate_version, event_type, revision,
                        position, in_tx_order, creator, owner, created_at, payload
                 FROM {table_name}"
            ),
        }
    }

    pub fn insert(&self) -> &str {
        &self.insert
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn tx_context(&self) -> &str {
        &self.tx_context
    }

    pub fn latest_position(&self) -> &str {
        &self.latest_position
    }

    pub fn latest_position_instance(&self) -> &str {
        &self.latest_position_instance
    }

    pub fn distinct_instance_ids(&self) -> &str {
        &self.distinct_instance_ids
    }

    pub fn purge_instance(&self) -> &str {
        &self.purge_instance
    }

    pub fn select_prefix(&self) -> &str {
        &self.select_prefix
    }
}
