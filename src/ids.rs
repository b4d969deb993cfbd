use uuid::Uuid;

use crate::error::Error;

/// External provider of sortable, globally-unique identifiers.
///
/// Production deployments plug in a snowflake-style generator; the default
/// implementation returns UUIDv7 strings, which sort by creation time.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<String, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> Result<String, Error> {
        Ok(Uuid::now_v7().simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{IdGenerator, UuidIdGenerator};

    #[test]
    fn ids_are_unique_and_sortable() {
        let generator = UuidIdGenerator;
        let first = generator.next_id().unwrap();
        let second = generator.next_id().unwrap();

        assert_ne!(first, second);
        // UUIDv7 embeds a millisecond timestamp in the leading bits.
        assert!(first <= second);
    }
}
