use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Error;

/// Message template identifiers understood by the transport.
pub mod templates {
    pub const INIT_CODE: &str = "user.init.code";
    pub const EMAIL_VERIFICATION: &str = "user.email.verification";
}

/// External email/SMS delivery interface.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, template_id: &str, recipient: &str, data: HashMap<String, String>) -> Result<(), Error>;
}

/// Transport that drops every message. Used when delivery is handled by an
/// out-of-process notifier consuming the event log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

#[async_trait]
impl NotificationTransport for NoopTransport {
    async fn send(&self, template_id: &str, recipient: &str, _data: HashMap<String, String>) -> Result<(), Error> {
        tracing::debug!(template_id, recipient, "dropping notification (noop transport)");
        Ok(())
    }
}
