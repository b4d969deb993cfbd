//! Read-only typed accessors over the projection tables.
//!
//! Every query is scoped by `instance_id`; single-item lookups return
//! `Ok(None)` for absent rows, searches return empty pages. Queries are
//! stateless and safe to run concurrently.

use sqlx::PgPool;

mod custom_text;
mod org;
mod policy;
mod token;
mod user;

pub use custom_text::CustomTextRow;
pub use org::{OrgDomainRow, OrgMemberRow, OrgRow};
pub use policy::{ResolvedPolicy, SecurityPolicyRow};
pub use token::{AuthnKeyRow, PersonalAccessTokenRow};
pub use user::{UserMetadataRow, UserRow};

/// Upper bound on page sizes, applied to every search.
const MAX_LIMIT: u32 = 1_000;

/// Pagination of a search call.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest {
    pub offset: u64,
    pub limit: u32,
    pub asc: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
            asc: true,
        }
    }
}

impl SearchRequest {
    pub(crate) fn capped_limit(&self) -> i64 {
        i64::from(self.limit.clamp(1, MAX_LIMIT))
    }

    pub(crate) fn offset(&self) -> i64 {
        self.offset as i64
    }

    pub(crate) fn direction(&self) -> &'static str {
        if self.asc {
            "ASC"
        } else {
            "DESC"
        }
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone)]
pub struct SearchResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Entry point for all read accessors.
#[derive(Clone)]
pub struct Queries {
    pool: PgPool,
}

impl Queries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::SearchRequest;

    #[test]
    fn limits_are_capped() {
        let request = SearchRequest {
            limit: 50_000,
            ..Default::default()
        };
        assert_eq!(request.capped_limit(), 1_000);

        let request = SearchRequest {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(request.capped_limit(), 1);
    }

    #[test]
    fn direction_follows_asc_flag() {
        assert_eq!(SearchRequest::default().direction(), "ASC");
        let desc = SearchRequest {
            asc: false,
            ..Default::default()
        };
        assert_eq!(desc.direction(), "DESC");
    }
}
