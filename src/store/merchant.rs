//! Merchant rows. Administration lives elsewhere; the gateway only needs to
//! resolve an API key digest to an owning merchant.

use chrono::{DateTime, Utc};

use crate::store::Store;
use crate::types::Environment;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Merchant {
    pub id: i64,
    pub name: String,
    pub environment: Environment,
    pub api_key_digest: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub async fn merchant_by_key_digest(&self, digest: &str) -> sqlx::Result<Option<Merchant>> {
        sqlx::query_as::<_, Merchant>("SELECT * FROM merchants WHERE api_key_digest = $1")
            .bind(digest)
            .fetch_optional(self.pool())
            .await
    }
}
