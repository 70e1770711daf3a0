//! Relational persistence.
//!
//! The Postgres database is the only authoritative state in the system.
//! Everything here is merchant-scoped: reads and writes take the merchant id
//! extracted from the authenticated principal, and cross-tenant access is
//! impossible by construction of the queries.
//!
//! Domain enums are stored as `TEXT`; [`impl_text_enum!`] wires them into
//! sqlx so rows decode straight into typed structs.

pub mod customer;
pub mod ledger;
pub mod merchant;
pub mod payment;
pub mod webhook;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Map a domain enum onto a `TEXT` column through its
/// `as_str`/`FromStr` pair.
macro_rules! impl_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let text = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                Ok(text.parse::<$ty>()?)
            }
        }
    };
}

impl_text_enum!(crate::types::Channel);
impl_text_enum!(crate::types::Currency);
impl_text_enum!(crate::types::PaymentStatus);
impl_text_enum!(crate::types::LedgerKind);
impl_text_enum!(crate::types::DeliveryStatus);
impl_text_enum!(crate::types::Environment);

/// Handle to the relational store. Cheap to clone; all sub-APIs hang off it.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction for a multi-statement atomic write.
    pub async fn begin(&self) -> sqlx::Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await
    }
}
