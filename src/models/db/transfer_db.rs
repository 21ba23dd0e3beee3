use crate::errors::StoreError;
use crate::models::domain::Transfer;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::QueryableByName;
use diesel::sql_types::{BigInt, Binary, Bool, Nullable, Numeric, Text, Timestamptz};

#[derive(Debug, Clone, QueryableByName)]
pub struct TransferRow {
    #[diesel(sql_type = Text)]
    pub hash: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub tx_hash: Option<String>,
    #[diesel(sql_type = BigInt)]
    pub token_id: i64,
    #[diesel(sql_type = Timestamptz)]
    pub created_at: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    pub from_to_addr: String,
    #[diesel(sql_type = Text)]
    pub from_addr: String,
    #[diesel(sql_type = Text)]
    pub to_addr: String,
    #[diesel(sql_type = BigInt)]
    pub nonce: i64,
    #[diesel(sql_type = Numeric)]
    pub value: BigDecimal,
    #[diesel(sql_type = Nullable<Binary>)]
    pub data: Option<Vec<u8>>,
    #[diesel(sql_type = Text)]
    pub status: String,
}

/// `SELECT EXISTS(...) AS present`
#[derive(Debug, Clone, Copy, QueryableByName)]
pub struct ExistsRow {
    #[diesel(sql_type = Bool)]
    pub present: bool,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        Ok(Transfer {
            hash: row.hash,
            tx_hash: row.tx_hash,
            token_id: row.token_id,
            created_at: row.created_at,
            from_to: row.from_to_addr,
            from: row.from_addr,
            to: row.to_addr,
            nonce: row.nonce,
            value: row.value,
            data: row.data,
            status: row.status.parse()?,
        })
    }
}
