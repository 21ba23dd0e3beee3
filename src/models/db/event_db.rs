use crate::errors::StoreError;
use crate::models::domain::Event;
use diesel::QueryableByName;
use diesel::sql_types::{BigInt, Text};

/// 事件表的一行（动态表名，走 sql_query）
#[derive(Debug, Clone, QueryableByName)]
pub struct EventRow {
    #[diesel(sql_type = Text)]
    pub contract: String,
    #[diesel(sql_type = Text)]
    pub state: String,
    #[diesel(sql_type = BigInt)]
    pub start_block: i64,
    #[diesel(sql_type = BigInt)]
    pub last_block: i64,
    #[diesel(sql_type = Text)]
    pub standard: String,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub symbol: String,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            contract: row.contract,
            state: row.state.parse()?,
            start_block: row.start_block,
            last_block: row.last_block,
            standard: row.standard.parse()?,
            name: row.name,
            symbol: row.symbol,
        })
    }
}
