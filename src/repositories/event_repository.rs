use crate::database::diesel::DbService;
use crate::errors::StoreError;
use crate::log_debug;
use crate::models::db::EventRow;
use crate::models::db::schema::{events_table, index_name};
use crate::models::{Event, SyncState};
use crate::repositories::base::RepositoryBase;
use crate::repositories::traits::EventRepository;
use async_trait::async_trait;
use diesel::OptionalExtension;
use diesel::sql_types::{BigInt, Text};
use diesel_async::RunQueryDsl;
use std::sync::Arc;

pub struct PgEventRepository {
    base: RepositoryBase,
    db: Arc<DbService>,
    chain_id: u64,
    with_conflict: bool,
}

impl PgEventRepository {
    pub fn new(db: Arc<DbService>, chain_id: u64, with_conflict: bool) -> Result<Self, StoreError> {
        Ok(Self {
            base: RepositoryBase::new(events_table(chain_id))?,
            db,
            chain_id,
            with_conflict,
        })
    }

    async fn execute(&self, context: &str, sql: String) -> Result<usize, StoreError> {
        self.base.ensure_open()?;
        let mut conn = self.db.write_conn().await?;
        diesel::sql_query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel(context, e))
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn create_table(&self) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                contract TEXT NOT NULL PRIMARY KEY,
                state TEXT NOT NULL,
                start_block BIGINT NOT NULL,
                last_block BIGINT NOT NULL,
                standard TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                symbol TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                CHECK (last_block >= start_block)
            )",
            self.base.table()
        );
        self.execute("create events table", sql).await?;
        Ok(())
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        let suffix = self.chain_id.to_string();
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (state)",
            index_name("evst", &suffix),
            self.base.table()
        );
        self.execute("create events state index", sql).await?;

        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (standard)",
            index_name("evsd", &suffix),
            self.base.table()
        );
        self.execute("create events standard index", sql).await?;
        Ok(())
    }

    async fn add_event(&self, event: &Event) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        event.validate()?;

        let on_conflict = if self.with_conflict {
            "ON CONFLICT (contract) DO UPDATE SET
                standard = EXCLUDED.standard,
                name = EXCLUDED.name,
                symbol = EXCLUDED.symbol,
                updated_at = now()"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO {} (contract, state, start_block, last_block, standard, name, symbol)
             VALUES ($1, $2, $3, $4, $5, $6, $7) {}",
            self.base.table(),
            on_conflict
        );

        let mut conn = self.db.write_conn().await?;
        diesel::sql_query(sql)
            .bind::<Text, _>(event.contract.to_lowercase())
            .bind::<Text, _>(event.state.as_str())
            .bind::<BigInt, _>(event.start_block)
            .bind::<BigInt, _>(event.last_block)
            .bind::<Text, _>(event.standard.as_str())
            .bind::<Text, _>(&event.name)
            .bind::<Text, _>(&event.symbol)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel(&format!("add event {}", event.contract), e))?;

        log_debug!("事件已登记: chain={}, contract={}", self.chain_id, event.contract);
        Ok(())
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "SELECT contract, state, start_block, last_block, standard, name, symbol
             FROM {} ORDER BY created_at ASC, contract ASC",
            self.base.table()
        );

        let mut conn = self.db.read_conn().await?;
        let rows = diesel::sql_query(sql)
            .load::<EventRow>(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("get events", e))?;

        rows.into_iter().map(Event::try_from).collect()
    }

    async fn get_event(&self, contract: &str) -> Result<Option<Event>, StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "SELECT contract, state, start_block, last_block, standard, name, symbol
             FROM {} WHERE contract = $1",
            self.base.table()
        );

        let mut conn = self.db.read_conn().await?;
        let row = diesel::sql_query(sql)
            .bind::<Text, _>(contract.to_lowercase())
            .get_result::<EventRow>(&mut *conn)
            .await
            .optional()
            .map_err(|e| StoreError::from_diesel("get event", e))?;

        row.map(Event::try_from).transpose()
    }

    async fn set_sync_state(&self, contract: &str, state: SyncState) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "UPDATE {} SET state = $1, updated_at = now() WHERE contract = $2",
            self.base.table()
        );

        let mut conn = self.db.write_conn().await?;
        let updated = diesel::sql_query(sql)
            .bind::<Text, _>(state.as_str())
            .bind::<Text, _>(contract.to_lowercase())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("set sync state", e))?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("event {}", contract)));
        }
        Ok(())
    }

    async fn set_last_block(&self, contract: &str, last_block: i64) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "UPDATE {} SET last_block = $1, updated_at = now()
             WHERE contract = $2 AND start_block <= $1",
            self.base.table()
        );

        let mut conn = self.db.write_conn().await?;
        let updated = diesel::sql_query(sql)
            .bind::<BigInt, _>(last_block)
            .bind::<Text, _>(contract.to_lowercase())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("set last block", e))?;

        if updated == 0 {
            // 区分合约不存在与区块区间非法
            return match self.get_event(contract).await? {
                Some(ev) => Err(StoreError::InvalidInput(format!(
                    "合约 {}: last_block({}) < start_block({})",
                    contract, last_block, ev.start_block
                ))),
                None => Err(StoreError::NotFound(format!("event {}", contract))),
            };
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.base.mark_closed()
    }
}

#[cfg(all(test, feature = "db-tests"))]
mod pg_tests {
    //! cargo test --features db-tests（需要 DATABASE_URL）
    use super::*;
    use crate::config::{DatabaseConfig, StorageBackendKind};
    use crate::database::diesel::{create_async_db_pool, ping};
    use crate::models::Standard;

    async fn setup(chain_id: u64, with_conflict: bool) -> PgEventRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let config = DatabaseConfig {
            backend: StorageBackendKind::Postgres,
            host: String::new(),
            read_host: None,
            port: 5432,
            database_name: String::new(),
            username: String::new(),
            password: String::new(),
            max_connections: 4,
            connect_timeout_seconds: 5,
            with_conflict,
        };
        let write = create_async_db_pool(&url, &config).await.unwrap();
        ping(&write).await.unwrap();
        let read = create_async_db_pool(&url, &config).await.unwrap();
        let db = Arc::new(DbService { write, read });

        let repo = PgEventRepository::new(db, chain_id, with_conflict).unwrap();
        repo.execute("reset", format!("DROP TABLE IF EXISTS {}", repo.base.table()))
            .await
            .unwrap();
        repo.create_table().await.unwrap();
        repo.create_indexes().await.unwrap();
        repo
    }

    fn event(contract: &str, start: i64, last: i64) -> Event {
        Event::new(contract, SyncState::Queued, start, last, Standard::Erc20, "Token", "TKN")
    }

    #[tokio::test]
    async fn duplicate_contract_is_rejected_without_conflict_mode() {
        let repo = setup(990_001, false).await;
        repo.add_event(&event("0xAAA", 1, 1)).await.unwrap();

        let err = repo.add_event(&event("0xaaa", 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn conflict_mode_updates_metadata_only() {
        let repo = setup(990_002, true).await;
        repo.add_event(&event("0xaaa", 1, 5)).await.unwrap();
        repo.set_sync_state("0xaaa", SyncState::Synced).await.unwrap();

        let replay = Event::new("0xAAA", SyncState::Queued, 1, 1, Standard::Erc721, "Renamed", "RN");
        repo.add_event(&replay).await.unwrap();

        let stored = repo.get_event("0xaaa").await.unwrap().unwrap();
        assert_eq!(stored.standard, Standard::Erc721);
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.symbol, "RN");
        // 同步进度不被重放覆盖
        assert_eq!(stored.state, SyncState::Synced);
        assert_eq!(stored.last_block, 5);
    }

    #[tokio::test]
    async fn events_are_returned_in_registration_order() {
        let repo = setup(990_003, false).await;
        repo.add_event(&event("0xccc", 1, 1)).await.unwrap();
        repo.add_event(&event("0xaaa", 1, 1)).await.unwrap();
        repo.add_event(&event("0xbbb", 1, 1)).await.unwrap();

        let contracts: Vec<String> = repo
            .get_events()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.contract)
            .collect();
        assert_eq!(contracts, vec!["0xccc", "0xaaa", "0xbbb"]);
    }

    #[tokio::test]
    async fn set_last_block_distinguishes_missing_from_invalid() {
        let repo = setup(990_004, false).await;
        repo.add_event(&event("0xaaa", 10, 10)).await.unwrap();

        repo.set_last_block("0xAAA", 42).await.unwrap();
        assert_eq!(repo.get_event("0xaaa").await.unwrap().unwrap().last_block, 42);

        assert!(matches!(
            repo.set_last_block("0xaaa", 9).await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            repo.set_last_block("0xmissing", 42).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.set_sync_state("0xmissing", SyncState::Error).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let repo = setup(990_005, false).await;
        repo.close().await.unwrap();
        assert!(matches!(repo.get_events().await, Err(StoreError::Io(_))));
        assert!(matches!(repo.close().await, Err(StoreError::Io(_))));
    }
}
