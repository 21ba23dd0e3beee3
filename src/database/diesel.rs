use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use crate::log_info;
use crate::models::db::ExistsRow;
use crate::models::db::schema::{events_table, transfers_table};
use crate::repositories::event_repository::PgEventRepository;
use crate::repositories::traits::{EventRepository, StorageBackend, TransferRepository};
use crate::repositories::transfer_repository::PgTransferRepository;
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use diesel::sql_types::Text;
use diesel_async::pg::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

// 定义异步池类型
pub type DbManager = AsyncDieselConnectionManager<AsyncPgConnection>;
pub type AsyncDbPool = Pool<DbManager>;
pub type DbConnection<'a> = PooledConnection<'a, DbManager>;

pub async fn create_async_db_pool(
    database_url: &str,
    config: &DatabaseConfig,
) -> Result<AsyncDbPool, StoreError> {
    let manager = DbManager::new(database_url);
    let pool = Pool::builder()
        .max_size(config.max_connections)
        .connection_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .build(manager)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    Ok(pool)
}

/// 往返一次 `SELECT 1`，确认连接可用
pub async fn ping(pool: &AsyncDbPool) -> Result<(), StoreError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    diesel::sql_query("SELECT 1")
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::Connection(format!("ping failed: {}", e)))?;
    Ok(())
}

#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// 在主库上执行一个事务闭包
    /// 闭包返回带生命周期的 Future，由 scope_boxed 绑定到连接
    async fn execute_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut AsyncPgConnection) -> BoxFuture<'a, Result<T, StoreError>>
            + Send
            + 'static;
}

/// 主库（写）+ 副本（读）两个连接池
#[derive(Clone)]
pub struct DbService {
    pub write: AsyncDbPool,
    pub read: AsyncDbPool,
}

impl DbService {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let write = create_async_db_pool(&config.write_url(), config).await?;
        ping(&write).await?;

        let read = create_async_db_pool(&config.read_url(), config).await?;
        ping(&read).await?;

        log_info!(
            "数据库连接池初始化完成: primary={}, replica={}",
            config.host,
            config.read_host.as_deref().unwrap_or(&config.host)
        );
        Ok(Self { write, read })
    }

    pub async fn write_conn(&self) -> Result<DbConnection<'_>, StoreError> {
        self.write
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    pub async fn read_conn(&self) -> Result<DbConnection<'_>, StoreError> {
        self.read
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// information_schema 检查表是否存在（主库）
    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let mut conn = self.write_conn().await?;
        let row = diesel::sql_query(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            ) AS present",
        )
        .bind::<Text, _>(table)
        .get_result::<ExistsRow>(&mut *conn)
        .await
        .map_err(|e| StoreError::from_diesel("table exists check", e))?;
        Ok(row.present)
    }
}

#[async_trait]
impl TransactionExecutor for DbService {
    async fn execute_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut AsyncPgConnection) -> BoxFuture<'a, Result<T, StoreError>>
            + Send
            + 'static,
    {
        let mut conn = self.write_conn().await?;

        //直接调用 f(c) 并使用 scope_boxed(),确保 conn 的生命周期 'a 与 Future 绑定
        (*conn)
            .transaction::<T, StoreError, _>(|c| f(c).scope_boxed())
            .await
    }
}

/// PostgreSQL 存储后端：为注册表生产事件表/转账表句柄
pub struct PgBackend {
    chain_id: u64,
    db: Arc<DbService>,
    with_conflict: bool,
    events: Arc<PgEventRepository>,
}

impl PgBackend {
    pub async fn connect(chain_id: u64, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = Arc::new(DbService::connect(config).await?);
        Self::new(chain_id, db, config.with_conflict)
    }

    pub fn new(chain_id: u64, db: Arc<DbService>, with_conflict: bool) -> Result<Self, StoreError> {
        let events = Arc::new(PgEventRepository::new(db.clone(), chain_id, with_conflict)?);
        Ok(Self {
            chain_id,
            db,
            with_conflict,
            events,
        })
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    fn event_repository(&self) -> Arc<dyn EventRepository> {
        self.events.clone()
    }

    async fn event_table_exists(&self) -> Result<bool, StoreError> {
        self.db.table_exists(&events_table(self.chain_id)).await
    }

    async fn transfer_table_exists(&self, suffix: &str) -> Result<bool, StoreError> {
        self.db.table_exists(&transfers_table(suffix)).await
    }

    fn transfer_repository(&self, suffix: &str) -> Result<Arc<dyn TransferRepository>, StoreError> {
        let repo = PgTransferRepository::new(self.db.clone(), suffix, self.with_conflict)?;
        Ok(Arc::new(repo))
    }
}
