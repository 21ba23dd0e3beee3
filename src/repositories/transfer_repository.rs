use crate::database::diesel::{DbService, TransactionExecutor};
use crate::errors::StoreError;
use crate::models::db::schema::{index_name, transfers_table};
use crate::models::db::{ExistsRow, TransferRow};
use crate::models::{Transfer, TransferStatus};
use crate::repositories::base::RepositoryBase;
use crate::repositories::traits::TransferRepository;
use crate::{log_debug, log_info};
use async_trait::async_trait;
use diesel::OptionalExtension;
use diesel::result::Error as DieselError;
use diesel::sql_types::{BigInt, Binary, Nullable, Numeric, Text, Timestamptz};
use diesel_async::RunQueryDsl;
use diesel_async::pg::AsyncPgConnection;
use std::sync::Arc;

const TRANSFER_COLUMNS: &str =
    "hash, tx_hash, token_id, created_at, from_to_addr, from_addr, to_addr, nonce, value, data, status";

/// 单个合约的转账表 `t_transfers_{chain}_{contract}`
pub struct PgTransferRepository {
    base: RepositoryBase,
    db: Arc<DbService>,
    suffix: String,
    with_conflict: bool,
}

impl PgTransferRepository {
    pub fn new(db: Arc<DbService>, suffix: &str, with_conflict: bool) -> Result<Self, StoreError> {
        Ok(Self {
            base: RepositoryBase::new(transfers_table(suffix))?,
            db,
            suffix: suffix.to_string(),
            with_conflict,
        })
    }

    fn table(&self) -> &str {
        self.base.table()
    }

    /// 冲突模式下：只补齐 tx_hash/data、状态只进不退、终态记录不动、created_at 不变
    fn insert_sql(&self) -> String {
        let t = self.table();
        let on_conflict = if self.with_conflict {
            format!(
                "ON CONFLICT (hash) DO UPDATE SET
                    tx_hash = COALESCE(EXCLUDED.tx_hash, {t}.tx_hash),
                    data = COALESCE(EXCLUDED.data, {t}.data),
                    status = CASE WHEN {excluded_rank} >= {current_rank}
                        THEN EXCLUDED.status ELSE {t}.status END
                 WHERE {t}.status IN ('pending', 'sending')",
                t = t,
                excluded_rank = status_rank("EXCLUDED.status"),
                current_rank = status_rank(&format!("{}.status", t)),
            )
        } else {
            String::new()
        };
        format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) {}",
            t, TRANSFER_COLUMNS, on_conflict
        )
    }

    async fn execute(&self, context: &str, sql: String) -> Result<usize, StoreError> {
        self.base.ensure_open()?;
        let mut conn = self.db.write_conn().await?;
        diesel::sql_query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel(context, e))
    }

    async fn delete_with_status(
        &self,
        hash: &str,
        status: TransferStatus,
    ) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        let sql = format!("DELETE FROM {} WHERE hash = $1 AND status = $2", self.table());

        let mut conn = self.db.write_conn().await?;
        let removed = diesel::sql_query(sql)
            .bind::<Text, _>(hash)
            .bind::<Text, _>(status.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel(&format!("remove {} transfer", status), e))?;

        // 记录可能已被并发流程推进，删除 0 行不算错误
        if removed == 0 {
            log_debug!("{}: 无需删除 {} 记录 {}", self.suffix, status, hash);
        }
        Ok(())
    }
}

fn status_rank(column: &str) -> String {
    format!(
        "(CASE {} WHEN 'pending' THEN 0 WHEN 'sending' THEN 1 ELSE 2 END)",
        column
    )
}

async fn insert_one(
    conn: &mut AsyncPgConnection,
    sql: &str,
    t: &Transfer,
) -> Result<usize, DieselError> {
    diesel::sql_query(sql)
        .bind::<Text, _>(&t.hash)
        .bind::<Nullable<Text>, _>(t.tx_hash.as_deref())
        .bind::<BigInt, _>(t.token_id)
        .bind::<Timestamptz, _>(t.created_at)
        .bind::<Text, _>(&t.from_to)
        .bind::<Text, _>(&t.from)
        .bind::<Text, _>(&t.to)
        .bind::<BigInt, _>(t.nonce)
        .bind::<Numeric, _>(&t.value)
        .bind::<Nullable<Binary>, _>(t.data.as_deref())
        .bind::<Text, _>(t.status.as_str())
        .execute(conn)
        .await
}

#[async_trait]
impl TransferRepository for PgTransferRepository {
    fn name(&self) -> &str {
        &self.suffix
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                hash TEXT NOT NULL PRIMARY KEY,
                tx_hash TEXT,
                token_id BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                from_to_addr TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                nonce BIGINT NOT NULL DEFAULT 0,
                value NUMERIC NOT NULL DEFAULT 0,
                data BYTEA,
                status TEXT NOT NULL DEFAULT 'success'
            )",
            self.table()
        );
        self.execute("create transfers table", sql).await?;
        log_info!("转账表已就绪: {}", self.table());
        Ok(())
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        let indexes = [
            ("txh", "tx_hash"),
            ("ft", "from_to_addr"),
            ("st", "status, created_at"),
        ];
        for (tag, columns) in indexes {
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                index_name(tag, &self.suffix),
                self.table(),
                columns
            );
            self.execute(&format!("create index on {}", columns), sql)
                .await?;
        }
        Ok(())
    }

    async fn add_transfer(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        let sql = self.insert_sql();
        let mut conn = self.db.write_conn().await?;
        insert_one(&mut *conn, &sql, transfer)
            .await
            .map_err(|e| StoreError::from_diesel(&format!("add transfer {}", transfer.hash), e))?;
        Ok(())
    }

    async fn add_transfers(&self, transfers: &[Transfer]) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        if transfers.is_empty() {
            return Ok(());
        }

        let sql = self.insert_sql();
        let rows = transfers.to_vec();
        let count = rows.len();
        self.db
            .execute_tx(move |conn| {
                Box::pin(async move {
                    for t in &rows {
                        insert_one(conn, &sql, t)
                            .await
                            .map_err(|e| StoreError::from_diesel(&format!("add transfer {}", t.hash), e))?;
                    }
                    Ok(())
                })
            })
            .await
            // 整批回滚，调用方整体重试
            .map_err(|e| StoreError::Storage(format!("批量插入 {} 条失败，已回滚: {}", count, e)))
    }

    async fn transfer_exists(&self, hash: &str) -> Result<bool, StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE hash = $1 OR tx_hash = $1) AS present",
            self.table()
        );

        // 结果决定后续写入，走主库避免副本延迟
        let mut conn = self.db.write_conn().await?;
        let row = diesel::sql_query(sql)
            .bind::<Text, _>(hash)
            .get_result::<ExistsRow>(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("transfer exists", e))?;
        Ok(row.present)
    }

    async fn get_transfer(&self, hash: &str) -> Result<Option<Transfer>, StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE hash = $1",
            TRANSFER_COLUMNS,
            self.table()
        );

        let mut conn = self.db.read_conn().await?;
        let row = diesel::sql_query(sql)
            .bind::<Text, _>(hash)
            .get_result::<TransferRow>(&mut *conn)
            .await
            .optional()
            .map_err(|e| StoreError::from_diesel("get transfer", e))?;
        row.map(Transfer::try_from).transpose()
    }

    async fn get_processing_transfers(&self, limit: i64) -> Result<Vec<Transfer>, StoreError> {
        self.base.ensure_open()?;
        let sql = format!(
            "SELECT {} FROM {}
             WHERE status IN ('pending', 'sending')
             ORDER BY created_at ASC, hash ASC
             LIMIT $1",
            TRANSFER_COLUMNS,
            self.table()
        );

        let mut conn = self.db.read_conn().await?;
        let rows = diesel::sql_query(sql)
            .bind::<BigInt, _>(limit.max(0))
            .load::<TransferRow>(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("get processing transfers", e))?;
        rows.into_iter().map(Transfer::try_from).collect()
    }

    async fn set_tx_hash(&self, tx_hash: &str, hash: &str) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        // 单条 UPDATE 同时改 tx_hash 和 status，读者看不到中间态
        let sql = format!(
            "UPDATE {} SET tx_hash = $1, status = 'sending' WHERE hash = $2 AND status = 'pending'",
            self.table()
        );

        let mut conn = self.db.write_conn().await?;
        let updated = diesel::sql_query(sql)
            .bind::<Text, _>(tx_hash)
            .bind::<Text, _>(hash)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("set tx hash", e))?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "{}: pending transfer {}",
                self.suffix, hash
            )));
        }
        Ok(())
    }

    async fn set_final_status(&self, hash: &str, status: TransferStatus) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        if !status.is_terminal() {
            return Err(StoreError::InvalidInput(format!(
                "{} 不是终态",
                status
            )));
        }
        let sql = format!(
            "UPDATE {} SET status = $1 WHERE hash = $2 AND status IN ('pending', 'sending')",
            self.table()
        );

        let mut conn = self.db.write_conn().await?;
        let updated = diesel::sql_query(sql)
            .bind::<Text, _>(status.as_str())
            .bind::<Text, _>(hash)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_diesel("set final status", e))?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "{}: in-flight transfer {}",
                self.suffix, hash
            )));
        }
        Ok(())
    }

    async fn reconcile_tx_hash(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        let tx_hash = transfer.tx_hash.clone().ok_or_else(|| {
            StoreError::InvalidInput(format!("transfer {} 缺少 tx_hash", transfer.hash))
        })?;

        let t = self.table().to_string();
        // 链上直接观察到的记录为准，只补齐它缺失的 data。
        // 同一笔交易里打包的其他 user op 仍在处理中，不是合并目标
        let merge_sql = format!(
            "UPDATE {} SET data = COALESCE(data, $1)
             WHERE (tx_hash = $2 OR hash = $2) AND hash <> $3
               AND (status NOT IN ('pending', 'sending') OR hash = $2)",
            t
        );
        let delete_sql = format!(
            "DELETE FROM {} WHERE hash = $1 AND status IN ('pending', 'sending')",
            t
        );
        let attach_sql = format!(
            "UPDATE {} SET tx_hash = $1, status = 'sending' WHERE hash = $2 AND status = 'pending'",
            t
        );
        let hash = transfer.hash.clone();
        let data = transfer.data.clone();

        self.db
            .execute_tx(move |conn| {
                Box::pin(async move {
                    let merged = diesel::sql_query(merge_sql)
                        .bind::<Nullable<Binary>, _>(data.as_deref())
                        .bind::<Text, _>(&tx_hash)
                        .bind::<Text, _>(&hash)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| StoreError::from_diesel("merge reconciled transfer", e))?;

                    if merged == 0 {
                        // 还没有观察到的记录，退化为挂载交易哈希
                        diesel::sql_query(attach_sql)
                            .bind::<Text, _>(&tx_hash)
                            .bind::<Text, _>(&hash)
                            .execute(&mut *conn)
                            .await
                            .map_err(|e| StoreError::from_diesel("attach tx hash", e))?;
                        return Ok(());
                    }

                    diesel::sql_query(delete_sql)
                        .bind::<Text, _>(&hash)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| StoreError::from_diesel("drop merged pending transfer", e))?;
                    Ok(())
                })
            })
            .await
    }

    async fn remove_pending_transfer(&self, hash: &str) -> Result<(), StoreError> {
        self.delete_with_status(hash, TransferStatus::Pending).await
    }

    async fn remove_sending_transfer(&self, hash: &str) -> Result<(), StoreError> {
        self.delete_with_status(hash, TransferStatus::Sending).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.base.mark_closed()
    }
}
