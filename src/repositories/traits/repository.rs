use crate::errors::StoreError;
use crate::models::{Event, SyncState, Transfer, TransferStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// 每条链一张：被跟踪的合约及其同步状态
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create_table(&self) -> Result<(), StoreError>;
    async fn create_indexes(&self) -> Result<(), StoreError>;
    async fn add_event(&self, event: &Event) -> Result<(), StoreError>;
    async fn get_events(&self) -> Result<Vec<Event>, StoreError>;
    async fn get_event(&self, contract: &str) -> Result<Option<Event>, StoreError>;
    async fn set_sync_state(&self, contract: &str, state: SyncState) -> Result<(), StoreError>;
    async fn set_last_block(&self, contract: &str, last_block: i64) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

/// 每个合约一张：转账记录及其生命周期状态
#[async_trait]
pub trait TransferRepository: Send + Sync {
    /// `{chain_id}_{contract}`
    fn name(&self) -> &str;

    async fn create_table(&self) -> Result<(), StoreError>;
    async fn create_indexes(&self) -> Result<(), StoreError>;

    async fn add_transfer(&self, transfer: &Transfer) -> Result<(), StoreError>;
    /// 全部成功或全部回滚
    async fn add_transfers(&self, transfers: &[Transfer]) -> Result<(), StoreError>;

    /// 按 hash 或 tx_hash 判断是否存在
    async fn transfer_exists(&self, hash: &str) -> Result<bool, StoreError>;
    async fn get_transfer(&self, hash: &str) -> Result<Option<Transfer>, StoreError>;
    /// pending/sending 记录，按 created_at 升序，最多 limit 条
    async fn get_processing_transfers(&self, limit: i64) -> Result<Vec<Transfer>, StoreError>;

    /// pending → sending，同时写入交易哈希
    async fn set_tx_hash(&self, tx_hash: &str, hash: &str) -> Result<(), StoreError>;
    /// pending/sending → success/fail
    async fn set_final_status(&self, hash: &str, status: TransferStatus) -> Result<(), StoreError>;
    /// 交易哈希已作为独立记录存在时，合并后删除待确认记录（幂等）
    async fn reconcile_tx_hash(&self, transfer: &Transfer) -> Result<(), StoreError>;

    async fn remove_pending_transfer(&self, hash: &str) -> Result<(), StoreError>;
    async fn remove_sending_transfer(&self, hash: &str) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// 存储后端，注册表通过它创建表句柄
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn event_repository(&self) -> Arc<dyn EventRepository>;
    async fn event_table_exists(&self) -> Result<bool, StoreError>;
    async fn transfer_table_exists(&self, suffix: &str) -> Result<bool, StoreError>;
    /// 只构造句柄，不做任何 I/O
    fn transfer_repository(&self, suffix: &str) -> Result<Arc<dyn TransferRepository>, StoreError>;
}
