use crate::config::{DatabaseConfig, StorageBackendKind};
use crate::database::{MemoryBackend, PgBackend};
use crate::errors::StoreError;
use crate::models::db::schema::transfer_suffix;
use crate::repositories::traits::{EventRepository, StorageBackend, TransferRepository};
use crate::{log_error, log_info};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// 持有主/从连接与所有合约转账表句柄，每个合约最多一个句柄
pub struct StoreRegistry {
    chain_id: u64,
    backend: Arc<dyn StorageBackend>,
    events: Arc<dyn EventRepository>,
    /// `{chain_id}_{lowercase(contract)}` → 转账表
    stores: Mutex<HashMap<String, Arc<dyn TransferRepository>>>,
    closed: AtomicBool,
}

impl StoreRegistry {
    /// 按配置连接后端（PostgreSQL 会分别 ping 主库与副本）
    pub async fn open(chain_id: u64, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            StorageBackendKind::Postgres => Arc::new(PgBackend::connect(chain_id, config).await?),
            StorageBackendKind::Memory => {
                Arc::new(MemoryBackend::new(chain_id, config.with_conflict)?)
            }
        };
        Self::with_backend(chain_id, backend).await
    }

    /// 建事件表（如不存在），并为已登记的每个合约预先建好转账表，
    /// 避免第一轮对账时表还不存在
    pub async fn with_backend(
        chain_id: u64,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, StoreError> {
        let events = backend.event_repository();
        if !backend.event_table_exists().await? {
            events.create_table().await?;
            events.create_indexes().await?;
        }

        let mut stores = HashMap::new();
        for ev in events.get_events().await? {
            let suffix = transfer_suffix(chain_id, &ev.contract)?;
            log_info!("加载转账表: {}", suffix);
            let store = ensure_table(backend.as_ref(), &suffix).await?;
            stores.insert(suffix, store);
        }
        log_info!("存储注册表就绪: chain={}, contracts={}", chain_id, stores.len());

        Ok(Self {
            chain_id,
            backend,
            events,
            stores: Mutex::new(stores),
            closed: AtomicBool::new(false),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn event_store(&self) -> Arc<dyn EventRepository> {
        self.events.clone()
    }

    pub async fn get_transfer_store(
        &self,
        contract: &str,
    ) -> Result<Option<Arc<dyn TransferRepository>>, StoreError> {
        self.ensure_open()?;
        let suffix = transfer_suffix(self.chain_id, contract)?;
        Ok(self.stores.lock().await.get(&suffix).cloned())
    }

    /// 整个查找-建表-登记过程持有同一把锁；建表每个合约只发生一次，竞争很低
    pub async fn get_or_create_transfer_store(
        &self,
        contract: &str,
    ) -> Result<Arc<dyn TransferRepository>, StoreError> {
        self.ensure_open()?;
        let suffix = transfer_suffix(self.chain_id, contract)?;

        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&suffix) {
            return Ok(store.clone());
        }

        log_info!("新合约，创建转账表: {}", suffix);
        let store = ensure_table(self.backend.as_ref(), &suffix).await?;
        stores.insert(suffix, store.clone());
        Ok(store)
    }

    /// 先关所有转账表再关事件表；单个失败不影响其余，返回遇到的第一个错误
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Io("registry already closed".to_string()));
        }

        let mut first_err: Option<StoreError> = None;
        let mut stores = self.stores.lock().await;
        for (name, store) in stores.drain() {
            if let Err(e) = store.close().await {
                log_error!("关闭转账表 {} 失败: {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.events.close().await {
            log_error!("关闭事件表失败: {}", e);
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Io("registry closed".to_string()));
        }
        Ok(())
    }
}

/// 检查后再建表和索引
async fn ensure_table(
    backend: &dyn StorageBackend,
    suffix: &str,
) -> Result<Arc<dyn TransferRepository>, StoreError> {
    let store = backend.transfer_repository(suffix)?;
    if !backend.transfer_table_exists(suffix).await? {
        store.create_table().await?;
        store.create_indexes().await?;
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, Standard, SyncState};

    async fn registry_with(contracts: &[&str]) -> (Arc<MemoryBackend>, StoreRegistry) {
        let backend = Arc::new(MemoryBackend::new(0, false).unwrap());
        let events = backend.event_repository();
        events.create_table().await.unwrap();
        for c in contracts {
            events
                .add_event(&Event::new(c, SyncState::Synced, 0, 10, Standard::Erc20, "Token", "TKN"))
                .await
                .unwrap();
        }
        let registry = StoreRegistry::with_backend(0, backend.clone()).await.unwrap();
        (backend, registry)
    }

    #[tokio::test]
    async fn open_creates_tables_for_known_contracts() {
        let (backend, registry) = registry_with(&["0xAAA", "0xbbb"]).await;

        assert!(backend.transfer_table_exists("0_0xaaa").await.unwrap());
        assert!(backend.transfer_table_exists("0_0xbbb").await.unwrap());
        assert!(registry.get_transfer_store("0xaaa").await.unwrap().is_some());
        assert!(registry.get_transfer_store("0xccc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_table_is_created_when_missing() {
        let backend = Arc::new(MemoryBackend::new(5, false).unwrap());
        assert!(!backend.event_table_exists().await.unwrap());

        let registry = StoreRegistry::with_backend(5, backend.clone()).await.unwrap();
        assert!(backend.event_table_exists().await.unwrap());
        assert!(registry.event_store().get_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_store() {
        let (backend, registry) = registry_with(&[]).await;
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            // 大小写不同的同一个合约
            let contract = if i % 2 == 0 { "0xNEW" } else { "0xnew" };
            handles.push(tokio::spawn(async move {
                registry.get_or_create_transfer_store(contract).await.unwrap()
            }));
        }

        let mut stores = Vec::new();
        for h in handles {
            stores.push(h.await.unwrap());
        }
        let first = Arc::as_ptr(&stores[0]) as *const ();
        assert!(stores.iter().all(|s| Arc::as_ptr(s) as *const () == first));
        assert!(backend.transfer_table_exists("0_0xnew").await.unwrap());
        assert_eq!(stores[0].name(), "0_0xnew");
    }

    #[tokio::test]
    async fn close_is_surfaced_and_blocks_further_use() {
        let (_backend, registry) = registry_with(&["0xaaa"]).await;
        let store = registry.get_or_create_transfer_store("0xaaa").await.unwrap();

        registry.close().await.unwrap();
        assert!(matches!(store.get_processing_transfers(10).await, Err(StoreError::Io(_))));
        assert!(matches!(
            registry.get_or_create_transfer_store("0xaaa").await,
            Err(StoreError::Io(_))
        ));
        assert!(matches!(registry.close().await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn close_reports_first_error_but_closes_everything() {
        let (_backend, registry) = registry_with(&["0xaaa", "0xbbb"]).await;
        let a = registry.get_or_create_transfer_store("0xaaa").await.unwrap();
        let b = registry.get_or_create_transfer_store("0xbbb").await.unwrap();
        // 提前关掉一个，注册表关闭时它会报错
        a.close().await.unwrap();

        assert!(matches!(registry.close().await, Err(StoreError::Io(_))));
        assert!(matches!(b.get_transfer("x").await, Err(StoreError::Io(_))));
        assert!(matches!(
            registry.event_store().get_events().await,
            Err(StoreError::Io(_))
        ));
    }

    #[tokio::test]
    async fn ten_digit_chain_ids_open_and_reopen() {
        let chain_id = 1313161554;
        let contract = "0x5815E61eF72c9E6107b5c5A05FD121F334f7a7f1";
        let backend = Arc::new(MemoryBackend::new(chain_id, false).unwrap());

        let registry = StoreRegistry::with_backend(chain_id, backend.clone()).await.unwrap();
        registry
            .event_store()
            .add_event(&Event::new(contract, SyncState::Synced, 0, 10, Standard::Erc20, "Token", "TKN"))
            .await
            .unwrap();
        let store = registry.get_or_create_transfer_store(contract).await.unwrap();
        assert_eq!(store.name(), "1313161554_0x5815e61ef72c9e6107b5c5a05fd121f334f7a7f1");

        // 重新打开时会为已登记的合约预建表
        let reopened = StoreRegistry::with_backend(chain_id, backend.clone()).await.unwrap();
        assert!(reopened.get_transfer_store(contract).await.unwrap().is_some());
        assert!(backend.transfer_table_exists(store.name()).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_contract_is_rejected() {
        let (_backend, registry) = registry_with(&[]).await;
        assert!(matches!(
            registry.get_or_create_transfer_store("0x1'; drop table x; --").await,
            Err(StoreError::InvalidInput(_))
        ));
    }
}
