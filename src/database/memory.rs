use crate::errors::StoreError;
use crate::log_info;
use crate::repositories::memory_repository::{MemoryEventRepository, MemoryTransferRepository};
use crate::repositories::traits::{EventRepository, StorageBackend, TransferRepository};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 进程内“数据库”：表句柄在重新打开注册表后依然保留
pub struct MemoryBackend {
    events: Arc<MemoryEventRepository>,
    with_conflict: bool,
    tables: Mutex<HashMap<String, Arc<MemoryTransferRepository>>>,
}

impl MemoryBackend {
    pub fn new(chain_id: u64, with_conflict: bool) -> Result<Self, StoreError> {
        log_info!("使用内存存储后端: chain={}", chain_id);
        Ok(Self {
            events: Arc::new(MemoryEventRepository::new(chain_id, with_conflict)?),
            with_conflict,
            tables: Mutex::new(HashMap::new()),
        })
    }

    fn table(&self, suffix: &str) -> Result<Arc<MemoryTransferRepository>, StoreError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| StoreError::Storage(format!("memory backend poisoned: {}", e)))?;
        if let Some(table) = tables.get(suffix) {
            return Ok(table.clone());
        }
        let table = Arc::new(MemoryTransferRepository::new(suffix, self.with_conflict)?);
        tables.insert(suffix.to_string(), table.clone());
        Ok(table)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn event_repository(&self) -> Arc<dyn EventRepository> {
        self.events.clone()
    }

    async fn event_table_exists(&self) -> Result<bool, StoreError> {
        Ok(self.events.table_created())
    }

    async fn transfer_table_exists(&self, suffix: &str) -> Result<bool, StoreError> {
        let tables = self
            .tables
            .lock()
            .map_err(|e| StoreError::Storage(format!("memory backend poisoned: {}", e)))?;
        Ok(tables.get(suffix).is_some_and(|t| t.table_created()))
    }

    fn transfer_repository(&self, suffix: &str) -> Result<Arc<dyn TransferRepository>, StoreError> {
        Ok(self.table(suffix)?)
    }
}
