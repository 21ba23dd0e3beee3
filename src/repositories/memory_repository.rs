//! 内存实现，语义与 PostgreSQL 版本保持一致（本地演练与测试用）

use crate::errors::StoreError;
use crate::models::db::schema::{events_table, transfers_table};
use crate::models::{Event, SyncState, Transfer, TransferStatus};
use crate::repositories::base::RepositoryBase;
use crate::repositories::traits::{EventRepository, TransferRepository};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub struct MemoryEventRepository {
    base: RepositoryBase,
    created: AtomicBool,
    with_conflict: bool,
    /// 插入顺序 + 合约
    events: RwLock<Vec<Event>>,
}

impl MemoryEventRepository {
    pub fn new(chain_id: u64, with_conflict: bool) -> Result<Self, StoreError> {
        Ok(Self {
            base: RepositoryBase::new(events_table(chain_id))?,
            created: AtomicBool::new(false),
            with_conflict,
            events: RwLock::new(Vec::new()),
        })
    }

    pub fn table_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        if !self.table_created() {
            return Err(StoreError::Storage(format!(
                "relation {} does not exist",
                self.base.table()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn create_table(&self) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        self.created.store(true, Ordering::Release);
        Ok(())
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        self.ensure_ready()
    }

    async fn add_event(&self, event: &Event) -> Result<(), StoreError> {
        self.ensure_ready()?;
        event.validate()?;

        let contract = event.contract.to_lowercase();
        let mut events = self.events.write().await;
        if let Some(existing) = events.iter_mut().find(|e| e.contract == contract) {
            if !self.with_conflict {
                return Err(StoreError::Duplicate(format!("event {}", contract)));
            }
            existing.standard = event.standard;
            existing.name = event.name.clone();
            existing.symbol = event.symbol.clone();
            return Ok(());
        }

        let mut stored = event.clone();
        stored.contract = contract;
        events.push(stored);
        Ok(())
    }

    async fn get_events(&self) -> Result<Vec<Event>, StoreError> {
        self.ensure_ready()?;
        Ok(self.events.read().await.clone())
    }

    async fn get_event(&self, contract: &str) -> Result<Option<Event>, StoreError> {
        self.ensure_ready()?;
        let contract = contract.to_lowercase();
        let events = self.events.read().await;
        Ok(events.iter().find(|e| e.contract == contract).cloned())
    }

    async fn set_sync_state(&self, contract: &str, state: SyncState) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let contract = contract.to_lowercase();
        let mut events = self.events.write().await;
        let event = events
            .iter_mut()
            .find(|e| e.contract == contract)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", contract)))?;
        event.state = state;
        Ok(())
    }

    async fn set_last_block(&self, contract: &str, last_block: i64) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let contract = contract.to_lowercase();
        let mut events = self.events.write().await;
        let event = events
            .iter_mut()
            .find(|e| e.contract == contract)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", contract)))?;
        if last_block < event.start_block {
            return Err(StoreError::InvalidInput(format!(
                "合约 {}: last_block({}) < start_block({})",
                contract, last_block, event.start_block
            )));
        }
        event.last_block = last_block;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.base.mark_closed()
    }
}

pub struct MemoryTransferRepository {
    base: RepositoryBase,
    suffix: String,
    created: AtomicBool,
    with_conflict: bool,
    rows: RwLock<BTreeMap<String, Transfer>>,
}

impl MemoryTransferRepository {
    pub fn new(suffix: &str, with_conflict: bool) -> Result<Self, StoreError> {
        Ok(Self {
            base: RepositoryBase::new(transfers_table(suffix))?,
            suffix: suffix.to_string(),
            created: AtomicBool::new(false),
            with_conflict,
            rows: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn table_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        if !self.table_created() {
            return Err(StoreError::Storage(format!(
                "relation {} does not exist",
                self.base.table()
            )));
        }
        Ok(())
    }

    /// 与 ON CONFLICT (hash) DO UPDATE 相同的合并规则
    fn upsert(&self, rows: &mut BTreeMap<String, Transfer>, t: &Transfer) -> Result<(), StoreError> {
        let Some(existing) = rows.get_mut(&t.hash) else {
            rows.insert(t.hash.clone(), t.clone());
            return Ok(());
        };
        if !self.with_conflict {
            return Err(StoreError::Duplicate(format!("{}: transfer {}", self.suffix, t.hash)));
        }
        if existing.status.is_terminal() {
            return Ok(());
        }
        if t.tx_hash.is_some() {
            existing.tx_hash = t.tx_hash.clone();
        }
        if t.data.is_some() {
            existing.data = t.data.clone();
        }
        if t.status.rank() >= existing.status.rank() {
            existing.status = t.status;
        }
        Ok(())
    }

    async fn delete_with_status(&self, hash: &str, status: TransferStatus) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let mut rows = self.rows.write().await;
        if rows.get(hash).is_some_and(|t| t.status == status) {
            rows.remove(hash);
        }
        Ok(())
    }
}

#[async_trait]
impl TransferRepository for MemoryTransferRepository {
    fn name(&self) -> &str {
        &self.suffix
    }

    async fn create_table(&self) -> Result<(), StoreError> {
        self.base.ensure_open()?;
        self.created.store(true, Ordering::Release);
        Ok(())
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        self.ensure_ready()
    }

    async fn add_transfer(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let mut rows = self.rows.write().await;
        self.upsert(&mut rows, transfer)
    }

    async fn add_transfers(&self, transfers: &[Transfer]) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let mut rows = self.rows.write().await;
        // 在副本上操作，成功后整体替换，模拟事务回滚
        let mut staged = rows.clone();
        for t in transfers {
            self.upsert(&mut staged, t).map_err(|e| {
                StoreError::Storage(format!(
                    "批量插入 {} 条失败，已回滚: {}",
                    transfers.len(),
                    e
                ))
            })?;
        }
        *rows = staged;
        Ok(())
    }

    async fn transfer_exists(&self, hash: &str) -> Result<bool, StoreError> {
        self.ensure_ready()?;
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .any(|t| t.hash == hash || t.tx_hash.as_deref() == Some(hash)))
    }

    async fn get_transfer(&self, hash: &str) -> Result<Option<Transfer>, StoreError> {
        self.ensure_ready()?;
        Ok(self.rows.read().await.get(hash).cloned())
    }

    async fn get_processing_transfers(&self, limit: i64) -> Result<Vec<Transfer>, StoreError> {
        self.ensure_ready()?;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let rows = self.rows.read().await;
        let mut processing: Vec<Transfer> = rows
            .values()
            .filter(|t| t.status.is_processing())
            .cloned()
            .collect();
        processing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.hash.cmp(&b.hash)));
        processing.truncate(limit);
        Ok(processing)
    }

    async fn set_tx_hash(&self, tx_hash: &str, hash: &str) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let mut rows = self.rows.write().await;
        match rows.get_mut(hash) {
            Some(t) if t.status == TransferStatus::Pending => {
                t.tx_hash = Some(tx_hash.to_string());
                t.status = TransferStatus::Sending;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!(
                "{}: pending transfer {}",
                self.suffix, hash
            ))),
        }
    }

    async fn set_final_status(&self, hash: &str, status: TransferStatus) -> Result<(), StoreError> {
        self.ensure_ready()?;
        if !status.is_terminal() {
            return Err(StoreError::InvalidInput(format!("{} 不是终态", status)));
        }
        let mut rows = self.rows.write().await;
        match rows.get_mut(hash) {
            Some(t) if t.status.is_processing() => {
                t.status = status;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!(
                "{}: in-flight transfer {}",
                self.suffix, hash
            ))),
        }
    }

    async fn reconcile_tx_hash(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.ensure_ready()?;
        let tx_hash = transfer.tx_hash.as_deref().ok_or_else(|| {
            StoreError::InvalidInput(format!("transfer {} 缺少 tx_hash", transfer.hash))
        })?;

        let mut rows = self.rows.write().await;
        let mut merged = 0;
        for t in rows.values_mut() {
            let matches = t.tx_hash.as_deref() == Some(tx_hash) || t.hash == tx_hash;
            // 同一交易中仍在处理的其他操作不算观察到的记录
            let observed = !t.status.is_processing() || t.hash == tx_hash;
            if matches && observed && t.hash != transfer.hash {
                if t.data.is_none() {
                    t.data = transfer.data.clone();
                }
                merged += 1;
            }
        }

        if merged == 0 {
            if let Some(t) = rows.get_mut(&transfer.hash) {
                if t.status == TransferStatus::Pending {
                    t.tx_hash = Some(tx_hash.to_string());
                    t.status = TransferStatus::Sending;
                }
            }
            return Ok(());
        }

        if rows.get(&transfer.hash).is_some_and(|t| t.status.is_processing()) {
            rows.remove(&transfer.hash);
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{Duration, Utc};
    use std::str::FromStr;

    async fn store(with_conflict: bool) -> MemoryTransferRepository {
        let repo = MemoryTransferRepository::new("0_0xsomecontract", with_conflict).unwrap();
        repo.create_table().await.unwrap();
        repo.create_indexes().await.unwrap();
        repo
    }

    fn pending(hash: &str) -> Transfer {
        Transfer::new_pending(hash, 0, "0xFrom", "0xTo", 0, BigDecimal::from(1_000_000_000), None)
    }

    #[tokio::test]
    async fn operations_fail_before_table_exists() {
        let repo = MemoryTransferRepository::new("0_0xnotable", false).unwrap();
        let err = repo.add_transfer(&pending("h1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn exists_matches_hash_and_tx_hash() {
        let repo = store(false).await;
        let mut t = pending("someHash");
        t.tx_hash = Some("someTxHash".into());
        repo.add_transfer(&t).await.unwrap();

        assert!(repo.transfer_exists("someHash").await.unwrap());
        assert!(repo.transfer_exists("someTxHash").await.unwrap());
        assert!(!repo.transfer_exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_insert_without_conflict_handling() {
        let repo = store(false).await;
        repo.add_transfer(&pending("h1")).await.unwrap();
        let err = repo.add_transfer(&pending("h1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let repo = store(false).await;
        repo.add_transfer(&pending("h1")).await.unwrap();

        let err = repo
            .add_transfers(&[pending("h2"), pending("h1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert!(repo.get_transfer("h2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflict_upsert_never_moves_backwards() {
        let repo = store(true).await;
        let original = pending("h1");
        repo.add_transfer(&original).await.unwrap();

        let mut replay = pending("h1");
        replay.created_at = original.created_at + Duration::seconds(60);
        replay.tx_hash = Some("t1".into());
        replay.status = TransferStatus::Sending;
        repo.add_transfer(&replay).await.unwrap();

        let mut stale = pending("h1");
        stale.status = TransferStatus::Pending;
        repo.add_transfer(&stale).await.unwrap();

        let stored = repo.get_transfer("h1").await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Sending);
        assert_eq!(stored.tx_hash.as_deref(), Some("t1"));
        assert_eq!(stored.created_at, original.created_at);
    }

    #[tokio::test]
    async fn processing_transfers_are_oldest_first_and_bounded() {
        let repo = store(false).await;
        let now = Utc::now();
        for (i, hash) in ["c", "a", "b"].iter().enumerate() {
            let mut t = pending(hash);
            t.created_at = now - Duration::seconds(i as i64 * 10);
            repo.add_transfer(&t).await.unwrap();
        }
        let mut done = pending("d");
        done.status = TransferStatus::Success;
        done.created_at = now - Duration::seconds(100);
        repo.add_transfer(&done).await.unwrap();

        let got = repo.get_processing_transfers(2).await.unwrap();
        let hashes: Vec<_> = got.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn set_tx_hash_only_moves_pending() {
        let repo = store(false).await;
        repo.add_transfer(&pending("h1")).await.unwrap();

        repo.set_tx_hash("t1", "h1").await.unwrap();
        let stored = repo.get_transfer("h1").await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Sending);
        assert_eq!(stored.tx_hash.as_deref(), Some("t1"));

        assert!(matches!(
            repo.set_tx_hash("t2", "h1").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.set_tx_hash("t2", "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn final_status_requires_terminal_target() {
        let repo = store(false).await;
        repo.add_transfer(&pending("h1")).await.unwrap();

        assert!(matches!(
            repo.set_final_status("h1", TransferStatus::Sending).await,
            Err(StoreError::InvalidInput(_))
        ));
        repo.set_final_status("h1", TransferStatus::Success).await.unwrap();
        assert!(matches!(
            repo.set_final_status("h1", TransferStatus::Fail).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_merges_into_observed_record_idempotently() {
        let repo = store(false).await;
        let mut observed = pending("log_t1_0");
        observed.tx_hash = Some("t1".into());
        observed.status = TransferStatus::Success;
        repo.add_transfer(&observed).await.unwrap();

        let mut p = pending("h1");
        p.data = Some(b"memo".to_vec());
        p.value = BigDecimal::from_str("115792089237316195423570985008687907853269984665640564039457").unwrap();
        repo.add_transfer(&p).await.unwrap();
        p.tx_hash = Some("t1".into());

        repo.reconcile_tx_hash(&p).await.unwrap();
        let once = repo.rows.read().await.clone();
        repo.reconcile_tx_hash(&p).await.unwrap();
        let twice = repo.rows.read().await.clone();

        assert_eq!(once, twice);
        assert!(!twice.contains_key("h1"));
        let merged = &twice["log_t1_0"];
        assert_eq!(merged.data.as_deref(), Some(&b"memo"[..]));
        assert_eq!(merged.status, TransferStatus::Success);
    }

    #[tokio::test]
    async fn reconcile_without_target_attaches_hash() {
        let repo = store(false).await;
        let mut p = pending("h1");
        repo.add_transfer(&p).await.unwrap();
        p.tx_hash = Some("t1".into());

        repo.reconcile_tx_hash(&p).await.unwrap();
        let stored = repo.get_transfer("h1").await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Sending);
        assert_eq!(stored.tx_hash.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn reconcile_leaves_sibling_operation_in_same_transaction() {
        let repo = store(false).await;
        let mut h0 = pending("h0");
        repo.add_transfer(&h0).await.unwrap();
        repo.set_tx_hash("t1", "h0").await.unwrap();
        h0.tx_hash = Some("t1".into());

        // 同一笔交易打包的第二个操作
        let mut h1 = Transfer::new_pending("h1", 0, "0xother", "0xto", 2, BigDecimal::from(7), None);
        repo.add_transfer(&h1).await.unwrap();
        h1.tx_hash = Some("t1".into());

        repo.reconcile_tx_hash(&h1).await.unwrap();

        for hash in ["h0", "h1"] {
            let t = repo.get_transfer(hash).await.unwrap().unwrap();
            assert_eq!(t.status, TransferStatus::Sending);
            assert_eq!(t.tx_hash.as_deref(), Some("t1"));
        }
    }

    #[tokio::test]
    async fn removal_respects_status() {
        let repo = store(false).await;
        repo.add_transfer(&pending("h1")).await.unwrap();

        repo.remove_sending_transfer("h1").await.unwrap();
        assert!(repo.get_transfer("h1").await.unwrap().is_some());

        repo.remove_pending_transfer("h1").await.unwrap();
        assert!(repo.get_transfer("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_store_tracks_contracts() {
        let events = MemoryEventRepository::new(0, false).unwrap();
        events.create_table().await.unwrap();
        events
            .add_event(&Event::new("someContract", SyncState::Queued, 0, 1, crate::models::Standard::Erc20, "foo", "bar"))
            .await
            .unwrap();

        let all = events.get_events().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].start_block, 0);
        assert_eq!(all[0].contract, "somecontract");

        assert!(matches!(
            events
                .add_event(&Event::new("SOMECONTRACT", SyncState::Queued, 0, 1, crate::models::Standard::Erc20, "foo", "bar"))
                .await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(matches!(
            events.set_last_block("someContract", -1).await,
            Err(StoreError::InvalidInput(_))
        ));
        events.set_last_block("someContract", 42).await.unwrap();
        events.set_sync_state("someContract", SyncState::Synced).await.unwrap();
        let ev = events.get_event("somecontract").await.unwrap().unwrap();
        assert_eq!(ev.last_block, 42);
        assert_eq!(ev.state, SyncState::Synced);
    }
}
