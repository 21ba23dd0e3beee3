use crate::config::ReconcilerConfig;
use crate::errors::{ReconcileError, RelayError};
use crate::infrastructure::relay::RelayClient;
use crate::models::{Event, Transfer, TransferStatus};
use crate::repositories::{StoreRegistry, TransferRepository};
use crate::{log_debug, log_error, log_info, log_warn};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 后台循环所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Running,
    Sleeping,
    /// 遇到不可恢复错误后退出
    Failed,
}

/// 把 pending/sending 记录推进到终态，或在宽限期后清理掉
pub struct Reconciler {
    config: ReconcilerConfig,
    registry: Arc<StoreRegistry>,
    relay: Arc<dyn RelayClient>,
    cancel: CancellationToken,
    state: watch::Sender<ReconcilerState>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        registry: Arc<StoreRegistry>,
        relay: Arc<dyn RelayClient>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Idle);
        Self {
            config,
            registry,
            relay,
            cancel,
            state,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// 读取当前所有合约并跑一轮
    pub async fn start(&self) -> Result<(), ReconcileError> {
        let events = self.registry.event_store().get_events().await?;
        self.process(&events).await
    }

    /// 可恢复错误：短暂等待后重跑同一轮；成功：等待同步间隔；其余错误：退出
    pub async fn background(&self) -> Result<(), ReconcileError> {
        log_info!(
            "对账服务启动: chain={}, rate={}, interval={}s, grace={}s",
            self.registry.chain_id(),
            self.config.rate,
            self.config.sync_interval_secs,
            self.config.grace_window_secs
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state.send_replace(ReconcilerState::Running);
            let delay = match self.start().await {
                Ok(()) => self.config.sync_interval(),
                Err(ReconcileError::Cancelled) => break,
                Err(e) if e.is_recoverable() => {
                    log_warn!("对账可恢复错误，稍后重试: {}", e);
                    self.config.retry_delay()
                }
                Err(e) => {
                    log_error!("对账不可恢复错误，后台循环退出: {}", e);
                    self.state.send_replace(ReconcilerState::Failed);
                    return Err(e);
                }
            };

            self.state.send_replace(ReconcilerState::Sleeping);
            if !self.sleep(delay).await {
                break;
            }
        }

        log_info!("对账服务已停止");
        self.state.send_replace(ReconcilerState::Idle);
        Ok(())
    }

    /// 被取消时返回 false
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// 按列表顺序逐个合约处理；任何未处理的错误都会中止本轮
    pub async fn process(&self, events: &[Event]) -> Result<(), ReconcileError> {
        if events.is_empty() {
            return Ok(());
        }

        let limit = i64::try_from(self.config.rate).unwrap_or(i64::MAX);
        for ev in events {
            log_debug!("对账合约: {} ({})", ev.contract, ev.standard);

            // 启动后才登记的合约在这里补建转账表
            let store = self.registry.get_or_create_transfer_store(&ev.contract).await?;

            let txs = store.get_processing_transfers(limit).await?;
            if txs.is_empty() {
                continue;
            }
            log_info!("{}: {} 条记录待对账", store.name(), txs.len());

            for tx in &txs {
                self.clean_up_sending(store.as_ref(), tx).await?;
            }

            for tx in txs.iter().filter(|t| t.status == TransferStatus::Pending) {
                if self.cancel.is_cancelled() {
                    return Err(ReconcileError::Cancelled);
                }
                self.resolve_pending(store.as_ref(), tx).await?;
            }
        }

        Ok(())
    }

    /// sending 超过宽限期仍未确认，视为放弃而不是失败
    async fn clean_up_sending(
        &self,
        store: &dyn TransferRepository,
        tx: &Transfer,
    ) -> Result<(), ReconcileError> {
        if tx.status != TransferStatus::Sending {
            return Ok(());
        }
        if !tx.is_expired(Utc::now(), self.config.grace_window()) {
            return Ok(());
        }

        log_warn!("{}: 清理超时的 sending 记录 {}", store.name(), tx.hash);
        store.remove_sending_transfer(&tx.hash).await?;
        Ok(())
    }

    async fn resolve_pending(
        &self,
        store: &dyn TransferRepository,
        tx: &Transfer,
    ) -> Result<(), ReconcileError> {
        match self.relay.resolve_operation(&tx.hash).await {
            Ok(op) => reconcile_pending(store, tx, &op.transaction_hash).await,
            Err(RelayError::OperationNotFound(reason)) => {
                if !tx.is_expired(Utc::now(), self.config.grace_window()) {
                    // 仍在正常传播延迟内
                    log_debug!("{}: 操作暂未找到 {}: {}", store.name(), tx.hash, reason);
                    return Ok(());
                }
                log_info!("{}: 清理未提交的 pending 记录 {}", store.name(), tx.hash);
                store.remove_pending_transfer(&tx.hash).await?;
                Ok(())
            }
            Err(e) => Err(ReconcileError::Recoverable(e)),
        }
    }
}

/// 交易哈希已有独立记录则合并，否则 pending → sending
async fn reconcile_pending(
    store: &dyn TransferRepository,
    tx: &Transfer,
    tx_hash: &str,
) -> Result<(), ReconcileError> {
    if store.transfer_exists(tx_hash).await? {
        let mut merged = tx.clone();
        merged.tx_hash = Some(tx_hash.to_string());
        store.reconcile_tx_hash(&merged).await?;
        log_info!("{}: {} 按已有交易哈希 {} 对账", store.name(), tx.hash, tx_hash);
        return Ok(());
    }

    store.set_tx_hash(tx_hash, &tx.hash).await?;
    log_info!("{}: {} → sending ({})", store.name(), tx.hash, tx_hash);
    Ok(())
}
