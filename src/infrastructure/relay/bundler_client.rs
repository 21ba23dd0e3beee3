use crate::config::RelayConfig;
use crate::errors::{AppError, RelayError};
use crate::{log_info, log_warn};
use crate::utils::normalize_tx_hash;
use async_trait::async_trait;
use ethers_providers::{Http, Provider, ProviderError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const GET_USER_OPERATION_BY_HASH: &str = "eth_getUserOperationByHash";
/// bundler 对未知/非法 userOpHash 返回的错误信息
const INVALID_USER_OP_MESSAGE: &str = "missing/invalid userophash";

/// 把提交时的操作哈希解析为链上交易哈希
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn resolve_operation(&self, hash: &str) -> Result<ResolvedOperation, RelayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOperation {
    pub transaction_hash: String,
}

/// `eth_getUserOperationByHash` 的返回（只取需要的字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationResult {
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub block_number: Option<serde_json::Value>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

impl UserOperationResult {
    /// 没有交易哈希说明还未上链，按“未找到”处理
    pub fn into_resolved(self, hash: &str) -> Result<ResolvedOperation, RelayError> {
        let raw = self
            .transaction_hash
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| RelayError::OperationNotFound(format!("{} 尚无交易哈希", hash)))?;
        // 无效哈希重试也不会变好，按未找到处理，过了宽限期自然清理
        let Some(transaction_hash) = normalize_tx_hash(&raw) else {
            log_warn!("中继对 {} 返回了无效的交易哈希: {}", hash, raw);
            return Err(RelayError::OperationNotFound(format!("{} 交易哈希无效: {}", hash, raw)));
        };
        Ok(ResolvedOperation { transaction_hash })
    }
}

pub struct BundlerClient {
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl BundlerClient {
    pub fn new(config: &RelayConfig) -> Result<Self, AppError> {
        let url = Url::parse(&config.rpc_url)
            .map_err(|e| AppError::Internal(format!("无效的中继 URL {}: {}", config.rpc_url, e)))?;
        let provider = Provider::<Http>::try_from(url.as_str())
            .map_err(|e| AppError::Internal(format!("无效的中继 URL {}: {}", config.rpc_url, e)))?;

        log_info!("中继客户端已初始化: {}", url.host_str().unwrap_or("unknown"));
        Ok(Self {
            provider,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }
}

/// 只有“找不到该操作”是预期错误，其余一律视为临时错误
pub fn classify_provider_error(hash: &str, err: &ProviderError) -> RelayError {
    let message = err.to_string();
    if message.to_lowercase().contains(INVALID_USER_OP_MESSAGE) {
        RelayError::OperationNotFound(format!("{}: {}", hash, message))
    } else {
        RelayError::Transient(format!("{}: {}", hash, message))
    }
}

#[async_trait]
impl RelayClient for BundlerClient {
    async fn resolve_operation(&self, hash: &str) -> Result<ResolvedOperation, RelayError> {
        let request = self
            .provider
            .request::<_, Option<UserOperationResult>>(GET_USER_OPERATION_BY_HASH, [hash]);

        let result = timeout(self.request_timeout, request)
            .await
            .map_err(|_| RelayError::Transient(format!("{}: 中继请求超时", hash)))?
            .map_err(|e| classify_provider_error(hash, &e))?;

        match result {
            Some(op) => op.into_resolved(hash),
            None => Err(RelayError::OperationNotFound(hash.to_string())),
        }
    }
}
