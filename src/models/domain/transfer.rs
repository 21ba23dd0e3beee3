use crate::errors::StoreError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 转账生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// 已提交，尚无交易哈希
    Pending,
    /// 已拿到交易哈希，等待最终确认
    Sending,
    Success,
    Fail,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Sending => "sending",
            TransferStatus::Success => "success",
            TransferStatus::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::Fail)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Sending)
    }

    /// 状态只能向前推进，success/fail 同级
    pub fn rank(&self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Sending => 1,
            TransferStatus::Success | TransferStatus::Fail => 2,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "sending" => Ok(TransferStatus::Sending),
            "success" => Ok(TransferStatus::Success),
            "fail" => Ok(TransferStatus::Fail),
            other => Err(StoreError::InvalidInput(format!("未知的转账状态: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// 提交时生成的操作哈希（唯一且不可变）
    pub hash: String,
    /// 链上确认后的交易哈希
    pub tx_hash: Option<String>,
    pub token_id: i64,
    /// 插入时写入，之后不再修改，所有超时判断都以它为准
    pub created_at: DateTime<Utc>,
    pub from_to: String,
    pub from: String,
    pub to: String,
    pub nonce: i64,
    pub value: BigDecimal,
    pub data: Option<Vec<u8>>,
    pub status: TransferStatus,
}

impl Transfer {
    /// 提交路径创建的待确认转账
    pub fn new_pending(
        hash: &str,
        token_id: i64,
        from: &str,
        to: &str,
        nonce: i64,
        value: BigDecimal,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            hash: hash.to_string(),
            tx_hash: None,
            token_id,
            created_at: Utc::now(),
            from_to: combine_addresses(from, to),
            from: from.to_lowercase(),
            to: to.to_lowercase(),
            nonce,
            value,
            data,
            status: TransferStatus::Pending,
        }
    }

    /// createdAt 距 now 是否已超过宽限期
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        match self.created_at.checked_add_signed(grace) {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// 双向查询用的组合键
pub fn combine_addresses(from: &str, to: &str) -> String {
    format!("{}_{}", from.to_lowercase(), to.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn pending_transfer_derives_from_to() {
        let t = Transfer::new_pending(
            "0xabc",
            0,
            "0xAAaa",
            "0xBBbb",
            1,
            BigDecimal::from_str("340282366920938463463374607431768211456").unwrap(),
            None,
        );
        assert_eq!(t.from_to, "0xaaaa_0xbbbb");
        assert_eq!(t.status, TransferStatus::Pending);
        assert!(t.tx_hash.is_none());
    }

    #[test]
    fn expiry_uses_created_at() {
        let mut t = Transfer::new_pending("0x1", 0, "a", "b", 0, BigDecimal::from(1), None);
        let now = Utc::now();
        t.created_at = now - chrono::Duration::seconds(10);
        assert!(!t.is_expired(now, Duration::from_secs(30)));
        t.created_at = now - chrono::Duration::seconds(31);
        assert!(t.is_expired(now, Duration::from_secs(30)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pending", "sending", "success", "fail"] {
            assert_eq!(TransferStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(TransferStatus::from_str("unknown").is_err());
    }
}
