use crate::errors::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 合约代币标准
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Standard {
    Erc20,
    Erc721,
    Erc1155,
}

/// 事件同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Queued,
    Syncing,
    Synced,
    Error,
}

impl Standard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Standard::Erc20 => "erc20",
            Standard::Erc721 => "erc721",
            Standard::Erc1155 => "erc1155",
        }
    }
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Queued => "queued",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for Standard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Standard {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erc20" => Ok(Standard::Erc20),
            "erc721" => Ok(Standard::Erc721),
            "erc1155" => Ok(Standard::Erc1155),
            other => Err(StoreError::InvalidInput(format!("未知的代币标准: {}", other))),
        }
    }
}

impl FromStr for SyncState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SyncState::Queued),
            "syncing" => Ok(SyncState::Syncing),
            "synced" => Ok(SyncState::Synced),
            "error" => Ok(SyncState::Error),
            other => Err(StoreError::InvalidInput(format!("未知的同步状态: {}", other))),
        }
    }
}

/// 一条链上被跟踪的合约
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub contract: String,
    pub state: SyncState,
    pub start_block: i64,
    pub last_block: i64,
    pub standard: Standard,
    pub name: String,
    pub symbol: String,
}

impl Event {
    pub fn new(
        contract: &str,
        state: SyncState,
        start_block: i64,
        last_block: i64,
        standard: Standard,
        name: &str,
        symbol: &str,
    ) -> Self {
        Self {
            contract: contract.to_lowercase(),
            state,
            start_block,
            last_block,
            standard,
            name: name.to_string(),
            symbol: symbol.to_string(),
        }
    }

    /// lastBlock 不得小于 startBlock
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.last_block < self.start_block {
            return Err(StoreError::InvalidInput(format!(
                "合约 {}: last_block({}) < start_block({})",
                self.contract, self.last_block, self.start_block
            )));
        }
        Ok(())
    }
}
