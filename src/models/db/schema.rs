//! 动态表命名：每条链一张事件表，每个合约一张转账表
//!
//! 表名会直接拼进 SQL，因此只允许 ASCII 字母数字和下划线。
//! 超过 PostgreSQL 标识符上限的名字截断后追加完整名字的 keccak 摘要，
//! 保证同一后缀总是得到同一个表名。

use crate::errors::StoreError;
use ethers_core::utils::keccak256;

pub const EVENTS_TABLE_PREFIX: &str = "t_events_";
pub const TRANSFERS_TABLE_PREFIX: &str = "t_transfers_";

/// PostgreSQL 标识符最大长度
const MAX_IDENTIFIER_LEN: usize = 63;
/// 截断时保留的摘要字节数（十六进制后 8 个字符）
const DIGEST_BYTES: usize = 4;
/// 合约后缀上限，挡住明显的垃圾输入
const MAX_SUFFIX_LEN: usize = 128;

/// `{chain_id}_{lowercase(contract)}`，注册表与转账表共用的键
pub fn transfer_suffix(chain_id: u64, contract: &str) -> Result<String, StoreError> {
    let contract = contract.trim();
    if contract.is_empty() {
        return Err(StoreError::InvalidInput("合约地址为空".to_string()));
    }
    let suffix = format!("{}_{}", chain_id, contract.to_lowercase());
    if suffix.len() > MAX_SUFFIX_LEN {
        return Err(StoreError::InvalidInput(format!(
            "合约地址过长({}): {}",
            contract.len(),
            contract
        )));
    }
    // 截断前先校验字符集，非法字符不能借截断被丢掉
    validate_charset(&suffix)?;
    validate_identifier(&transfers_table(&suffix))?;
    Ok(suffix)
}

pub fn events_table(chain_id: u64) -> String {
    format!("{}{}", EVENTS_TABLE_PREFIX, chain_id)
}

pub fn transfers_table(suffix: &str) -> String {
    bounded_identifier(format!("{}{}", TRANSFERS_TABLE_PREFIX, suffix))
}

/// 索引名：列缩写在前，截断时也不会互相冲突
pub fn index_name(column_tag: &str, suffix: &str) -> String {
    bounded_identifier(format!("ix_{}_{}", column_tag, suffix))
}

/// 不超过上限的原样返回；否则 `{前缀}_{keccak(全名)前 4 字节}`
pub fn bounded_identifier(name: String) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let digest = keccak256(name.as_bytes());
    let tag: String = digest[..DIGEST_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    let keep = MAX_IDENTIFIER_LEN - tag.len() - 1;
    // 非 ASCII 名字会在 validate_identifier 被拒绝，这里按字符截断避免切到字节中间
    let head: String = name.chars().take(keep).collect();
    format!("{}_{}", head, tag)
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::InvalidInput(format!(
            "表名长度非法({}): {}",
            name.len(),
            name
        )));
    }
    validate_charset(name)
}

fn validate_charset(name: &str) -> Result<(), StoreError> {
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidInput(format!("表名包含非法字符: {}", name)));
    }
    Ok(())
}
