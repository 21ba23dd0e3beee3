use ethers_core::types::H256;
use std::str::FromStr;

pub fn h256_to_string(data: H256) -> String {
    // 0x + 64 位小写 hex
    format!("{:#x}", data)
}

/// 校验并规范化交易哈希；不是 32 字节 hex 时返回 None
pub fn normalize_tx_hash(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.len() != 64 {
        return None;
    }
    H256::from_str(hex).ok().map(h256_to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_prefix_and_case() {
        let upper = "0XABCDEF0000000000000000000000000000000000000000000000000000000001";
        assert_eq!(
            normalize_tx_hash(upper).as_deref(),
            Some("0xabcdef0000000000000000000000000000000000000000000000000000000001")
        );
    }

    #[test]
    fn rejects_short_or_non_hex() {
        assert!(normalize_tx_hash("0x1234").is_none());
        assert!(normalize_tx_hash(&format!("0x{}", "z".repeat(64))).is_none());
    }
}
