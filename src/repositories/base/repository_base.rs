use crate::errors::StoreError;
use crate::models::db::schema::validate_identifier;
use std::sync::atomic::{AtomicBool, Ordering};

/// 所有表句柄共用：表名校验与关闭标记
pub struct RepositoryBase {
    table: String,
    closed: AtomicBool,
}

impl RepositoryBase {
    pub fn new(table: String) -> Result<Self, StoreError> {
        validate_identifier(&table)?;
        Ok(Self {
            table,
            closed: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// 关闭后的任何操作都返回 Io 错误
    pub fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Io(format!("{} 已关闭", self.table)));
        }
        Ok(())
    }

    /// 重复关闭视为错误
    pub fn mark_closed(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Io(format!("{} 重复关闭", self.table)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_base_rejects_operations() {
        let base = RepositoryBase::new("t_transfers_1_0xabc".to_string()).unwrap();
        assert!(base.ensure_open().is_ok());
        base.mark_closed().unwrap();
        assert!(matches!(base.ensure_open(), Err(StoreError::Io(_))));
        assert!(base.mark_closed().is_err());
    }
}
