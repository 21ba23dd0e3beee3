use config::ConfigError;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;
use tokio::task::JoinError;

/// 存储层错误（事件表/转账表）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 后端 I/O 或约束失败（未细分的兜底）
    #[error("存储错误: {0}")]
    Storage(String),

    /// 唯一键冲突（重复插入）
    #[error("重复记录: {0}")]
    Duplicate(String),

    /// 更新/删除的目标记录不存在
    #[error("记录未找到: {0}")]
    NotFound(String),

    /// 启动时无法连接数据库
    #[error("数据库连接错误: {0}")]
    Connection(String),

    /// 关闭失败或在已关闭的存储上操作
    #[error("存储 I/O 错误: {0}")]
    Io(String),

    #[error("无效输入: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// 转换 Diesel 查询错误，按错误类别细分
    pub fn from_diesel(context: &str, e: DieselError) -> Self {
        match e {
            DieselError::NotFound => StoreError::NotFound(context.to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Duplicate(format!(
                    "{}: table={}, constraint={}, detail={}",
                    context,
                    info.table_name().unwrap_or("unknown"),
                    info.constraint_name().unwrap_or("unknown"),
                    info.details().unwrap_or("no detail")
                ))
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Connection(format!("{}: {}", context, info.message()))
            }
            other => StoreError::Storage(format!("{}: {}", context, other)),
        }
    }
}

// 事务闭包内部使用 `?` 时需要
impl From<DieselError> for StoreError {
    fn from(e: DieselError) -> Self {
        StoreError::from_diesel("query failed", e)
    }
}

/// 中继（bundler）调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// 中继找不到该 user operation（预期内，按宽限期处理）
    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// 网络/节点等临时错误，整轮重试
    #[error("relay transient error: {0}")]
    Transient(String),
}

/// 对账循环错误，显式区分可恢复与致命
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("recoverable reconciliation error: {0}")]
    Recoverable(#[source] RelayError),

    #[error("reconciliation storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReconcileError::Recoverable(_))
    }
}

impl From<RelayError> for ReconcileError {
    fn from(e: RelayError) -> Self {
        // OperationNotFound 由调用方按宽限期单独处理，到这里一律视为可重试
        ReconcileError::Recoverable(e)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("异步任务错误: {0}")]
    Task(#[from] JoinError),

    /// 内部不可预期错误（兜底）
    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
