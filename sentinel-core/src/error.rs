use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("DuckDB数据库错误: {0}")]
    DuckDb(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("不支持的数据库引擎: {0}")]
    UnsupportedEngine(String),

    #[error("不支持的存储后端: {0}")]
    UnsupportedStorage(String),

    #[error("备份配置无效: {0}")]
    InvalidConfig(String),

    #[error("备份执行失败: {0}")]
    Execution(String),

    #[error("任务已被取消")]
    Cancelled,

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("集群操作失败: {0}")]
    Cluster(String),

    #[error("自定义错误: {0}")]
    Custom(String),
}

// 为DuckDB错误实现From trait
impl From<duckdb::Error> for SentinelError {
    fn from(err: duckdb::Error) -> Self {
        SentinelError::DuckDb(err.to_string())
    }
}

impl SentinelError {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }
}
