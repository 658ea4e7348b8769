use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SentinelError};
use crate::schedule::Schedule;

// ========== 数据库引擎与存储后端 ==========

/// 受支持的数据库引擎类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Postgres,
    Mysql,
    Mariadb,
    Mongodb,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "POSTGRES",
            EngineKind::Mysql => "MYSQL",
            EngineKind::Mariadb => "MARIADB",
            EngineKind::Mongodb => "MONGODB",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "POSTGRES" => Ok(EngineKind::Postgres),
            "MYSQL" => Ok(EngineKind::Mysql),
            "MARIADB" => Ok(EngineKind::Mariadb),
            "MONGODB" => Ok(EngineKind::Mongodb),
            other => Err(SentinelError::UnsupportedEngine(other.to_string())),
        }
    }

    /// 判断目录是否属于引擎自带的系统库（不参与集群发现）
    pub fn is_system_catalog(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        match self {
            EngineKind::Postgres => {
                matches!(name.as_str(), "postgres" | "template0" | "template1")
            }
            EngineKind::Mysql | EngineKind::Mariadb => matches!(
                name.as_str(),
                "mysql" | "information_schema" | "performance_schema" | "sys"
            ),
            EngineKind::Mongodb => matches!(name.as_str(), "admin" | "local" | "config"),
        }
    }
}

/// 受支持的存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Local,
    S3,
    AzureBlob,
    Nas,
    Ftp,
    Sftp,
    Rclone,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "LOCAL",
            StorageKind::S3 => "S3",
            StorageKind::AzureBlob => "AZURE_BLOB",
            StorageKind::Nas => "NAS",
            StorageKind::Ftp => "FTP",
            StorageKind::Sftp => "SFTP",
            StorageKind::Rclone => "RCLONE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "LOCAL" => Ok(StorageKind::Local),
            "S3" => Ok(StorageKind::S3),
            "AZURE_BLOB" => Ok(StorageKind::AzureBlob),
            "NAS" => Ok(StorageKind::Nas),
            "FTP" => Ok(StorageKind::Ftp),
            "SFTP" => Ok(StorageKind::Sftp),
            "RCLONE" => Ok(StorageKind::Rclone),
            other => Err(SentinelError::UnsupportedStorage(other.to_string())),
        }
    }
}

// ========== 连接信息与实体 ==========

/// 数据库连接指纹（host/port/user/协议），用于集群发现时匹配已有实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub use_tls: bool,
}

impl ConnectionInfo {
    pub fn matches(&self, other: &ConnectionInfo) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.username == other.username
            && self.use_tls == other.use_tls
    }
}

/// 被管理的数据库实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntity {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub engine: EngineKind,
    pub connection: ConnectionInfo,
    /// 连接内的目录名（集群发现创建的实体必有此值）
    pub catalog_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 存储后端引用（具体凭据与IO由外部实现负责）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRef {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub kind: StorageKind,
    pub name: String,
}

// ========== 备份记录 ==========

/// 备份任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "IN_PROGRESS",
            BackupStatus::Completed => "COMPLETED",
            BackupStatus::Failed => "FAILED",
            BackupStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "IN_PROGRESS" => Ok(BackupStatus::InProgress),
            "COMPLETED" => Ok(BackupStatus::Completed),
            "FAILED" => Ok(BackupStatus::Failed),
            "CANCELED" => Ok(BackupStatus::Canceled),
            other => Err(SentinelError::custom(format!("未知的备份状态: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }
}

/// 备份记录（追加式历史，每次尝试一条）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub database_id: Uuid,
    pub storage_id: Uuid,
    pub status: BackupStatus,
    pub fail_message: Option<String>,
    pub size_mb: f64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

// ========== 恢复记录 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::InProgress => "IN_PROGRESS",
            RestoreStatus::Completed => "COMPLETED",
            RestoreStatus::Failed => "FAILED",
            RestoreStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "IN_PROGRESS" => Ok(RestoreStatus::InProgress),
            "COMPLETED" => Ok(RestoreStatus::Completed),
            "FAILED" => Ok(RestoreStatus::Failed),
            "CANCELED" => Ok(RestoreStatus::Canceled),
            other => Err(SentinelError::custom(format!("未知的恢复状态: {other}"))),
        }
    }
}

/// 恢复记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restore {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub target_database_id: Uuid,
    pub status: RestoreStatus,
    pub fail_message: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

// ========== 备份配置 ==========

/// 备份保留周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorePeriod {
    Day,
    Week,
    Month,
    ThreeMonth,
    HalfYear,
    Year,
    Forever,
}

impl StorePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePeriod::Day => "DAY",
            StorePeriod::Week => "WEEK",
            StorePeriod::Month => "MONTH",
            StorePeriod::ThreeMonth => "THREE_MONTH",
            StorePeriod::HalfYear => "HALF_YEAR",
            StorePeriod::Year => "YEAR",
            StorePeriod::Forever => "FOREVER",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "DAY" => Ok(StorePeriod::Day),
            "WEEK" => Ok(StorePeriod::Week),
            "MONTH" => Ok(StorePeriod::Month),
            "THREE_MONTH" => Ok(StorePeriod::ThreeMonth),
            "HALF_YEAR" => Ok(StorePeriod::HalfYear),
            "YEAR" => Ok(StorePeriod::Year),
            "FOREVER" => Ok(StorePeriod::Forever),
            other => Err(SentinelError::custom(format!("未知的保留周期: {other}"))),
        }
    }
}

/// 通知触发类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    BackupFailed,
    BackupSuccess,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BackupFailed => "BACKUP_FAILED",
            NotificationKind::BackupSuccess => "BACKUP_SUCCESS",
        }
    }

    /// 解析逗号分隔的通知类型列表，未知值直接忽略
    pub fn parse_list(value: &str) -> Vec<NotificationKind> {
        value
            .split(',')
            .filter_map(|part| match part.trim() {
                "BACKUP_FAILED" => Some(NotificationKind::BackupFailed),
                "BACKUP_SUCCESS" => Some(NotificationKind::BackupSuccess),
                _ => None,
            })
            .collect()
    }

    pub fn join_list(kinds: &[NotificationKind]) -> String {
        kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// 每个数据库一条的备份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub database_id: Uuid,
    pub is_enabled: bool,
    pub store_period: StorePeriod,
    pub schedule: Schedule,
    pub storage_id: Option<Uuid>,
    pub notify_on: Vec<NotificationKind>,
    pub retry_if_failed: bool,
    pub max_failed_tries: i32,
    pub cpu_count: i32,
    pub managed_by_cluster: bool,
    pub cluster_id: Option<Uuid>,
}

impl BackupConfig {
    /// 首次引用数据库时惰性创建的安全默认配置
    pub fn default_for(database_id: Uuid) -> Self {
        Self {
            database_id,
            is_enabled: false,
            store_period: StorePeriod::Week,
            schedule: Schedule::daily_default(),
            storage_id: None,
            notify_on: vec![
                NotificationKind::BackupFailed,
                NotificationKind::BackupSuccess,
            ],
            retry_if_failed: true,
            max_failed_tries: 3,
            cpu_count: 1,
            managed_by_cluster: false,
            cluster_id: None,
        }
    }

    /// 识别从未被用户改动过的默认配置（集群同步只会升级这种配置）
    pub fn is_untouched_default(&self) -> bool {
        !self.is_enabled
            && self.store_period == StorePeriod::Week
            && self.schedule == Schedule::daily_default()
            && self.storage_id.is_none()
            && self.cpu_count == 1
            && self.retry_if_failed
            && self.max_failed_tries == 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_enabled && self.storage_id.is_none() {
            return Err(SentinelError::invalid_config(
                "启用备份时必须选择存储后端".to_string(),
            ));
        }
        if self.max_failed_tries < 0 {
            return Err(SentinelError::invalid_config(
                "最大失败重试次数不能为负数".to_string(),
            ));
        }
        Ok(())
    }
}

// ========== 集群 ==========

/// 集群：一条连接定义背后可发现多个数据库，共享默认备份设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub engine: EngineKind,
    pub connection: ConnectionInfo,
    pub password: String,

    // 发现新数据库时应用的默认备份设置
    pub is_backups_enabled: bool,
    pub store_period: StorePeriod,
    pub schedule: Option<Schedule>,
    pub storage_id: Option<Uuid>,
    pub notify_on: String,
    pub cpu_count: i32,

    pub last_run_at: Option<DateTime<Utc>>,
    pub excluded_databases: Vec<String>,
}

impl Cluster {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SentinelError::cluster("集群名称不能为空".to_string()));
        }
        if self.connection.host.trim().is_empty() {
            return Err(SentinelError::cluster("集群主机地址不能为空".to_string()));
        }
        if self.connection.port == 0 {
            return Err(SentinelError::cluster("集群端口不能为空".to_string()));
        }
        if self.connection.username.trim().is_empty() {
            return Err(SentinelError::cluster("集群用户名不能为空".to_string()));
        }
        if self.password.trim().is_empty() {
            return Err(SentinelError::cluster("集群密码不能为空".to_string()));
        }
        if self.is_backups_enabled && self.storage_id.is_none() {
            return Err(SentinelError::cluster(
                "集群启用备份时必须选择存储后端".to_string(),
            ));
        }
        Ok(())
    }

    /// 小写化的排除库名集合
    pub fn excluded_set(&self) -> std::collections::HashSet<String> {
        self.excluded_databases
            .iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| name.trim().to_lowercase())
            .collect()
    }

    /// 对外展示时隐藏敏感信息
    pub fn hide_sensitive_data(&mut self) {
        self.password.clear();
    }

    /// 集群默认调度，未配置时回退到每日 04:00
    pub fn effective_schedule(&self) -> Schedule {
        self.schedule.clone().unwrap_or_else(Schedule::daily_default)
    }
}

/// 设置下发选项：选择要对齐的字段
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PropagationOptions {
    pub apply_storage: bool,
    pub apply_schedule: bool,
    pub apply_enabled: bool,
    pub respect_exclusions: bool,
}

/// 设置下发差异记录（仅在 Preview/Apply 期间存在，不落库）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationChange {
    pub database_id: Uuid,
    pub name: String,
    pub change_storage: bool,
    pub change_schedule: bool,
    pub change_enabled: bool,
}

impl PropagationChange {
    pub fn new(database_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            database_id,
            name: name.into(),
            change_storage: false,
            change_schedule: false,
            change_enabled: false,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.change_storage || self.change_schedule || self.change_enabled
    }
}

// ========== 主体与审计 ==========

/// 调用主体角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Member,
}

/// 经过认证的调用主体（RBAC细节由外层负责）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub role: Role,
}

impl Principal {
    /// 后台调度使用的系统主体，绕过工作区权限检查
    pub fn system() -> Self {
        Self {
            id: Uuid::nil(),
            role: Role::Admin,
        }
    }
}

/// 审计条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub subject: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action: action.into(),
            subject: None,
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_list_ignores_unknown() {
        let kinds = NotificationKind::parse_list("BACKUP_FAILED, BOGUS ,BACKUP_SUCCESS");
        assert_eq!(
            kinds,
            vec![
                NotificationKind::BackupFailed,
                NotificationKind::BackupSuccess
            ]
        );
        assert!(NotificationKind::parse_list("").is_empty());
    }

    #[test]
    fn test_default_config_is_untouched() {
        let cfg = BackupConfig::default_for(Uuid::new_v4());
        assert!(cfg.is_untouched_default());

        let mut touched = cfg.clone();
        touched.cpu_count = 4;
        assert!(!touched.is_untouched_default());
    }

    #[test]
    fn test_enabled_config_requires_storage() {
        let mut cfg = BackupConfig::default_for(Uuid::new_v4());
        cfg.is_enabled = true;
        assert!(cfg.validate().is_err());

        cfg.storage_id = Some(Uuid::new_v4());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_system_catalog_detection() {
        assert!(EngineKind::Postgres.is_system_catalog("template0"));
        assert!(EngineKind::Postgres.is_system_catalog(" Postgres "));
        assert!(!EngineKind::Postgres.is_system_catalog("orders"));
        assert!(EngineKind::Mysql.is_system_catalog("information_schema"));
        assert!(EngineKind::Mongodb.is_system_catalog("admin"));
    }
}
