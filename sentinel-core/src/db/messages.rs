use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::Result;
use crate::models::{
    AuditEntry, Backup, BackupConfig, BackupStatus, Cluster, DatabaseEntity, Restore,
    RestoreStatus, StorageRef,
};

/// DuckDB数据库操作消息
#[derive(Debug)]
pub enum DbMessage {
    /// 初始化数据库表
    InitTables {
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 数据库实体 ==========
    /// 保存数据库实体（存在则更新）
    SaveDatabase {
        database: DatabaseEntity,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取数据库实体
    GetDatabase {
        database_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<DatabaseEntity>>>,
    },
    /// 列出工作区内的数据库实体
    ListDatabasesByWorkspace {
        workspace_id: Uuid,
        respond_to: oneshot::Sender<Result<Vec<DatabaseEntity>>>,
    },
    /// 把数据库实体转移到另一个工作区
    TransferDatabase {
        database_id: Uuid,
        workspace_id: Uuid,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 存储后端引用 ==========
    /// 保存存储后端引用（存在则更新）
    SaveStorage {
        storage: StorageRef,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取存储后端引用
    GetStorage {
        storage_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<StorageRef>>>,
    },
    /// 列出工作区内的存储后端引用
    ListStoragesByWorkspace {
        workspace_id: Uuid,
        respond_to: oneshot::Sender<Result<Vec<StorageRef>>>,
    },

    // ========== 备份配置 ==========
    /// 保存备份配置（存在则更新）
    SaveBackupConfig {
        config: BackupConfig,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 查找数据库的备份配置
    FindBackupConfig {
        database_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<BackupConfig>>>,
    },
    /// 列出所有启用的备份配置
    ListEnabledBackupConfigs {
        respond_to: oneshot::Sender<Result<Vec<BackupConfig>>>,
    },

    // ========== 备份记录 ==========
    /// 插入备份记录
    CreateBackup {
        backup: Backup,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 写入备份终态
    UpdateBackupOutcome {
        backup_id: Uuid,
        status: BackupStatus,
        fail_message: Option<String>,
        size_mb: f64,
        duration_ms: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取备份记录
    GetBackup {
        backup_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<Backup>>>,
    },
    /// 列出数据库的备份记录（新到旧）
    FindBackupsByDatabase {
        database_id: Uuid,
        respond_to: oneshot::Sender<Result<Vec<Backup>>>,
    },
    /// 查找数据库是否有在途备份
    FindInProgressBackup {
        database_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<Backup>>>,
    },
    /// 把所有在途备份记为失败（进程重启后的孤儿回收）
    FailOrphanedInProgress {
        message: String,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    /// 删除备份记录
    DeleteBackup {
        backup_id: Uuid,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 恢复记录 ==========
    /// 插入恢复记录
    CreateRestore {
        restore: Restore,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 写入恢复终态
    UpdateRestoreOutcome {
        restore_id: Uuid,
        status: RestoreStatus,
        fail_message: Option<String>,
        duration_ms: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 列出备份的恢复记录（新到旧）
    FindRestoresByBackup {
        backup_id: Uuid,
        respond_to: oneshot::Sender<Result<Vec<Restore>>>,
    },
    /// 查找备份是否有在途恢复
    FindInProgressRestoreByBackup {
        backup_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<Restore>>>,
    },
    /// 把所有在途恢复记为失败（进程重启后的孤儿回收）
    FailOrphanedInProgressRestores {
        message: String,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    /// 删除备份关联的恢复记录
    DeleteRestoresByBackup {
        backup_id: Uuid,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 集群 ==========
    /// 保存集群（存在则更新，排除列表整体替换）
    SaveCluster {
        cluster: Cluster,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取集群
    GetCluster {
        cluster_id: Uuid,
        respond_to: oneshot::Sender<Result<Option<Cluster>>>,
    },
    /// 列出工作区内的集群
    ListClustersByWorkspace {
        workspace_id: Uuid,
        respond_to: oneshot::Sender<Result<Vec<Cluster>>>,
    },
    /// 列出全部集群（后台调度使用）
    ListAllClusters {
        respond_to: oneshot::Sender<Result<Vec<Cluster>>>,
    },
    /// 删除集群
    DeleteCluster {
        cluster_id: Uuid,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 更新集群最近一次调度运行时间
    UpdateClusterLastRun {
        cluster_id: Uuid,
        at: DateTime<Utc>,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 审计日志 ==========
    /// 写入审计日志
    InsertAuditLog {
        entry: AuditEntry,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 列出最近的审计日志
    ListAuditLogs {
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<AuditEntry>>>,
    },
    /// 清理过期审计日志
    DeleteOldAuditLogs {
        before: DateTime<Utc>,
        respond_to: oneshot::Sender<Result<usize>>,
    },
}
