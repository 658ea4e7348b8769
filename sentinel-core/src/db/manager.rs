use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::models::{
    AuditEntry, Backup, BackupConfig, BackupStatus, Cluster, DatabaseEntity, Restore,
    RestoreStatus, StorageRef,
};
use crate::{Result, SentinelError};

use super::actor::DuckDbActor;
use super::messages::DbMessage;

/// DuckDB数据库管理器
#[derive(Debug, Clone)]
pub struct DuckDbManager {
    sender: mpsc::Sender<DbMessage>,
}

impl DuckDbManager {
    /// 创建新的DuckDB管理器
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        // 确保数据库文件的父目录存在
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (sender, receiver) = mpsc::channel(100);

        // 启动DuckDB Actor
        let actor = DuckDbActor::new(db_path)?;
        tokio::spawn(actor.run(receiver));

        let manager = Self { sender };

        // 初始化数据库表
        manager.init_tables().await?;

        Ok(manager)
    }

    /// 创建内存数据库管理器
    pub async fn new_memory() -> Result<Self> {
        let (sender, receiver) = mpsc::channel(100);

        // 启动DuckDB Actor（内存模式）
        let actor = DuckDbActor::new_memory()?;
        tokio::spawn(actor.run(receiver));

        let manager = Self { sender };

        // 初始化数据库表
        manager.init_tables().await?;

        Ok(manager)
    }

    async fn send(&self, message: DbMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SentinelError::custom("数据库Actor已关闭"))
    }

    async fn recv<T>(&self, receiver: oneshot::Receiver<Result<T>>) -> Result<T> {
        receiver
            .await
            .map_err(|_| SentinelError::custom("等待数据库响应超时"))?
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::InitTables { respond_to }).await?;
        self.recv(receiver).await
    }

    // ========== 数据库实体 ==========

    /// 保存数据库实体（存在则更新）
    pub async fn save_database(&self, database: DatabaseEntity) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::SaveDatabase {
            database,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 根据ID获取数据库实体
    pub async fn get_database(&self, database_id: Uuid) -> Result<Option<DatabaseEntity>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::GetDatabase {
            database_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出工作区内的数据库实体
    pub async fn list_databases_by_workspace(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<DatabaseEntity>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListDatabasesByWorkspace {
            workspace_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 把数据库实体转移到另一个工作区
    pub async fn transfer_database(&self, database_id: Uuid, workspace_id: Uuid) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::TransferDatabase {
            database_id,
            workspace_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    // ========== 存储后端引用 ==========

    /// 保存存储后端引用（存在则更新）
    pub async fn save_storage(&self, storage: StorageRef) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::SaveStorage {
            storage,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 根据ID获取存储后端引用
    pub async fn get_storage(&self, storage_id: Uuid) -> Result<Option<StorageRef>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::GetStorage {
            storage_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出工作区内的存储后端引用
    pub async fn list_storages_by_workspace(&self, workspace_id: Uuid) -> Result<Vec<StorageRef>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListStoragesByWorkspace {
            workspace_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    // ========== 备份配置 ==========

    /// 保存备份配置（存在则更新）
    pub async fn save_backup_config(&self, config: BackupConfig) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::SaveBackupConfig { config, respond_to })
            .await?;
        self.recv(receiver).await
    }

    /// 查找数据库的备份配置
    pub async fn find_backup_config(&self, database_id: Uuid) -> Result<Option<BackupConfig>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FindBackupConfig {
            database_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 获取数据库的备份配置，不存在时惰性创建安全默认值
    pub async fn get_or_create_backup_config(&self, database_id: Uuid) -> Result<BackupConfig> {
        if let Some(config) = self.find_backup_config(database_id).await? {
            return Ok(config);
        }

        let config = BackupConfig::default_for(database_id);
        self.save_backup_config(config.clone()).await?;
        Ok(config)
    }

    /// 列出所有启用的备份配置
    pub async fn list_enabled_backup_configs(&self) -> Result<Vec<BackupConfig>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListEnabledBackupConfigs { respond_to })
            .await?;
        self.recv(receiver).await
    }

    // ========== 备份记录 ==========

    /// 插入备份记录
    pub async fn create_backup(&self, backup: Backup) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::CreateBackup { backup, respond_to })
            .await?;
        self.recv(receiver).await
    }

    /// 写入备份终态
    pub async fn update_backup_outcome(
        &self,
        backup_id: Uuid,
        status: BackupStatus,
        fail_message: Option<String>,
        size_mb: f64,
        duration_ms: i64,
    ) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::UpdateBackupOutcome {
            backup_id,
            status,
            fail_message,
            size_mb,
            duration_ms,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 根据ID获取备份记录
    pub async fn get_backup(&self, backup_id: Uuid) -> Result<Option<Backup>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::GetBackup {
            backup_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出数据库的备份记录（新到旧）
    pub async fn find_backups_by_database(&self, database_id: Uuid) -> Result<Vec<Backup>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FindBackupsByDatabase {
            database_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 查找数据库是否有在途备份
    pub async fn find_in_progress_backup(&self, database_id: Uuid) -> Result<Option<Backup>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FindInProgressBackup {
            database_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 把所有在途备份记为失败，返回回收数量
    pub async fn fail_orphaned_in_progress(&self, message: &str) -> Result<usize> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FailOrphanedInProgress {
            message: message.to_string(),
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 删除备份记录
    pub async fn delete_backup(&self, backup_id: Uuid) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::DeleteBackup {
            backup_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    // ========== 恢复记录 ==========

    /// 插入恢复记录
    pub async fn create_restore(&self, restore: Restore) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::CreateRestore {
            restore,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 写入恢复终态
    pub async fn update_restore_outcome(
        &self,
        restore_id: Uuid,
        status: RestoreStatus,
        fail_message: Option<String>,
        duration_ms: i64,
    ) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::UpdateRestoreOutcome {
            restore_id,
            status,
            fail_message,
            duration_ms,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出备份的恢复记录（新到旧）
    pub async fn find_restores_by_backup(&self, backup_id: Uuid) -> Result<Vec<Restore>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FindRestoresByBackup {
            backup_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 查找备份是否有在途恢复
    pub async fn find_in_progress_restore_by_backup(
        &self,
        backup_id: Uuid,
    ) -> Result<Option<Restore>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FindInProgressRestoreByBackup {
            backup_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 把所有在途恢复记为失败，返回回收数量
    pub async fn fail_orphaned_in_progress_restores(&self, message: &str) -> Result<usize> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::FailOrphanedInProgressRestores {
            message: message.to_string(),
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 删除备份关联的恢复记录
    pub async fn delete_restores_by_backup(&self, backup_id: Uuid) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::DeleteRestoresByBackup {
            backup_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    // ========== 集群 ==========

    /// 保存集群（存在则更新）
    pub async fn save_cluster(&self, cluster: Cluster) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::SaveCluster {
            cluster,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 根据ID获取集群
    pub async fn get_cluster(&self, cluster_id: Uuid) -> Result<Option<Cluster>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::GetCluster {
            cluster_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出工作区内的集群
    pub async fn list_clusters_by_workspace(&self, workspace_id: Uuid) -> Result<Vec<Cluster>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListClustersByWorkspace {
            workspace_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 列出全部集群（后台调度使用）
    pub async fn list_all_clusters(&self) -> Result<Vec<Cluster>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListAllClusters { respond_to })
            .await?;
        self.recv(receiver).await
    }

    /// 删除集群
    pub async fn delete_cluster(&self, cluster_id: Uuid) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::DeleteCluster {
            cluster_id,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    /// 更新集群最近一次调度运行时间
    pub async fn update_cluster_last_run(
        &self,
        cluster_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::UpdateClusterLastRun {
            cluster_id,
            at,
            respond_to,
        })
        .await?;
        self.recv(receiver).await
    }

    // ========== 审计日志 ==========

    /// 写入审计日志
    pub async fn insert_audit_log(&self, entry: AuditEntry) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::InsertAuditLog { entry, respond_to })
            .await?;
        self.recv(receiver).await
    }

    /// 列出最近的审计日志
    pub async fn list_audit_logs(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::ListAuditLogs { limit, respond_to })
            .await?;
        self.recv(receiver).await
    }

    /// 清理指定时刻之前的审计日志，返回删除数量
    pub async fn delete_old_audit_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(DbMessage::DeleteOldAuditLogs { before, respond_to })
            .await?;
        self.recv(receiver).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionInfo, EngineKind, StorageKind, StorePeriod};
    use crate::schedule::Schedule;
    use chrono::{Duration, NaiveTime, Weekday};

    fn sample_database(workspace_id: Uuid) -> DatabaseEntity {
        DatabaseEntity {
            id: Uuid::new_v4(),
            workspace_id,
            name: "orders".to_string(),
            engine: EngineKind::Postgres,
            connection: ConnectionInfo {
                host: "db.internal".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                use_tls: true,
            },
            catalog_name: Some("orders".to_string()),
            created_at: Utc::now(),
        }
    }

    fn sample_backup(database_id: Uuid, status: BackupStatus) -> Backup {
        Backup {
            id: Uuid::new_v4(),
            database_id,
            storage_id: Uuid::new_v4(),
            status,
            fail_message: None,
            size_mb: 0.0,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_database_roundtrip() {
        let db = DuckDbManager::new_memory().await.unwrap();
        let workspace_id = Uuid::new_v4();
        let database = sample_database(workspace_id);

        db.save_database(database.clone()).await.unwrap();

        let loaded = db.get_database(database.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "orders");
        assert_eq!(loaded.engine, EngineKind::Postgres);
        assert_eq!(loaded.connection.port, 5432);
        assert!(loaded.connection.use_tls);
        assert_eq!(loaded.catalog_name.as_deref(), Some("orders"));

        let listed = db.list_databases_by_workspace(workspace_id).await.unwrap();
        assert_eq!(listed.len(), 1);

        let other_workspace = Uuid::new_v4();
        db.transfer_database(database.id, other_workspace)
            .await
            .unwrap();
        assert!(
            db.list_databases_by_workspace(workspace_id)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            db.list_databases_by_workspace(other_workspace)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_backup_config_upsert_and_defaults() {
        let db = DuckDbManager::new_memory().await.unwrap();
        let database_id = Uuid::new_v4();

        assert!(db.find_backup_config(database_id).await.unwrap().is_none());

        // 惰性创建默认配置
        let config = db.get_or_create_backup_config(database_id).await.unwrap();
        assert!(config.is_untouched_default());
        assert!(db.find_backup_config(database_id).await.unwrap().is_some());

        // 更新后重读
        let mut config = config;
        config.is_enabled = true;
        config.storage_id = Some(Uuid::new_v4());
        config.store_period = StorePeriod::Month;
        config.schedule = Schedule::weekly(Weekday::Fri, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        db.save_backup_config(config.clone()).await.unwrap();

        let loaded = db.find_backup_config(database_id).await.unwrap().unwrap();
        assert!(loaded.is_enabled);
        assert_eq!(loaded.store_period, StorePeriod::Month);
        assert_eq!(loaded.schedule, config.schedule);
        assert_eq!(loaded.storage_id, config.storage_id);

        let enabled = db.list_enabled_backup_configs().await.unwrap();
        assert_eq!(enabled.len(), 1);
    }

    #[tokio::test]
    async fn test_backup_lifecycle_and_orphan_recovery() {
        let db = DuckDbManager::new_memory().await.unwrap();
        let database_id = Uuid::new_v4();

        let backup = sample_backup(database_id, BackupStatus::InProgress);
        db.create_backup(backup.clone()).await.unwrap();

        let in_progress = db.find_in_progress_backup(database_id).await.unwrap();
        assert!(in_progress.is_some());

        db.update_backup_outcome(backup.id, BackupStatus::Completed, None, 12.5, 4200)
            .await
            .unwrap();
        assert!(
            db.find_in_progress_backup(database_id)
                .await
                .unwrap()
                .is_none()
        );
        let loaded = db.get_backup(backup.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Completed);
        assert!((loaded.size_mb - 12.5).abs() < f64::EPSILON);

        // 孤儿回收只影响在途记录
        let orphan = sample_backup(database_id, BackupStatus::InProgress);
        db.create_backup(orphan.clone()).await.unwrap();
        let recovered = db.fail_orphaned_in_progress("进程重启").await.unwrap();
        assert_eq!(recovered, 1);

        let orphan = db.get_backup(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, BackupStatus::Failed);
        assert_eq!(orphan.fail_message.as_deref(), Some("进程重启"));

        let completed = db.get_backup(backup.id).await.unwrap().unwrap();
        assert_eq!(completed.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_cluster_roundtrip_with_exclusions() {
        let db = DuckDbManager::new_memory().await.unwrap();
        let workspace_id = Uuid::new_v4();

        let cluster = Cluster {
            id: Uuid::new_v4(),
            workspace_id,
            name: "pg-main".to_string(),
            engine: EngineKind::Postgres,
            connection: ConnectionInfo {
                host: "pg.internal".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                use_tls: false,
            },
            password: "secret".to_string(),
            is_backups_enabled: true,
            store_period: StorePeriod::Week,
            schedule: Some(Schedule::daily_default()),
            storage_id: Some(Uuid::new_v4()),
            notify_on: "BACKUP_FAILED".to_string(),
            cpu_count: 2,
            last_run_at: None,
            excluded_databases: vec!["Legacy".to_string(), "scratch".to_string()],
        };
        db.save_cluster(cluster.clone()).await.unwrap();

        let loaded = db.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "pg-main");
        assert_eq!(loaded.schedule, Some(Schedule::daily_default()));
        assert_eq!(loaded.excluded_databases.len(), 2);

        // 排除列表整体替换
        let mut updated = loaded.clone();
        updated.excluded_databases = vec!["scratch".to_string()];
        db.save_cluster(updated).await.unwrap();
        let loaded = db.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(loaded.excluded_databases, vec!["scratch".to_string()]);

        let at = Utc::now();
        db.update_cluster_last_run(cluster.id, at).await.unwrap();
        let loaded = db.get_cluster(cluster.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());

        assert_eq!(db.list_all_clusters().await.unwrap().len(), 1);
        db.delete_cluster(cluster.id).await.unwrap();
        assert!(db.get_cluster(cluster.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit_log_cleanup() {
        let db = DuckDbManager::new_memory().await.unwrap();

        let mut old_entry = AuditEntry::new("system", "backup.create");
        old_entry.created_at = Utc::now() - Duration::days(120);
        db.insert_audit_log(old_entry).await.unwrap();
        db.insert_audit_log(AuditEntry::new("admin", "cluster.save"))
            .await
            .unwrap();

        let deleted = db
            .delete_old_audit_logs(Utc::now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = db.list_audit_logs(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, "cluster.save");
    }
}
