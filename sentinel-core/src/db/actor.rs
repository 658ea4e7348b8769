use chrono::{DateTime, Utc};
use duckdb::{Connection, Row, params};
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use tracing::{debug, info};

use crate::Result;
use crate::models::{
    AuditEntry, Backup, BackupConfig, BackupStatus, Cluster, ConnectionInfo, DatabaseEntity,
    EngineKind, NotificationKind, Restore, RestoreStatus, StorageKind, StorageRef, StorePeriod,
};
use crate::schedule::{Schedule, ScheduleKind};

use super::messages::DbMessage;

/// DuckDB Actor - 确保单线程访问DuckDB
pub struct DuckDbActor {
    connection: Connection,
}

impl DuckDbActor {
    /// 创建新的DuckDB Actor
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let connection = Connection::open(db_path)?;
        Ok(Self { connection })
    }

    /// 创建内存DuckDB Actor
    pub fn new_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        Ok(Self { connection })
    }

    /// 运行Actor消息循环
    pub async fn run(mut self, mut receiver: mpsc::Receiver<DbMessage>) {
        info!("DuckDB Actor 已启动");

        while let Some(message) = receiver.recv().await {
            self.handle_message(message);
        }

        info!("DuckDB Actor 已关闭");
    }

    /// 处理数据库消息
    fn handle_message(&mut self, message: DbMessage) {
        match message {
            DbMessage::InitTables { respond_to } => {
                let _ = respond_to.send(self.init_tables());
            }
            DbMessage::SaveDatabase {
                database,
                respond_to,
            } => {
                let _ = respond_to.send(self.save_database(&database));
            }
            DbMessage::GetDatabase {
                database_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_database(database_id));
            }
            DbMessage::ListDatabasesByWorkspace {
                workspace_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_databases_by_workspace(workspace_id));
            }
            DbMessage::TransferDatabase {
                database_id,
                workspace_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.transfer_database(database_id, workspace_id));
            }
            DbMessage::SaveStorage {
                storage,
                respond_to,
            } => {
                let _ = respond_to.send(self.save_storage(&storage));
            }
            DbMessage::GetStorage {
                storage_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_storage(storage_id));
            }
            DbMessage::ListStoragesByWorkspace {
                workspace_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_storages_by_workspace(workspace_id));
            }
            DbMessage::SaveBackupConfig { config, respond_to } => {
                let _ = respond_to.send(self.save_backup_config(&config));
            }
            DbMessage::FindBackupConfig {
                database_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.find_backup_config(database_id));
            }
            DbMessage::ListEnabledBackupConfigs { respond_to } => {
                let _ = respond_to.send(self.list_enabled_backup_configs());
            }
            DbMessage::CreateBackup { backup, respond_to } => {
                let _ = respond_to.send(self.create_backup(&backup));
            }
            DbMessage::UpdateBackupOutcome {
                backup_id,
                status,
                fail_message,
                size_mb,
                duration_ms,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_backup_outcome(
                    backup_id,
                    status,
                    fail_message.as_deref(),
                    size_mb,
                    duration_ms,
                ));
            }
            DbMessage::GetBackup {
                backup_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_backup(backup_id));
            }
            DbMessage::FindBackupsByDatabase {
                database_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.find_backups_by_database(database_id));
            }
            DbMessage::FindInProgressBackup {
                database_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.find_in_progress_backup(database_id));
            }
            DbMessage::FailOrphanedInProgress {
                message,
                respond_to,
            } => {
                let _ = respond_to.send(self.fail_orphaned_in_progress(&message));
            }
            DbMessage::DeleteBackup {
                backup_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.delete_backup(backup_id));
            }
            DbMessage::CreateRestore {
                restore,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_restore(&restore));
            }
            DbMessage::UpdateRestoreOutcome {
                restore_id,
                status,
                fail_message,
                duration_ms,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_restore_outcome(
                    restore_id,
                    status,
                    fail_message.as_deref(),
                    duration_ms,
                ));
            }
            DbMessage::FindRestoresByBackup {
                backup_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.find_restores_by_backup(backup_id));
            }
            DbMessage::FindInProgressRestoreByBackup {
                backup_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.find_in_progress_restore_by_backup(backup_id));
            }
            DbMessage::FailOrphanedInProgressRestores {
                message,
                respond_to,
            } => {
                let _ = respond_to.send(self.fail_orphaned_in_progress_restores(&message));
            }
            DbMessage::DeleteRestoresByBackup {
                backup_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.delete_restores_by_backup(backup_id));
            }
            DbMessage::SaveCluster {
                cluster,
                respond_to,
            } => {
                let _ = respond_to.send(self.save_cluster(&cluster));
            }
            DbMessage::GetCluster {
                cluster_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_cluster(cluster_id));
            }
            DbMessage::ListClustersByWorkspace {
                workspace_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_clusters_by_workspace(workspace_id));
            }
            DbMessage::ListAllClusters { respond_to } => {
                let _ = respond_to.send(self.list_all_clusters());
            }
            DbMessage::DeleteCluster {
                cluster_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.delete_cluster(cluster_id));
            }
            DbMessage::UpdateClusterLastRun {
                cluster_id,
                at,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_cluster_last_run(cluster_id, at));
            }
            DbMessage::InsertAuditLog { entry, respond_to } => {
                let _ = respond_to.send(self.insert_audit_log(&entry));
            }
            DbMessage::ListAuditLogs { limit, respond_to } => {
                let _ = respond_to.send(self.list_audit_logs(limit));
            }
            DbMessage::DeleteOldAuditLogs { before, respond_to } => {
                let _ = respond_to.send(self.delete_old_audit_logs(before));
            }
        }
    }

    /// 初始化数据库表
    fn init_tables(&mut self) -> Result<()> {
        debug!("正在初始化DuckDB表...");

        // 读取并执行SQL初始化脚本
        let sql_content = include_str!("../../migrations/init_duckdb.sql");

        // 按分号分割SQL语句并执行
        for statement in sql_content.split(';').filter(|s| !s.trim().is_empty()) {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                self.connection.execute(trimmed, [])?;
            }
        }

        info!("DuckDB表初始化完成");
        Ok(())
    }

    // ========== 数据库实体 ==========

    fn save_database(&mut self, database: &DatabaseEntity) -> Result<()> {
        let updated = self.connection.execute(
            "UPDATE databases SET workspace_id = ?, name = ?, engine = ?, host = ?, port = ?, \
             username = ?, use_tls = ?, catalog_name = ? WHERE id = ?",
            params![
                database.workspace_id,
                database.name,
                database.engine.as_str(),
                database.connection.host,
                database.connection.port as i32,
                database.connection.username,
                database.connection.use_tls,
                database.catalog_name,
                database.id,
            ],
        )?;

        if updated == 0 {
            self.connection.execute(
                "INSERT INTO databases (id, workspace_id, name, engine, host, port, username, \
                 use_tls, catalog_name, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    database.id,
                    database.workspace_id,
                    database.name,
                    database.engine.as_str(),
                    database.connection.host,
                    database.connection.port as i32,
                    database.connection.username,
                    database.connection.use_tls,
                    database.catalog_name,
                    database.created_at,
                ],
            )?;
        }
        Ok(())
    }

    fn get_database(&mut self, database_id: Uuid) -> Result<Option<DatabaseEntity>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, name, engine, host, port, username, use_tls, catalog_name, \
             created_at FROM databases WHERE id = ?",
        )?;
        let mut rows = stmt.query(params![database_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(read_database(row)?)),
            None => Ok(None),
        }
    }

    fn list_databases_by_workspace(&mut self, workspace_id: Uuid) -> Result<Vec<DatabaseEntity>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, name, engine, host, port, username, use_tls, catalog_name, \
             created_at FROM databases WHERE workspace_id = ? ORDER BY created_at",
        )?;
        let mut rows = stmt.query(params![workspace_id])?;

        let mut databases = Vec::new();
        while let Some(row) = rows.next()? {
            databases.push(read_database(row)?);
        }
        Ok(databases)
    }

    fn transfer_database(&mut self, database_id: Uuid, workspace_id: Uuid) -> Result<()> {
        self.connection.execute(
            "UPDATE databases SET workspace_id = ? WHERE id = ?",
            params![workspace_id, database_id],
        )?;
        Ok(())
    }

    // ========== 存储后端引用 ==========

    fn save_storage(&mut self, storage: &StorageRef) -> Result<()> {
        let updated = self.connection.execute(
            "UPDATE storages SET workspace_id = ?, kind = ?, name = ? WHERE id = ?",
            params![
                storage.workspace_id,
                storage.kind.as_str(),
                storage.name,
                storage.id,
            ],
        )?;

        if updated == 0 {
            self.connection.execute(
                "INSERT INTO storages (id, workspace_id, kind, name) VALUES (?, ?, ?, ?)",
                params![
                    storage.id,
                    storage.workspace_id,
                    storage.kind.as_str(),
                    storage.name,
                ],
            )?;
        }
        Ok(())
    }

    fn get_storage(&mut self, storage_id: Uuid) -> Result<Option<StorageRef>> {
        let mut stmt = self
            .connection
            .prepare("SELECT id, workspace_id, kind, name FROM storages WHERE id = ?")?;
        let mut rows = stmt.query(params![storage_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(StorageRef {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                kind: StorageKind::parse(&row.get::<_, String>(2)?)?,
                name: row.get(3)?,
            })),
            None => Ok(None),
        }
    }

    fn list_storages_by_workspace(&mut self, workspace_id: Uuid) -> Result<Vec<StorageRef>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, kind, name FROM storages WHERE workspace_id = ? ORDER BY name",
        )?;
        let mut rows = stmt.query(params![workspace_id])?;

        let mut storages = Vec::new();
        while let Some(row) = rows.next()? {
            storages.push(StorageRef {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                kind: StorageKind::parse(&row.get::<_, String>(2)?)?,
                name: row.get(3)?,
            });
        }
        Ok(storages)
    }

    // ========== 备份配置 ==========

    fn save_backup_config(&mut self, config: &BackupConfig) -> Result<()> {
        let notify_on = NotificationKind::join_list(&config.notify_on);
        let weekday = config.schedule.weekday_number().map(|n| n as i32);
        let day_of_month = config.schedule.day_of_month.map(|d| d as i32);

        let updated = self.connection.execute(
            "UPDATE backup_configs SET is_enabled = ?, store_period = ?, schedule_kind = ?, \
             time_of_day = ?, weekday = ?, day_of_month = ?, storage_id = ?, notify_on = ?, \
             retry_if_failed = ?, max_failed_tries = ?, cpu_count = ?, managed_by_cluster = ?, \
             cluster_id = ? WHERE database_id = ?",
            params![
                config.is_enabled,
                config.store_period.as_str(),
                config.schedule.kind.as_str(),
                config.schedule.time_of_day_str(),
                weekday,
                day_of_month,
                config.storage_id,
                notify_on,
                config.retry_if_failed,
                config.max_failed_tries,
                config.cpu_count,
                config.managed_by_cluster,
                config.cluster_id,
                config.database_id,
            ],
        )?;

        if updated == 0 {
            self.connection.execute(
                "INSERT INTO backup_configs (database_id, is_enabled, store_period, schedule_kind, \
                 time_of_day, weekday, day_of_month, storage_id, notify_on, retry_if_failed, \
                 max_failed_tries, cpu_count, managed_by_cluster, cluster_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    config.database_id,
                    config.is_enabled,
                    config.store_period.as_str(),
                    config.schedule.kind.as_str(),
                    config.schedule.time_of_day_str(),
                    weekday,
                    day_of_month,
                    config.storage_id,
                    notify_on,
                    config.retry_if_failed,
                    config.max_failed_tries,
                    config.cpu_count,
                    config.managed_by_cluster,
                    config.cluster_id,
                ],
            )?;
        }
        Ok(())
    }

    fn find_backup_config(&mut self, database_id: Uuid) -> Result<Option<BackupConfig>> {
        let mut stmt = self.connection.prepare(
            "SELECT database_id, is_enabled, store_period, schedule_kind, time_of_day, weekday, \
             day_of_month, storage_id, notify_on, retry_if_failed, max_failed_tries, cpu_count, \
             managed_by_cluster, cluster_id FROM backup_configs WHERE database_id = ?",
        )?;
        let mut rows = stmt.query(params![database_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(read_backup_config(row)?)),
            None => Ok(None),
        }
    }

    fn list_enabled_backup_configs(&mut self) -> Result<Vec<BackupConfig>> {
        let mut stmt = self.connection.prepare(
            "SELECT database_id, is_enabled, store_period, schedule_kind, time_of_day, weekday, \
             day_of_month, storage_id, notify_on, retry_if_failed, max_failed_tries, cpu_count, \
             managed_by_cluster, cluster_id FROM backup_configs WHERE is_enabled = TRUE",
        )?;
        let mut rows = stmt.query([])?;

        let mut configs = Vec::new();
        while let Some(row) = rows.next()? {
            configs.push(read_backup_config(row)?);
        }
        Ok(configs)
    }

    // ========== 备份记录 ==========

    fn create_backup(&mut self, backup: &Backup) -> Result<()> {
        self.connection.execute(
            "INSERT INTO backups (id, database_id, storage_id, status, fail_message, size_mb, \
             duration_ms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                backup.id,
                backup.database_id,
                backup.storage_id,
                backup.status.as_str(),
                backup.fail_message,
                backup.size_mb,
                backup.duration_ms,
                backup.created_at,
            ],
        )?;
        Ok(())
    }

    fn update_backup_outcome(
        &mut self,
        backup_id: Uuid,
        status: BackupStatus,
        fail_message: Option<&str>,
        size_mb: f64,
        duration_ms: i64,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE backups SET status = ?, fail_message = ?, size_mb = ?, duration_ms = ? \
             WHERE id = ?",
            params![status.as_str(), fail_message, size_mb, duration_ms, backup_id],
        )?;
        Ok(())
    }

    fn get_backup(&mut self, backup_id: Uuid) -> Result<Option<Backup>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, database_id, storage_id, status, fail_message, size_mb, duration_ms, \
             created_at FROM backups WHERE id = ?",
        )?;
        let mut rows = stmt.query(params![backup_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(read_backup(row)?)),
            None => Ok(None),
        }
    }

    fn find_backups_by_database(&mut self, database_id: Uuid) -> Result<Vec<Backup>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, database_id, storage_id, status, fail_message, size_mb, duration_ms, \
             created_at FROM backups WHERE database_id = ? ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![database_id])?;

        let mut backups = Vec::new();
        while let Some(row) = rows.next()? {
            backups.push(read_backup(row)?);
        }
        Ok(backups)
    }

    fn find_in_progress_backup(&mut self, database_id: Uuid) -> Result<Option<Backup>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, database_id, storage_id, status, fail_message, size_mb, duration_ms, \
             created_at FROM backups WHERE database_id = ? AND status = 'IN_PROGRESS' \
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![database_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(read_backup(row)?)),
            None => Ok(None),
        }
    }

    fn fail_orphaned_in_progress(&mut self, message: &str) -> Result<usize> {
        let changed = self.connection.execute(
            "UPDATE backups SET status = 'FAILED', fail_message = ? WHERE status = 'IN_PROGRESS'",
            params![message],
        )?;
        Ok(changed)
    }

    fn delete_backup(&mut self, backup_id: Uuid) -> Result<()> {
        self.connection
            .execute("DELETE FROM backups WHERE id = ?", params![backup_id])?;
        Ok(())
    }

    // ========== 恢复记录 ==========

    fn create_restore(&mut self, restore: &Restore) -> Result<()> {
        self.connection.execute(
            "INSERT INTO restores (id, backup_id, target_database_id, status, fail_message, \
             duration_ms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                restore.id,
                restore.backup_id,
                restore.target_database_id,
                restore.status.as_str(),
                restore.fail_message,
                restore.duration_ms,
                restore.created_at,
            ],
        )?;
        Ok(())
    }

    fn update_restore_outcome(
        &mut self,
        restore_id: Uuid,
        status: RestoreStatus,
        fail_message: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE restores SET status = ?, fail_message = ?, duration_ms = ? WHERE id = ?",
            params![status.as_str(), fail_message, duration_ms, restore_id],
        )?;
        Ok(())
    }

    fn find_restores_by_backup(&mut self, backup_id: Uuid) -> Result<Vec<Restore>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, backup_id, target_database_id, status, fail_message, duration_ms, \
             created_at FROM restores WHERE backup_id = ? ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![backup_id])?;

        let mut restores = Vec::new();
        while let Some(row) = rows.next()? {
            restores.push(read_restore(row)?);
        }
        Ok(restores)
    }

    fn find_in_progress_restore_by_backup(&mut self, backup_id: Uuid) -> Result<Option<Restore>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, backup_id, target_database_id, status, fail_message, duration_ms, \
             created_at FROM restores WHERE backup_id = ? AND status = 'IN_PROGRESS' \
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![backup_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(read_restore(row)?)),
            None => Ok(None),
        }
    }

    fn fail_orphaned_in_progress_restores(&mut self, message: &str) -> Result<usize> {
        let changed = self.connection.execute(
            "UPDATE restores SET status = 'FAILED', fail_message = ? WHERE status = 'IN_PROGRESS'",
            params![message],
        )?;
        Ok(changed)
    }

    fn delete_restores_by_backup(&mut self, backup_id: Uuid) -> Result<()> {
        self.connection.execute(
            "DELETE FROM restores WHERE backup_id = ?",
            params![backup_id],
        )?;
        Ok(())
    }

    // ========== 集群 ==========

    fn save_cluster(&mut self, cluster: &Cluster) -> Result<()> {
        let schedule_kind = cluster.schedule.as_ref().map(|s| s.kind.as_str());
        let time_of_day = cluster.schedule.as_ref().map(|s| s.time_of_day_str());
        let weekday = cluster
            .schedule
            .as_ref()
            .and_then(|s| s.weekday_number())
            .map(|n| n as i32);
        let day_of_month = cluster
            .schedule
            .as_ref()
            .and_then(|s| s.day_of_month)
            .map(|d| d as i32);

        let updated = self.connection.execute(
            "UPDATE clusters SET workspace_id = ?, name = ?, engine = ?, host = ?, port = ?, \
             username = ?, use_tls = ?, password = ?, is_backups_enabled = ?, store_period = ?, \
             schedule_kind = ?, time_of_day = ?, weekday = ?, day_of_month = ?, storage_id = ?, \
             notify_on = ?, cpu_count = ? WHERE id = ?",
            params![
                cluster.workspace_id,
                cluster.name,
                cluster.engine.as_str(),
                cluster.connection.host,
                cluster.connection.port as i32,
                cluster.connection.username,
                cluster.connection.use_tls,
                cluster.password,
                cluster.is_backups_enabled,
                cluster.store_period.as_str(),
                schedule_kind,
                time_of_day,
                weekday,
                day_of_month,
                cluster.storage_id,
                cluster.notify_on,
                cluster.cpu_count,
                cluster.id,
            ],
        )?;

        if updated == 0 {
            self.connection.execute(
                "INSERT INTO clusters (id, workspace_id, name, engine, host, port, username, \
                 use_tls, password, is_backups_enabled, store_period, schedule_kind, time_of_day, \
                 weekday, day_of_month, storage_id, notify_on, cpu_count, last_run_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    cluster.id,
                    cluster.workspace_id,
                    cluster.name,
                    cluster.engine.as_str(),
                    cluster.connection.host,
                    cluster.connection.port as i32,
                    cluster.connection.username,
                    cluster.connection.use_tls,
                    cluster.password,
                    cluster.is_backups_enabled,
                    cluster.store_period.as_str(),
                    schedule_kind,
                    time_of_day,
                    weekday,
                    day_of_month,
                    cluster.storage_id,
                    cluster.notify_on,
                    cluster.cpu_count,
                    cluster.last_run_at,
                ],
            )?;
        }

        // 排除列表整体替换
        self.connection.execute(
            "DELETE FROM cluster_excluded_databases WHERE cluster_id = ?",
            params![cluster.id],
        )?;
        for name in &cluster.excluded_databases {
            if name.trim().is_empty() {
                continue;
            }
            self.connection.execute(
                "INSERT INTO cluster_excluded_databases (cluster_id, database_name) VALUES (?, ?)",
                params![cluster.id, name.trim()],
            )?;
        }
        Ok(())
    }

    fn load_excluded_databases(&mut self, cluster_id: Uuid) -> Result<Vec<String>> {
        let mut stmt = self.connection.prepare(
            "SELECT database_name FROM cluster_excluded_databases WHERE cluster_id = ? \
             ORDER BY database_name",
        )?;
        let mut rows = stmt.query(params![cluster_id])?;

        let mut names = Vec::new();
        while let Some(row) = rows.next()? {
            names.push(row.get(0)?);
        }
        Ok(names)
    }

    fn get_cluster(&mut self, cluster_id: Uuid) -> Result<Option<Cluster>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, name, engine, host, port, username, use_tls, password, \
             is_backups_enabled, store_period, schedule_kind, time_of_day, weekday, day_of_month, \
             storage_id, notify_on, cpu_count, last_run_at FROM clusters WHERE id = ?",
        )?;
        let mut rows = stmt.query(params![cluster_id])?;

        let cluster = match rows.next()? {
            Some(row) => Some(read_cluster(row)?),
            None => None,
        };
        drop(rows);
        drop(stmt);

        match cluster {
            Some(mut cluster) => {
                cluster.excluded_databases = self.load_excluded_databases(cluster.id)?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    fn list_clusters_by_workspace(&mut self, workspace_id: Uuid) -> Result<Vec<Cluster>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, name, engine, host, port, username, use_tls, password, \
             is_backups_enabled, store_period, schedule_kind, time_of_day, weekday, day_of_month, \
             storage_id, notify_on, cpu_count, last_run_at FROM clusters WHERE workspace_id = ? \
             ORDER BY name",
        )?;
        let mut rows = stmt.query(params![workspace_id])?;

        let mut clusters = Vec::new();
        while let Some(row) = rows.next()? {
            clusters.push(read_cluster(row)?);
        }
        drop(rows);
        drop(stmt);

        for cluster in &mut clusters {
            cluster.excluded_databases = self.load_excluded_databases(cluster.id)?;
        }
        Ok(clusters)
    }

    fn list_all_clusters(&mut self) -> Result<Vec<Cluster>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, workspace_id, name, engine, host, port, username, use_tls, password, \
             is_backups_enabled, store_period, schedule_kind, time_of_day, weekday, day_of_month, \
             storage_id, notify_on, cpu_count, last_run_at FROM clusters ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;

        let mut clusters = Vec::new();
        while let Some(row) = rows.next()? {
            clusters.push(read_cluster(row)?);
        }
        drop(rows);
        drop(stmt);

        for cluster in &mut clusters {
            cluster.excluded_databases = self.load_excluded_databases(cluster.id)?;
        }
        Ok(clusters)
    }

    fn delete_cluster(&mut self, cluster_id: Uuid) -> Result<()> {
        self.connection.execute(
            "DELETE FROM cluster_excluded_databases WHERE cluster_id = ?",
            params![cluster_id],
        )?;
        self.connection
            .execute("DELETE FROM clusters WHERE id = ?", params![cluster_id])?;
        Ok(())
    }

    fn update_cluster_last_run(&mut self, cluster_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.connection.execute(
            "UPDATE clusters SET last_run_at = ? WHERE id = ?",
            params![at, cluster_id],
        )?;
        Ok(())
    }

    // ========== 审计日志 ==========

    fn insert_audit_log(&mut self, entry: &AuditEntry) -> Result<()> {
        self.connection.execute(
            "INSERT INTO audit_logs (id, actor, action, subject, details, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry.id,
                entry.actor,
                entry.action,
                entry.subject,
                entry.details,
                entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_audit_logs(&mut self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, actor, action, subject, details, created_at FROM audit_logs \
             ORDER BY created_at DESC LIMIT ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(AuditEntry {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                subject: row.get(3)?,
                details: row.get(4)?,
                created_at: row.get(5)?,
            });
        }
        Ok(entries)
    }

    fn delete_old_audit_logs(&mut self, before: DateTime<Utc>) -> Result<usize> {
        let deleted = self.connection.execute(
            "DELETE FROM audit_logs WHERE created_at < ?",
            params![before],
        )?;
        Ok(deleted)
    }
}

// ========== 行读取辅助 ==========

fn read_database(row: &Row<'_>) -> Result<DatabaseEntity> {
    Ok(DatabaseEntity {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        engine: EngineKind::parse(&row.get::<_, String>(3)?)?,
        connection: ConnectionInfo {
            host: row.get(4)?,
            port: row.get::<_, i32>(5)? as u16,
            username: row.get(6)?,
            use_tls: row.get(7)?,
        },
        catalog_name: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn read_backup_config(row: &Row<'_>) -> Result<BackupConfig> {
    let schedule = build_schedule(
        &row.get::<_, String>(3)?,
        &row.get::<_, String>(4)?,
        row.get(5)?,
        row.get(6)?,
    )?;

    Ok(BackupConfig {
        database_id: row.get(0)?,
        is_enabled: row.get(1)?,
        store_period: StorePeriod::parse(&row.get::<_, String>(2)?)?,
        schedule,
        storage_id: row.get(7)?,
        notify_on: NotificationKind::parse_list(&row.get::<_, String>(8)?),
        retry_if_failed: row.get(9)?,
        max_failed_tries: row.get(10)?,
        cpu_count: row.get(11)?,
        managed_by_cluster: row.get(12)?,
        cluster_id: row.get(13)?,
    })
}

fn read_backup(row: &Row<'_>) -> Result<Backup> {
    Ok(Backup {
        id: row.get(0)?,
        database_id: row.get(1)?,
        storage_id: row.get(2)?,
        status: BackupStatus::parse(&row.get::<_, String>(3)?)?,
        fail_message: row.get(4)?,
        size_mb: row.get(5)?,
        duration_ms: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn read_restore(row: &Row<'_>) -> Result<Restore> {
    Ok(Restore {
        id: row.get(0)?,
        backup_id: row.get(1)?,
        target_database_id: row.get(2)?,
        status: RestoreStatus::parse(&row.get::<_, String>(3)?)?,
        fail_message: row.get(4)?,
        duration_ms: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn read_cluster(row: &Row<'_>) -> Result<Cluster> {
    let schedule = match row.get::<_, Option<String>>(11)? {
        Some(kind) => Some(build_schedule(
            &kind,
            &row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            row.get(13)?,
            row.get(14)?,
        )?),
        None => None,
    };

    Ok(Cluster {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        engine: EngineKind::parse(&row.get::<_, String>(3)?)?,
        connection: ConnectionInfo {
            host: row.get(4)?,
            port: row.get::<_, i32>(5)? as u16,
            username: row.get(6)?,
            use_tls: row.get(7)?,
        },
        password: row.get(8)?,
        is_backups_enabled: row.get(9)?,
        store_period: StorePeriod::parse(&row.get::<_, String>(10)?)?,
        schedule,
        storage_id: row.get(15)?,
        notify_on: row.get(16)?,
        cpu_count: row.get(17)?,
        last_run_at: row.get(18)?,
        excluded_databases: Vec::new(),
    })
}

/// 从持久化列还原调度定义
fn build_schedule(
    kind: &str,
    time_of_day: &str,
    weekday: Option<i32>,
    day_of_month: Option<i32>,
) -> Result<Schedule> {
    let kind = ScheduleKind::parse(kind)?;
    let time_of_day = if time_of_day.is_empty() {
        Schedule::daily_default().time_of_day
    } else {
        Schedule::parse_time_of_day(time_of_day)?
    };

    Ok(match kind {
        ScheduleKind::Daily => Schedule::daily(time_of_day),
        ScheduleKind::Weekly => Schedule::weekly(
            Schedule::weekday_from_number(weekday.unwrap_or(0) as u32)?,
            time_of_day,
        ),
        ScheduleKind::Monthly => {
            Schedule::monthly(day_of_month.unwrap_or(1).max(1) as u32, time_of_day)
        }
    })
}
