use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::DatabaseCatalog;
use crate::context::{BackupContextManager, ContextGuard};
use crate::db::DuckDbManager;
use crate::dispatch::{ExecutionDispatch, ProgressFn, StorageDispatch};
use crate::error::{Result, SentinelError};
use crate::models::{AuditEntry, Backup, BackupStatus};
use crate::sinks::{JobEvent, SinkHub};

/// 备份编排器。
///
/// 负责任务生命周期：去重、状态转换、策略分发、取消与旁路副作用。
/// 状态以持久化的备份记录为准，每次状态转换即时落库，
/// 进程崩溃后留下的在途记录由 `recover_orphans` 统一回收。
pub struct BackupManager {
    db: DuckDbManager,
    catalog: Arc<dyn DatabaseCatalog>,
    contexts: Arc<BackupContextManager>,
    engines: Arc<ExecutionDispatch>,
    storages: Arc<StorageDispatch>,
    sinks: Arc<SinkHub>,
    // 进程内去重：当前有在途备份的数据库id集合
    active: Mutex<HashSet<Uuid>>,
}

/// 去重集合的释放守卫，错误路径也不会卡死后续备份
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    database_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.database_id);
        }
    }
}

impl BackupManager {
    pub fn new(
        db: DuckDbManager,
        catalog: Arc<dyn DatabaseCatalog>,
        contexts: Arc<BackupContextManager>,
        engines: Arc<ExecutionDispatch>,
        storages: Arc<StorageDispatch>,
        sinks: Arc<SinkHub>,
    ) -> Self {
        Self {
            db,
            catalog,
            contexts,
            engines,
            storages,
            sinks,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// 执行一次备份。
    ///
    /// 返回 `Ok(Some(backup_id))` 表示完成了一次备份；
    /// `Ok(None)` 表示该数据库已有在途备份，静默跳过（调度tick重叠时的正常情况）；
    /// 配置类错误在创建备份记录之前返回，不留下任何历史行。
    pub async fn make_backup(&self, database_id: Uuid, is_automatic: bool) -> Result<Option<Uuid>> {
        let database = self
            .catalog
            .get_database(database_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("数据库不存在: {database_id}")))?;

        let config = self.db.get_or_create_backup_config(database_id).await?;
        if !config.is_enabled {
            return Err(SentinelError::invalid_config(format!(
                "数据库 {} 未启用备份",
                database.name
            )));
        }
        let storage_id = config.storage_id.ok_or_else(|| {
            SentinelError::invalid_config(format!("数据库 {} 未配置存储后端", database.name))
        })?;
        let storage_ref = self
            .db
            .get_storage(storage_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("存储后端不存在: {storage_id}")))?;

        // 策略解析在建档之前，配置错误不留历史行
        let strategy = self.engines.resolve(database.engine)?;
        let backend = self.storages.resolve(&storage_ref)?;

        // 进程内去重：同一数据库同时只允许一个在途备份
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| SentinelError::custom("去重集合锁已失效"))?;
            if !active.insert(database_id) {
                debug!(database = %database.name, "已有在途备份，跳过本次触发");
                return Ok(None);
            }
        }
        let _active = ActiveGuard {
            active: &self.active,
            database_id,
        };

        // 持久层去重，覆盖重启后遗留的在途记录
        if self.db.find_in_progress_backup(database_id).await?.is_some() {
            debug!(database = %database.name, "持久层存在在途备份记录，跳过本次触发");
            return Ok(None);
        }

        let backup = Backup {
            id: Uuid::new_v4(),
            database_id,
            storage_id,
            status: BackupStatus::InProgress,
            fail_message: None,
            size_mb: 0.0,
            duration_ms: 0,
            created_at: Utc::now(),
        };
        self.db.create_backup(backup.clone()).await?;

        let token = CancellationToken::new();
        self.contexts.register(backup.id, token.clone());
        let _ctx = ContextGuard::new(self.contexts.clone(), backup.id);

        let actor = if is_automatic { "system" } else { "user" };
        info!(database = %database.name, backup_id = %backup.id, automatic = is_automatic, "开始备份");
        self.sinks
            .emit(
                &JobEvent::BackupStarted {
                    database: database.clone(),
                    backup: backup.clone(),
                },
                &config.notify_on,
            )
            .await;

        let progress: ProgressFn = {
            let name = database.name.clone();
            Arc::new(move |mb| debug!(database = %name, completed_mb = mb, "备份进行中"))
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(SentinelError::Cancelled),
            result = strategy.backup(
                token.clone(),
                backup.id,
                &config,
                &database,
                backend,
                progress,
            ) => result,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(report) => {
                self.db
                    .update_backup_outcome(
                        backup.id,
                        BackupStatus::Completed,
                        None,
                        report.size_mb,
                        duration_ms,
                    )
                    .await?;
                info!(database = %database.name, backup_id = %backup.id, size_mb = report.size_mb, "备份完成");

                let finished = Backup {
                    status: BackupStatus::Completed,
                    size_mb: report.size_mb,
                    duration_ms,
                    ..backup.clone()
                };
                self.sinks
                    .emit(
                        &JobEvent::BackupCompleted {
                            database: database.clone(),
                            backup: finished,
                        },
                        &config.notify_on,
                    )
                    .await;
                self.sinks
                    .audit(
                        AuditEntry::new(actor, "backup.completed")
                            .with_subject(database.name.clone()),
                    )
                    .await;
                Ok(Some(backup.id))
            }
            Err(SentinelError::Cancelled) => {
                self.db
                    .update_backup_outcome(backup.id, BackupStatus::Canceled, None, 0.0, duration_ms)
                    .await?;
                info!(database = %database.name, backup_id = %backup.id, "备份已取消");

                let canceled = Backup {
                    status: BackupStatus::Canceled,
                    duration_ms,
                    ..backup.clone()
                };
                self.sinks
                    .emit(
                        &JobEvent::BackupCanceled {
                            database: database.clone(),
                            backup: canceled,
                        },
                        &config.notify_on,
                    )
                    .await;
                self.sinks
                    .audit(
                        AuditEntry::new(actor, "backup.canceled")
                            .with_subject(database.name.clone()),
                    )
                    .await;
                Err(SentinelError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                self.db
                    .update_backup_outcome(
                        backup.id,
                        BackupStatus::Failed,
                        Some(message.clone()),
                        0.0,
                        duration_ms,
                    )
                    .await?;
                warn!(database = %database.name, backup_id = %backup.id, "备份失败: {message}");

                let failed = Backup {
                    status: BackupStatus::Failed,
                    fail_message: Some(message.clone()),
                    duration_ms,
                    ..backup.clone()
                };
                self.sinks
                    .emit(
                        &JobEvent::BackupFailed {
                            database: database.clone(),
                            backup: failed,
                        },
                        &config.notify_on,
                    )
                    .await;
                self.sinks
                    .audit(
                        AuditEntry::new(actor, "backup.failed")
                            .with_subject(database.name.clone())
                            .with_details(message.clone()),
                    )
                    .await;
                Err(SentinelError::execution(message))
            }
        }
    }

    /// 取消在途备份；不在进行中的任务返回 NotFound
    pub fn cancel_backup(&self, backup_id: Uuid) -> Result<()> {
        self.contexts.cancel(backup_id)
    }

    /// 删除备份记录及其产物。
    /// 在途备份和被在途恢复引用的备份都不允许删除。
    pub async fn delete_backup(&self, backup_id: Uuid) -> Result<()> {
        let backup = self
            .db
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("备份不存在: {backup_id}")))?;

        if backup.status == BackupStatus::InProgress {
            return Err(SentinelError::custom("备份进行中，请先取消再删除"));
        }
        if self
            .db
            .find_in_progress_restore_by_backup(backup_id)
            .await?
            .is_some()
        {
            return Err(SentinelError::custom("该备份正在被恢复任务使用，无法删除"));
        }

        // 存储侧产物清理尽力而为，失败不阻塞记录删除
        if let Some(storage_ref) = self.db.get_storage(backup.storage_id).await? {
            match self.storages.resolve(&storage_ref) {
                Ok(backend) => {
                    if let Err(e) = backend.delete_file(backup_id).await {
                        warn!(backup_id = %backup_id, "备份产物删除失败: {e}");
                    }
                }
                Err(e) => warn!(backup_id = %backup_id, "存储后端不可用，跳过产物清理: {e}"),
            }
        }

        self.db.delete_restores_by_backup(backup_id).await?;
        self.db.delete_backup(backup_id).await?;
        Ok(())
    }

    /// 进程启动时回收上次运行遗留的在途备份和恢复记录，返回回收总数。
    /// 重启后取消句柄已全部丢失，这些记录不可能再正常收尾；
    /// 在途恢复记录不回收还会永久挡住该备份的后续恢复和删除。
    pub async fn recover_orphans(&self) -> Result<usize> {
        let backups = self
            .db
            .fail_orphaned_in_progress("进程重启，任务中断")
            .await?;
        if backups > 0 {
            warn!(count = backups, "已回收重启前遗留的在途备份记录");
        }
        let restores = self
            .db
            .fail_orphaned_in_progress_restores("进程重启，任务中断")
            .await?;
        if restores > 0 {
            warn!(count = restores, "已回收重启前遗留的在途恢复记录");
        }
        Ok(backups + restores)
    }

    /// 数据库的备份历史（新到旧）
    pub async fn backup_history(&self, database_id: Uuid) -> Result<Vec<Backup>> {
        self.db.find_backups_by_database(database_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatch::{ExecutionReport, ExecutionStrategy, StorageBackend};
    use crate::models::{
        BackupConfig, ConnectionInfo, DatabaseEntity, EngineKind, Restore, RestoreStatus,
        StorageKind, StorageRef,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// 可控的桩策略：按指令成功/失败/阻塞直到放行
    pub(crate) enum StubBehavior {
        Succeed(f64),
        Fail(String),
        BlockUntil(Arc<Notify>),
    }

    pub(crate) struct StubStrategy {
        pub behavior: StubBehavior,
    }

    #[async_trait]
    impl ExecutionStrategy for StubStrategy {
        async fn backup(
            &self,
            cancel: CancellationToken,
            _backup_id: Uuid,
            _config: &BackupConfig,
            _database: &DatabaseEntity,
            _storage: Arc<dyn StorageBackend>,
            _on_progress: ProgressFn,
        ) -> Result<ExecutionReport> {
            match &self.behavior {
                StubBehavior::Succeed(size_mb) => Ok(ExecutionReport { size_mb: *size_mb }),
                StubBehavior::Fail(message) => Err(SentinelError::execution(message.clone())),
                StubBehavior::BlockUntil(release) => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(SentinelError::Cancelled),
                        _ = release.notified() => Ok(ExecutionReport { size_mb: 1.0 }),
                    }
                }
            }
        }

        async fn restore(
            &self,
            cancel: CancellationToken,
            _restore_id: Uuid,
            _backup: &Backup,
            _target: &DatabaseEntity,
            _storage: Arc<dyn StorageBackend>,
        ) -> Result<()> {
            match &self.behavior {
                StubBehavior::Succeed(_) => Ok(()),
                StubBehavior::Fail(message) => Err(SentinelError::execution(message.clone())),
                StubBehavior::BlockUntil(release) => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(SentinelError::Cancelled),
                        _ = release.notified() => Ok(()),
                    }
                }
            }
        }
    }

    /// 什么都不做的存储桩
    pub(crate) struct NullStorage;

    #[async_trait]
    impl StorageBackend for NullStorage {
        fn kind(&self) -> StorageKind {
            StorageKind::Local
        }

        async fn save_file(
            &self,
            _file_id: Uuid,
            _data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        ) -> Result<u64> {
            Ok(0)
        }

        async fn get_file(
            &self,
            _file_id: Uuid,
        ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
            Ok(Box::new(tokio::io::empty()))
        }

        async fn delete_file(&self, _file_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        fn validate(&self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub db: DuckDbManager,
        pub manager: Arc<BackupManager>,
        pub contexts: Arc<BackupContextManager>,
        pub database_id: Uuid,
    }

    /// 组装一套内存环境：一个启用备份的Postgres库 + 指定行为的桩策略
    pub(crate) async fn fixture(behavior: StubBehavior) -> Fixture {
        let db = DuckDbManager::new_memory().await.unwrap();
        let workspace_id = Uuid::new_v4();
        let storage_id = Uuid::new_v4();

        let database = DatabaseEntity {
            id: Uuid::new_v4(),
            workspace_id,
            name: "orders".to_string(),
            engine: EngineKind::Postgres,
            connection: ConnectionInfo {
                host: "localhost".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                use_tls: false,
            },
            catalog_name: Some("orders".to_string()),
            created_at: Utc::now(),
        };
        db.save_database(database.clone()).await.unwrap();
        db.save_storage(StorageRef {
            id: storage_id,
            workspace_id,
            kind: StorageKind::Local,
            name: "local".to_string(),
        })
        .await
        .unwrap();

        let mut config = BackupConfig::default_for(database.id);
        config.is_enabled = true;
        config.storage_id = Some(storage_id);
        db.save_backup_config(config).await.unwrap();

        let mut engines = ExecutionDispatch::new();
        engines.register(EngineKind::Postgres, Arc::new(StubStrategy { behavior }));
        let mut storages = StorageDispatch::new();
        storages.register(Arc::new(NullStorage));

        let contexts = Arc::new(BackupContextManager::new());
        let manager = Arc::new(BackupManager::new(
            db.clone(),
            Arc::new(crate::catalog::DuckDbCatalog::new(db.clone())),
            contexts.clone(),
            Arc::new(engines),
            Arc::new(storages),
            Arc::new(SinkHub::new()),
        ));

        Fixture {
            db,
            manager,
            contexts,
            database_id: database.id,
        }
    }

    async fn wait_for_in_progress(db: &DuckDbManager, database_id: Uuid) -> Backup {
        for _ in 0..200 {
            if let Some(backup) = db.find_in_progress_backup(database_id).await.unwrap() {
                return backup;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("等不到在途备份记录");
    }

    #[tokio::test]
    async fn test_successful_backup_records_outcome() {
        let fx = fixture(StubBehavior::Succeed(42.0)).await;

        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        let backup = fx.db.get_backup(backup_id).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert!((backup.size_mb - 42.0).abs() < f64::EPSILON);
        assert!(!fx.contexts.is_registered(backup_id));
    }

    #[tokio::test]
    async fn test_failed_backup_records_message() {
        let fx = fixture(StubBehavior::Fail("pg_dump 退出码 1".to_string())).await;

        let err = fx.manager.make_backup(fx.database_id, true).await.unwrap_err();
        assert!(matches!(err, SentinelError::Execution(_)));

        let history = fx.manager.backup_history(fx.database_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BackupStatus::Failed);
        assert!(
            history[0]
                .fail_message
                .as_deref()
                .unwrap()
                .contains("pg_dump")
        );
    }

    #[tokio::test]
    async fn test_concurrent_triggers_keep_single_in_progress() {
        let release = Arc::new(Notify::new());
        let fx = fixture(StubBehavior::BlockUntil(release.clone())).await;

        let first = {
            let manager = fx.manager.clone();
            let id = fx.database_id;
            tokio::spawn(async move { manager.make_backup(id, true).await })
        };
        wait_for_in_progress(&fx.db, fx.database_id).await;

        // 第二次触发静默跳过，不报错也不建第二条记录
        let second = fx.manager.make_backup(fx.database_id, true).await.unwrap();
        assert!(second.is_none());
        assert_eq!(fx.manager.backup_history(fx.database_id).await.unwrap().len(), 1);

        // notify_one 在无等待者时保留通行证，不会丢失唤醒
        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(first.is_some());
        assert!(
            fx.db
                .find_in_progress_backup(fx.database_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_cancel_marks_backup_canceled() {
        let release = Arc::new(Notify::new());
        let fx = fixture(StubBehavior::BlockUntil(release.clone())).await;

        let handle = {
            let manager = fx.manager.clone();
            let id = fx.database_id;
            tokio::spawn(async move { manager.make_backup(id, false).await })
        };
        let in_progress = wait_for_in_progress(&fx.db, fx.database_id).await;

        fx.manager.cancel_backup(in_progress.id).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SentinelError::Cancelled)));

        let backup = fx.db.get_backup(in_progress.id).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Canceled);
        assert!(backup.fail_message.is_none());

        // 再次取消返回 NotFound
        assert!(matches!(
            fx.manager.cancel_backup(in_progress.id),
            Err(SentinelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_config_leaves_no_history() {
        let fx = fixture(StubBehavior::Succeed(1.0)).await;

        let mut config = fx
            .db
            .find_backup_config(fx.database_id)
            .await
            .unwrap()
            .unwrap();
        config.is_enabled = false;
        fx.db.save_backup_config(config).await.unwrap();

        let err = fx.manager.make_backup(fx.database_id, true).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidConfig(_)));
        assert!(fx.manager.backup_history(fx.database_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_backup_blocked_by_in_progress_restore() {
        let fx = fixture(StubBehavior::Succeed(1.0)).await;
        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        fx.db
            .create_restore(Restore {
                id: Uuid::new_v4(),
                backup_id,
                target_database_id: fx.database_id,
                status: RestoreStatus::InProgress,
                fail_message: None,
                duration_ms: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(fx.manager.delete_backup(backup_id).await.is_err());
        assert!(fx.db.get_backup(backup_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_orphans_fails_stale_rows() {
        let fx = fixture(StubBehavior::Succeed(1.0)).await;

        fx.db
            .create_backup(Backup {
                id: Uuid::new_v4(),
                database_id: fx.database_id,
                storage_id: Uuid::new_v4(),
                status: BackupStatus::InProgress,
                fail_message: None,
                size_mb: 0.0,
                duration_ms: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let recovered = fx.manager.recover_orphans().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(
            fx.db
                .find_in_progress_backup(fx.database_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_recover_orphans_fails_stale_restore_rows() {
        let fx = fixture(StubBehavior::Succeed(1.0)).await;
        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        // 上次运行崩溃时留下的在途恢复记录
        fx.db
            .create_restore(Restore {
                id: Uuid::new_v4(),
                backup_id,
                target_database_id: fx.database_id,
                status: RestoreStatus::InProgress,
                fail_message: None,
                duration_ms: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let recovered = fx.manager.recover_orphans().await.unwrap();
        assert_eq!(recovered, 1);
        assert!(
            fx.db
                .find_in_progress_restore_by_backup(backup_id)
                .await
                .unwrap()
                .is_none()
        );

        // 回收后该备份不再被挡住，可以正常删除
        fx.manager.delete_backup(backup_id).await.unwrap();
        assert!(fx.db.get_backup(backup_id).await.unwrap().is_none());
    }
}
