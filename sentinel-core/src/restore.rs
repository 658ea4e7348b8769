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
use crate::dispatch::{ExecutionDispatch, StorageDispatch};
use crate::error::{Result, SentinelError};
use crate::models::{AuditEntry, BackupStatus, Restore, RestoreStatus};
use crate::sinks::{JobEvent, SinkHub};

/// 恢复编排器，镜像备份编排器的单次执行、可取消、不重试的形状。
/// 恢复不参与周期调度，只能显式触发，目标库可以不同于源库。
pub struct RestoreManager {
    db: DuckDbManager,
    catalog: Arc<dyn DatabaseCatalog>,
    contexts: Arc<BackupContextManager>,
    engines: Arc<ExecutionDispatch>,
    storages: Arc<StorageDispatch>,
    sinks: Arc<SinkHub>,
    // 进程内去重：当前有在途恢复的备份id集合
    active: Mutex<HashSet<Uuid>>,
}

/// 去重集合的释放守卫，错误路径也不会卡死后续恢复
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    backup_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.backup_id);
        }
    }
}

impl RestoreManager {
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

    /// 把一个已完成的备份恢复到目标库。
    /// 同一备份同时只允许一个在途恢复，重复触发静默跳过返回 `Ok(None)`。
    pub async fn restore_backup(
        &self,
        backup_id: Uuid,
        target_database_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let backup = self
            .db
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("备份不存在: {backup_id}")))?;
        if backup.status != BackupStatus::Completed {
            return Err(SentinelError::invalid_config(format!(
                "只有已完成的备份可以恢复，当前状态: {}",
                backup.status.as_str()
            )));
        }

        let target = self
            .catalog
            .get_database(target_database_id)
            .await?
            .ok_or_else(|| {
                SentinelError::not_found(format!("目标数据库不存在: {target_database_id}"))
            })?;
        let storage_ref = self
            .db
            .get_storage(backup.storage_id)
            .await?
            .ok_or_else(|| {
                SentinelError::not_found(format!("存储后端不存在: {}", backup.storage_id))
            })?;

        let strategy = self.engines.resolve(target.engine)?;
        let backend = self.storages.resolve(&storage_ref)?;

        // 进程内去重：同一备份同时只允许一个在途恢复
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| SentinelError::custom("去重集合锁已失效"))?;
            if !active.insert(backup_id) {
                debug!(backup_id = %backup_id, "该备份已有在途恢复，跳过本次触发");
                return Ok(None);
            }
        }
        let _active = ActiveGuard {
            active: &self.active,
            backup_id,
        };

        // 持久层去重，覆盖重启后遗留的在途记录
        if self
            .db
            .find_in_progress_restore_by_backup(backup_id)
            .await?
            .is_some()
        {
            debug!(backup_id = %backup_id, "持久层存在在途恢复记录，跳过本次触发");
            return Ok(None);
        }

        let restore = Restore {
            id: Uuid::new_v4(),
            backup_id,
            target_database_id,
            status: RestoreStatus::InProgress,
            fail_message: None,
            duration_ms: 0,
            created_at: Utc::now(),
        };
        self.db.create_restore(restore.clone()).await?;

        let token = CancellationToken::new();
        self.contexts.register(restore.id, token.clone());
        let _ctx = ContextGuard::new(self.contexts.clone(), restore.id);

        info!(backup_id = %backup_id, target = %target.name, restore_id = %restore.id, "开始恢复");
        self.sinks
            .emit(
                &JobEvent::RestoreStarted {
                    restore: restore.clone(),
                },
                &[],
            )
            .await;

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(SentinelError::Cancelled),
            result = strategy.restore(token.clone(), restore.id, &backup, &target, backend) => result,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                self.db
                    .update_restore_outcome(restore.id, RestoreStatus::Completed, None, duration_ms)
                    .await?;
                info!(restore_id = %restore.id, "恢复完成");

                let finished = Restore {
                    status: RestoreStatus::Completed,
                    duration_ms,
                    ..restore.clone()
                };
                self.sinks
                    .emit(&JobEvent::RestoreCompleted { restore: finished }, &[])
                    .await;
                self.sinks
                    .audit(
                        AuditEntry::new("user", "restore.completed").with_subject(target.name),
                    )
                    .await;
                Ok(Some(restore.id))
            }
            Err(SentinelError::Cancelled) => {
                self.db
                    .update_restore_outcome(restore.id, RestoreStatus::Canceled, None, duration_ms)
                    .await?;
                info!(restore_id = %restore.id, "恢复已取消");
                self.sinks
                    .audit(AuditEntry::new("user", "restore.canceled").with_subject(target.name))
                    .await;
                Err(SentinelError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                self.db
                    .update_restore_outcome(
                        restore.id,
                        RestoreStatus::Failed,
                        Some(message.clone()),
                        duration_ms,
                    )
                    .await?;
                warn!(restore_id = %restore.id, "恢复失败: {message}");

                let failed = Restore {
                    status: RestoreStatus::Failed,
                    fail_message: Some(message.clone()),
                    duration_ms,
                    ..restore.clone()
                };
                self.sinks
                    .emit(&JobEvent::RestoreFailed { restore: failed }, &[])
                    .await;
                self.sinks
                    .audit(
                        AuditEntry::new("user", "restore.failed")
                            .with_subject(target.name)
                            .with_details(message.clone()),
                    )
                    .await;
                Err(SentinelError::execution(message))
            }
        }
    }

    /// 取消在途恢复；不在进行中的任务返回 NotFound
    pub fn cancel_restore(&self, restore_id: Uuid) -> Result<()> {
        self.contexts.cancel(restore_id)
    }

    /// 备份的恢复历史（新到旧）
    pub async fn restore_history(&self, backup_id: Uuid) -> Result<Vec<Restore>> {
        self.db.find_restores_by_backup(backup_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::{StubBehavior, fixture};
    use crate::catalog::DuckDbCatalog;

    fn restore_manager(fx: &crate::backup::tests::Fixture, behavior: StubBehavior) -> RestoreManager {
        use crate::dispatch::{ExecutionDispatch, StorageDispatch};
        use crate::models::EngineKind;

        let mut engines = ExecutionDispatch::new();
        engines.register(
            EngineKind::Postgres,
            Arc::new(crate::backup::tests::StubStrategy { behavior }),
        );
        let mut storages = StorageDispatch::new();
        storages.register(Arc::new(crate::backup::tests::NullStorage));

        RestoreManager::new(
            fx.db.clone(),
            Arc::new(DuckDbCatalog::new(fx.db.clone())),
            fx.contexts.clone(),
            Arc::new(engines),
            Arc::new(storages),
            Arc::new(SinkHub::new()),
        )
    }

    #[tokio::test]
    async fn test_restore_completed_backup() {
        let fx = fixture(StubBehavior::Succeed(5.0)).await;
        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        let restores = restore_manager(&fx, StubBehavior::Succeed(0.0));
        let restore_id = restores
            .restore_backup(backup_id, fx.database_id)
            .await
            .unwrap()
            .unwrap();

        let history = restores.restore_history(backup_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, restore_id);
        assert_eq!(history[0].status, RestoreStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_keep_single_in_progress() {
        use std::time::Duration;
        use tokio::sync::Notify;

        let fx = fixture(StubBehavior::Succeed(5.0)).await;
        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        let release = Arc::new(Notify::new());
        let restores = Arc::new(restore_manager(&fx, StubBehavior::BlockUntil(release.clone())));

        let first = {
            let restores = restores.clone();
            let database_id = fx.database_id;
            tokio::spawn(async move { restores.restore_backup(backup_id, database_id).await })
        };
        for _ in 0..200 {
            if fx
                .db
                .find_in_progress_restore_by_backup(backup_id)
                .await
                .unwrap()
                .is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // 第二次触发静默跳过，不报错也不建第二条记录
        let second = restores
            .restore_backup(backup_id, fx.database_id)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(restores.restore_history(backup_id).await.unwrap().len(), 1);

        // notify_one 在无等待者时保留通行证，不会丢失唤醒
        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(first.is_some());
        assert!(
            fx.db
                .find_in_progress_restore_by_backup(backup_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_failed_backup() {
        let fx = fixture(StubBehavior::Fail("坏了".to_string())).await;
        let _ = fx.manager.make_backup(fx.database_id, true).await;
        let failed = &fx.manager.backup_history(fx.database_id).await.unwrap()[0];

        let restores = restore_manager(&fx, StubBehavior::Succeed(0.0));
        let err = restores
            .restore_backup(failed.id, fx.database_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::InvalidConfig(_)));
        assert!(restores.restore_history(failed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_failure_recorded_with_message() {
        let fx = fixture(StubBehavior::Succeed(5.0)).await;
        let backup_id = fx
            .manager
            .make_backup(fx.database_id, true)
            .await
            .unwrap()
            .unwrap();

        let restores = restore_manager(&fx, StubBehavior::Fail("pg_restore 退出码 2".to_string()));
        let err = restores
            .restore_backup(backup_id, fx.database_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Execution(_)));

        let history = restores.restore_history(backup_id).await.unwrap();
        assert_eq!(history[0].status, RestoreStatus::Failed);
        assert!(
            history[0]
                .fail_message
                .as_deref()
                .unwrap()
                .contains("pg_restore")
        );
    }
}
