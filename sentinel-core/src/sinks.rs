use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::db::DuckDbManager;
use crate::error::Result;
use crate::models::{AuditEntry, Backup, DatabaseEntity, NotificationKind, Restore};

/// 任务生命周期事件，供通知与指标消费
#[derive(Debug, Clone)]
pub enum JobEvent {
    BackupStarted {
        database: DatabaseEntity,
        backup: Backup,
    },
    BackupCompleted {
        database: DatabaseEntity,
        backup: Backup,
    },
    BackupFailed {
        database: DatabaseEntity,
        backup: Backup,
    },
    BackupCanceled {
        database: DatabaseEntity,
        backup: Backup,
    },
    RestoreStarted {
        restore: Restore,
    },
    RestoreCompleted {
        restore: Restore,
    },
    RestoreFailed {
        restore: Restore,
    },
}

impl JobEvent {
    /// 事件对应的通知触发类型；启动和取消不算终态，不触发任何通知
    pub fn notification_kind(&self) -> Option<NotificationKind> {
        match self {
            JobEvent::BackupCompleted { .. } => Some(NotificationKind::BackupSuccess),
            JobEvent::BackupFailed { .. } => Some(NotificationKind::BackupFailed),
            JobEvent::BackupStarted { .. } | JobEvent::BackupCanceled { .. } => None,
            JobEvent::RestoreStarted { .. }
            | JobEvent::RestoreCompleted { .. }
            | JobEvent::RestoreFailed { .. } => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            JobEvent::BackupStarted { .. } => "backup_started",
            JobEvent::BackupCompleted { .. } => "backup_completed",
            JobEvent::BackupFailed { .. } => "backup_failed",
            JobEvent::BackupCanceled { .. } => "backup_canceled",
            JobEvent::RestoreStarted { .. } => "restore_started",
            JobEvent::RestoreCompleted { .. } => "restore_completed",
            JobEvent::RestoreFailed { .. } => "restore_failed",
        }
    }
}

/// 通知投递端（邮件/Webhook等由外部实现）
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn notify(&self, event: &JobEvent) -> Result<()>;
}

/// 审计写入端
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// 指标观察端
pub trait MetricsSink: Send + Sync + 'static {
    fn observe(&self, event: &JobEvent);
}

/// 把事件以 tracing 结构化日志的形式导出
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn observe(&self, event: &JobEvent) {
        match event {
            JobEvent::BackupStarted { database, .. } => {
                info!(event = event.describe(), database = %database.name, "备份开始");
            }
            JobEvent::BackupCompleted { database, backup } => {
                info!(
                    event = event.describe(),
                    database = %database.name,
                    size_mb = backup.size_mb,
                    duration_ms = backup.duration_ms,
                    "备份完成"
                );
            }
            JobEvent::BackupFailed { database, backup } => {
                info!(
                    event = event.describe(),
                    database = %database.name,
                    fail_message = backup.fail_message.as_deref().unwrap_or(""),
                    "备份失败"
                );
            }
            JobEvent::BackupCanceled { database, .. } => {
                info!(event = event.describe(), database = %database.name, "备份已取消");
            }
            JobEvent::RestoreStarted { restore } => {
                info!(event = event.describe(), restore_id = %restore.id, "恢复开始");
            }
            JobEvent::RestoreCompleted { restore } => {
                info!(
                    event = event.describe(),
                    restore_id = %restore.id,
                    duration_ms = restore.duration_ms,
                    "恢复完成"
                );
            }
            JobEvent::RestoreFailed { restore } => {
                info!(
                    event = event.describe(),
                    restore_id = %restore.id,
                    fail_message = restore.fail_message.as_deref().unwrap_or(""),
                    "恢复失败"
                );
            }
        }
    }
}

/// 把审计条目写入本地元数据库
pub struct DuckDbAuditSink {
    db: DuckDbManager,
}

impl DuckDbAuditSink {
    pub fn new(db: DuckDbManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for DuckDbAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.db.insert_audit_log(entry.clone()).await
    }
}

/// 事件扇出中心。
///
/// 投递失败只记日志并吞掉，绝不反噬任务状态机：
/// 备份成败由执行结果决定，与通知是否送达无关。
#[derive(Default)]
pub struct SinkHub {
    notifiers: Vec<Arc<dyn NotificationSink>>,
    auditors: Vec<Arc<dyn AuditSink>>,
    metrics: Vec<Arc<dyn MetricsSink>>,
}

impl SinkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_notifier(&mut self, sink: Arc<dyn NotificationSink>) {
        self.notifiers.push(sink);
    }

    pub fn add_auditor(&mut self, sink: Arc<dyn AuditSink>) {
        self.auditors.push(sink);
    }

    pub fn add_metrics(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics.push(sink);
    }

    /// 按配置的通知偏好扇出事件，同时上报指标
    pub async fn emit(&self, event: &JobEvent, notify_on: &[NotificationKind]) {
        for sink in &self.metrics {
            sink.observe(event);
        }

        let Some(kind) = event.notification_kind() else {
            return;
        };
        if !notify_on.contains(&kind) {
            return;
        }

        for sink in &self.notifiers {
            if let Err(e) = sink.notify(event).await {
                warn!(sink = sink.name(), event = event.describe(), "通知投递失败: {e}");
            }
        }
    }

    /// 写入审计条目，失败降级为日志
    pub async fn audit(&self, entry: AuditEntry) {
        for sink in &self.auditors {
            if let Err(e) = sink.record(&entry).await {
                warn!(action = %entry.action, "审计写入失败: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SentinelError;
    use crate::models::{BackupStatus, ConnectionInfo, EngineKind};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn sample_database() -> DatabaseEntity {
        DatabaseEntity {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "orders".to_string(),
            engine: EngineKind::Postgres,
            connection: ConnectionInfo {
                host: "localhost".to_string(),
                port: 5432,
                username: "postgres".to_string(),
                use_tls: false,
            },
            catalog_name: None,
            created_at: Utc::now(),
        }
    }

    fn sample_backup(status: BackupStatus) -> Backup {
        Backup {
            id: Uuid::new_v4(),
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            status,
            fail_message: None,
            size_mb: 1.5,
            duration_ms: 1200,
            created_at: Utc::now(),
        }
    }

    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn notify(&self, _event: &JobEvent) -> Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingMetrics {
        observed: AtomicUsize,
    }

    impl MetricsSink for CountingMetrics {
        fn observe(&self, _event: &JobEvent) {
            self.observed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _event: &JobEvent) -> Result<()> {
            Err(SentinelError::custom("投递通道不可用"))
        }
    }

    #[tokio::test]
    async fn test_emit_respects_notify_preferences() {
        let counting = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let mut hub = SinkHub::new();
        hub.add_notifier(counting.clone());

        let event = JobEvent::BackupCompleted {
            database: sample_database(),
            backup: sample_backup(BackupStatus::Completed),
        };

        // 偏好里没有成功通知，不投递
        hub.emit(&event, &[NotificationKind::BackupFailed]).await;
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 0);

        hub.emit(&event, &[NotificationKind::BackupSuccess]).await;
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_started_events_reach_metrics_but_never_notify() {
        let counting = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let metrics = Arc::new(CountingMetrics {
            observed: AtomicUsize::new(0),
        });
        let mut hub = SinkHub::new();
        hub.add_notifier(counting.clone());
        hub.add_metrics(metrics.clone());

        let started = JobEvent::BackupStarted {
            database: sample_database(),
            backup: sample_backup(BackupStatus::InProgress),
        };
        hub.emit(
            &started,
            &[
                NotificationKind::BackupFailed,
                NotificationKind::BackupSuccess,
            ],
        )
        .await;

        let restore_started = JobEvent::RestoreStarted {
            restore: Restore {
                id: Uuid::new_v4(),
                backup_id: Uuid::new_v4(),
                target_database_id: Uuid::new_v4(),
                status: crate::models::RestoreStatus::InProgress,
                fail_message: None,
                duration_ms: 0,
                created_at: Utc::now(),
            },
        };
        hub.emit(&restore_started, &[]).await;

        // 启动事件只走指标，不触发通知
        assert_eq!(metrics.observed.load(Ordering::SeqCst), 2);
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_canceled_backup_never_notifies() {
        let counting = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let mut hub = SinkHub::new();
        hub.add_notifier(counting.clone());

        let event = JobEvent::BackupCanceled {
            database: sample_database(),
            backup: sample_backup(BackupStatus::Canceled),
        };
        hub.emit(
            &event,
            &[
                NotificationKind::BackupFailed,
                NotificationKind::BackupSuccess,
            ],
        )
        .await;
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let counting = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let mut hub = SinkHub::new();
        hub.add_notifier(Arc::new(FailingSink));
        hub.add_notifier(counting.clone());

        let event = JobEvent::BackupFailed {
            database: sample_database(),
            backup: sample_backup(BackupStatus::Failed),
        };
        hub.emit(&event, &[NotificationKind::BackupFailed]).await;
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 1);
    }
}
