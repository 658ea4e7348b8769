use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::cluster::ClusterManager;
use crate::db::DuckDbManager;
use crate::error::Result;
use crate::models::{Backup, BackupConfig, BackupStatus};

/// 备份tick周期
pub const BACKUP_TICK: Duration = Duration::from_secs(60);
/// 集群tick周期
pub const CLUSTER_TICK: Duration = Duration::from_secs(60);
/// 审计清理tick周期
pub const AUDIT_CLEANUP_TICK: Duration = Duration::from_secs(3600);
/// 审计日志保留天数
pub const AUDIT_RETENTION_DAYS: i64 = 90;

/// 备份调度器。
///
/// 固定周期轮询所有启用备份的配置，判定到期后异步触发备份，
/// tick本身绝不等待任何一个任务完成，慢任务由去重不变式兜底。
pub struct BackupScheduler {
    db: DuckDbManager,
    backups: Arc<BackupManager>,
    tick: Duration,
}

impl BackupScheduler {
    pub fn new(db: DuckDbManager, backups: Arc<BackupManager>) -> Self {
        Self {
            db,
            backups,
            tick: BACKUP_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// 调度循环，收到关闭信号后退出
    pub async fn run(self, shutdown: CancellationToken) {
        info!("备份调度器已启动");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_pending_backups().await {
                        warn!("备份调度tick失败: {e}");
                    }
                }
            }
        }
        info!("备份调度器已退出");
    }

    /// 评估一轮到期备份并触发，返回本轮触发数量
    pub async fn run_pending_backups(&self) -> Result<usize> {
        let configs = self.db.list_enabled_backup_configs().await?;
        let now = Utc::now();
        let mut triggered = 0;

        for config in configs {
            let history = self.db.find_backups_by_database(config.database_id).await?;
            if !should_run(&config, &history, now) {
                continue;
            }
            triggered += 1;

            // 触发即放手，单个慢任务不能拖住其余库的评估
            let backups = self.backups.clone();
            let database_id = config.database_id;
            tokio::spawn(async move {
                match backups.make_backup(database_id, true).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(database_id = %database_id, "触发时已有在途备份"),
                    // 失败已记录在备份历史上，等下个tick按重试策略重新评估
                    Err(e) => warn!(database_id = %database_id, "调度备份失败: {e}"),
                }
            });
        }
        Ok(triggered)
    }
}

/// 判定数据库是否应当在本tick触发备份。
///
/// 到期条件二选一：
/// (a) 重试到期：最近一次备份失败、重试开启、且自上次成功以来的
///     连续失败次数未达上限——立刻放行，不等下一个调度时刻；
/// (b) 周期到期：按调度定义相对最近一次尝试时间已到期。
/// 连续失败达到上限后静默，直到下一个周期触发时刻才重新放行。
pub fn should_run(config: &BackupConfig, history: &[Backup], now: DateTime<Utc>) -> bool {
    if let Some(latest) = history.first() {
        // 在途任务不再触发；去重不变式同样会拦下
        if latest.status == BackupStatus::InProgress {
            return false;
        }

        if latest.status == BackupStatus::Failed && config.retry_if_failed {
            let consecutive_failures = history
                .iter()
                .take_while(|b| b.status == BackupStatus::Failed)
                .count();
            if (consecutive_failures as i32) < config.max_failed_tries {
                return true;
            }
        }
    }

    let last_attempt_at = history.first().map(|b| b.created_at);
    config.schedule.is_due(now, last_attempt_at)
}

/// 集群调度器：按集群默认调度周期触发发现与扇出
pub struct ClusterScheduler {
    db: DuckDbManager,
    clusters: Arc<ClusterManager>,
    tick: Duration,
}

impl ClusterScheduler {
    pub fn new(db: DuckDbManager, clusters: Arc<ClusterManager>) -> Self {
        Self {
            db,
            clusters,
            tick: CLUSTER_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("集群调度器已启动");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_pending_clusters().await {
                        warn!("集群调度tick失败: {e}");
                    }
                }
            }
        }
        info!("集群调度器已退出");
    }

    /// 评估一轮到期集群，返回本轮触发数量。
    /// 单个集群失败只跳过该集群，不影响其他集群。
    pub async fn run_pending_clusters(&self) -> Result<usize> {
        let clusters = self.db.list_all_clusters().await?;
        let now = Utc::now();
        let mut triggered = 0;

        for cluster in clusters {
            if !cluster.is_backups_enabled {
                continue;
            }
            if !cluster.effective_schedule().is_due(now, cluster.last_run_at) {
                continue;
            }
            triggered += 1;

            let manager = self.clusters.clone();
            let cluster_id = cluster.id;
            let name = cluster.name.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.run_backup_scheduled(cluster_id).await {
                    warn!(cluster = %name, "集群调度运行失败: {e}");
                }
            });
        }
        Ok(triggered)
    }
}

/// 审计日志清理：每小时删除超出保留窗口的记录
pub struct AuditLogCleaner {
    db: DuckDbManager,
    tick: Duration,
    retention_days: i64,
}

impl AuditLogCleaner {
    pub fn new(db: DuckDbManager) -> Self {
        Self {
            db,
            tick: AUDIT_CLEANUP_TICK,
            retention_days: AUDIT_RETENTION_DAYS,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("审计清理任务已启动");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let before = Utc::now() - chrono::Duration::days(self.retention_days);
                    match self.db.delete_old_audit_logs(before).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "已清理过期审计日志"),
                        Err(e) => warn!("审计日志清理失败: {e}"),
                    }
                }
            }
        }
        info!("审计清理任务已退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::{StubBehavior, fixture};
    use crate::schedule::Schedule;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    fn at_0401() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 4, 1, 0).unwrap()
    }

    fn enabled_config(database_id: Uuid) -> BackupConfig {
        let mut config = BackupConfig::default_for(database_id);
        config.is_enabled = true;
        config.storage_id = Some(Uuid::new_v4());
        config
    }

    fn backup_at(
        database_id: Uuid,
        status: BackupStatus,
        created_at: DateTime<Utc>,
    ) -> Backup {
        Backup {
            id: Uuid::new_v4(),
            database_id,
            storage_id: Uuid::new_v4(),
            status,
            fail_message: None,
            size_mb: 0.0,
            duration_ms: 0,
            created_at,
        }
    }

    #[test]
    fn test_interval_due_after_25h() {
        // 25小时前完成过一次，当前04:01，每日04:00调度 → 触发
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let history = vec![backup_at(
            database_id,
            BackupStatus::Completed,
            at_0401() - ChronoDuration::hours(25),
        )];
        assert!(should_run(&config, &history, at_0401()));
    }

    #[test]
    fn test_not_due_when_recent_attempt() {
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let history = vec![backup_at(
            database_id,
            BackupStatus::Completed,
            at_0401() - ChronoDuration::minutes(30),
        )];
        assert!(!should_run(&config, &history, at_0401()));
    }

    #[test]
    fn test_never_run_database_is_due() {
        let config = enabled_config(Uuid::new_v4());
        assert!(should_run(&config, &[], at_0401()));
    }

    #[test]
    fn test_retry_due_bypasses_interval() {
        // 刚失败不久，周期上未到期，但重试预算未用完 → 立刻放行
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let now = at_0401();
        // 失败发生在 04:00 触发时刻之后，周期判定不放行，只有重试放行
        let history = vec![
            backup_at(database_id, BackupStatus::Failed, now - ChronoDuration::seconds(30)),
            backup_at(
                database_id,
                BackupStatus::Completed,
                now - ChronoDuration::hours(24),
            ),
        ];
        assert!(!config.schedule.is_due(now, Some(history[0].created_at)));
        assert!(should_run(&config, &history, now));
    }

    #[test]
    fn test_retry_stops_at_max_failed_tries() {
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let now = at_0401();

        // 连续3次失败，maxFailedTries=3 → 本tick不触发第4次
        let history: Vec<Backup> = (1..=3)
            .map(|i| {
                backup_at(
                    database_id,
                    BackupStatus::Failed,
                    now - ChronoDuration::minutes(i),
                )
            })
            .collect();
        assert_eq!(config.max_failed_tries, 3);
        assert!(!should_run(&config, &history, now));

        // 2次失败时仍在预算内
        assert!(should_run(&config, &history[..2].to_vec(), now));

        // 静默期过后到下一个周期触发时刻重新放行
        let next_day = now + ChronoDuration::hours(24);
        assert!(should_run(&config, &history, next_day));
    }

    #[test]
    fn test_retry_disabled_means_zero_retries() {
        let database_id = Uuid::new_v4();
        let mut config = enabled_config(database_id);
        config.retry_if_failed = false;
        let now = at_0401();

        let history = vec![backup_at(
            database_id,
            BackupStatus::Failed,
            now - ChronoDuration::minutes(1),
        )];
        assert!(!should_run(&config, &history, now));
    }

    #[test]
    fn test_canceled_backup_is_not_retried() {
        // 取消是独立终态，不触发重试；按周期评估
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let now = at_0401();

        let history = vec![backup_at(
            database_id,
            BackupStatus::Canceled,
            now - ChronoDuration::minutes(1),
        )];
        assert!(!should_run(&config, &history, now));

        // 取消记录也会打断连续失败计数
        let history = vec![
            backup_at(database_id, BackupStatus::Failed, now - ChronoDuration::minutes(1)),
            backup_at(database_id, BackupStatus::Canceled, now - ChronoDuration::minutes(2)),
            backup_at(database_id, BackupStatus::Failed, now - ChronoDuration::minutes(3)),
            backup_at(database_id, BackupStatus::Failed, now - ChronoDuration::minutes(4)),
            backup_at(database_id, BackupStatus::Failed, now - ChronoDuration::minutes(5)),
        ];
        assert!(should_run(&config, &history, now));
    }

    #[test]
    fn test_in_progress_blocks_trigger() {
        let database_id = Uuid::new_v4();
        let config = enabled_config(database_id);
        let history = vec![backup_at(
            database_id,
            BackupStatus::InProgress,
            at_0401() - ChronoDuration::hours(25),
        )];
        assert!(!should_run(&config, &history, at_0401()));
    }

    #[test]
    fn test_weekly_schedule_respected() {
        let database_id = Uuid::new_v4();
        let mut config = enabled_config(database_id);
        config.schedule = Schedule::weekly(
            chrono::Weekday::Mon,
            chrono::NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        );

        // 2025-03-10 是周一；上次运行于上周二 → 到期
        let history = vec![backup_at(
            database_id,
            BackupStatus::Completed,
            at_0401() - ChronoDuration::days(6),
        )];
        assert!(should_run(&config, &history, at_0401()));

        // 本周一 04:00 之后已经跑过 → 不到期
        let history = vec![backup_at(
            database_id,
            BackupStatus::Completed,
            at_0401() - ChronoDuration::minutes(1),
        )];
        assert!(!should_run(&config, &history, at_0401()));
    }

    #[tokio::test]
    async fn test_run_pending_backups_triggers_due_database() {
        let fx = fixture(StubBehavior::Succeed(1.0)).await;
        let scheduler = BackupScheduler::new(fx.db.clone(), fx.manager.clone());

        // 从未备份过 → 到期并触发
        let triggered = scheduler.run_pending_backups().await.unwrap();
        assert_eq!(triggered, 1);

        // 等待异步任务落库
        for _ in 0..200 {
            let history = fx.manager.backup_history(fx.database_id).await.unwrap();
            if history.first().map(|b| b.status) == Some(BackupStatus::Completed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let history = fx.manager.backup_history(fx.database_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BackupStatus::Completed);

        // 刚跑完，下一tick不再触发
        let triggered = scheduler.run_pending_backups().await.unwrap();
        assert_eq!(triggered, 0);
    }
}
