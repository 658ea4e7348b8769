use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backup::BackupManager;
use crate::catalog::{Authorizer, ClusterConnector, DatabaseCatalog};
use crate::db::DuckDbManager;
use crate::error::{Result, SentinelError};
use crate::models::{
    AuditEntry, BackupConfig, Cluster, DatabaseEntity, NotificationKind, Principal,
    PropagationChange, PropagationOptions,
};
use crate::sinks::SinkHub;

/// 单次集群发现允许的最大并行备份数。
/// 一个集群可能一次发现几十个库，不设上限会同时压垮源集群和存储后端。
const CLUSTER_MAX_PARALLEL: usize = 5;

/// 一次集群发现运行的结果统计
#[derive(Debug, Clone, Default)]
pub struct ClusterRunReport {
    pub discovered: usize,
    pub created: usize,
    pub triggered: usize,
}

/// 集群管理器：CRUD、发现扇出与默认设置下发
#[derive(Clone)]
pub struct ClusterManager {
    db: DuckDbManager,
    catalog: Arc<dyn DatabaseCatalog>,
    connector: Arc<dyn ClusterConnector>,
    backups: Arc<BackupManager>,
    authorizer: Arc<dyn Authorizer>,
    sinks: Arc<SinkHub>,
}

impl ClusterManager {
    pub fn new(
        db: DuckDbManager,
        catalog: Arc<dyn DatabaseCatalog>,
        connector: Arc<dyn ClusterConnector>,
        backups: Arc<BackupManager>,
        authorizer: Arc<dyn Authorizer>,
        sinks: Arc<SinkHub>,
    ) -> Self {
        Self {
            db,
            catalog,
            connector,
            backups,
            authorizer,
            sinks,
        }
    }

    // ========== CRUD ==========

    /// 保存集群。新集群保存后立刻在后台跑一轮发现；
    /// 更新时如果排除列表新增了条目，对应的已纳管数据库配置会被连带停用。
    pub async fn save_cluster(&self, principal: &Principal, cluster: Cluster) -> Result<()> {
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;

        let previous = self.db.get_cluster(cluster.id).await?;
        let mut cluster = cluster;
        // 编辑表单不回显密码，留空表示沿用旧密码
        if let Some(previous) = &previous {
            if cluster.password.trim().is_empty() {
                cluster.password = previous.password.clone();
            }
        }
        cluster.validate()?;
        self.db.save_cluster(cluster.clone()).await?;

        match previous {
            Some(previous) => {
                let old_excluded = previous.excluded_set();
                let newly_excluded: Vec<String> = cluster
                    .excluded_set()
                    .into_iter()
                    .filter(|name| !old_excluded.contains(name))
                    .collect();
                if !newly_excluded.is_empty() {
                    self.disable_newly_excluded(&cluster, &newly_excluded)
                        .await?;
                }
            }
            None => {
                // 初次发现不阻塞保存调用
                let manager = self.clone();
                let cluster_id = cluster.id;
                tokio::spawn(async move {
                    if let Err(e) = manager.run_backup_scheduled(cluster_id).await {
                        warn!("集群初次发现失败: {e}");
                    }
                });
            }
        }

        self.sinks
            .audit(AuditEntry::new("user", "cluster.save").with_subject(cluster.name.clone()))
            .await;
        Ok(())
    }

    /// 新增排除名单后，停用这些库由集群托管的配置
    async fn disable_newly_excluded(&self, cluster: &Cluster, excluded: &[String]) -> Result<()> {
        for database in self.matching_databases(cluster).await? {
            let Some(catalog_name) = &database.catalog_name else {
                continue;
            };
            if !excluded.contains(&catalog_name.trim().to_lowercase()) {
                continue;
            }
            if let Some(mut config) = self.db.find_backup_config(database.id).await? {
                if config.managed_by_cluster && config.is_enabled {
                    config.is_enabled = false;
                    self.db.save_backup_config(config).await?;
                    info!(database = %database.name, cluster = %cluster.name, "已按排除名单停用备份");
                }
            }
        }
        Ok(())
    }

    pub async fn get_cluster(&self, principal: &Principal, cluster_id: Uuid) -> Result<Cluster> {
        let mut cluster = self
            .db
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("集群不存在: {cluster_id}")))?;
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;
        cluster.hide_sensitive_data();
        Ok(cluster)
    }

    pub async fn list_clusters(
        &self,
        principal: &Principal,
        workspace_id: Uuid,
    ) -> Result<Vec<Cluster>> {
        self.authorizer.can_manage_dbs(principal, workspace_id)?;
        let mut clusters = self.db.list_clusters_by_workspace(workspace_id).await?;
        for cluster in &mut clusters {
            cluster.hide_sensitive_data();
        }
        Ok(clusters)
    }

    pub async fn delete_cluster(&self, principal: &Principal, cluster_id: Uuid) -> Result<()> {
        let cluster = self
            .db
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("集群不存在: {cluster_id}")))?;
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;

        self.db.delete_cluster(cluster_id).await?;
        self.sinks
            .audit(AuditEntry::new("user", "cluster.delete").with_subject(cluster.name))
            .await;
        Ok(())
    }

    // ========== 发现与扇出 ==========

    /// 手动触发一轮集群发现与备份扇出
    pub async fn run_backup(
        &self,
        principal: &Principal,
        cluster_id: Uuid,
    ) -> Result<ClusterRunReport> {
        let cluster = self
            .db
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("集群不存在: {cluster_id}")))?;
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;

        let report = self.run_discovery(&cluster).await;
        // 无论成败都推进运行时间戳，失败的集群留给下个周期而不是每个tick重试
        self.db
            .update_cluster_last_run(cluster.id, Utc::now())
            .await?;
        report
    }

    /// 后台调度触发，系统主体绕过工作区权限
    pub async fn run_backup_scheduled(&self, cluster_id: Uuid) -> Result<ClusterRunReport> {
        self.run_backup(&Principal::system(), cluster_id).await
    }

    async fn run_discovery(&self, cluster: &Cluster) -> Result<ClusterRunReport> {
        let names = self
            .connector
            .list_catalogs(cluster)
            .await
            .map_err(|e| SentinelError::cluster(format!("集群 {} 连接失败: {e}", cluster.name)))?;
        let excluded = cluster.excluded_set();
        let existing = self.matching_databases(cluster).await?;

        let mut report = ClusterRunReport::default();
        let semaphore = Arc::new(Semaphore::new(CLUSTER_MAX_PARALLEL));
        let mut jobs = JoinSet::new();

        for name in names {
            if cluster.engine.is_system_catalog(&name) {
                continue;
            }
            if excluded.contains(&name.trim().to_lowercase()) {
                debug!(cluster = %cluster.name, catalog = %name, "目录在排除名单内，跳过");
                continue;
            }
            report.discovered += 1;

            let database = match find_by_catalog_name(&existing, &name) {
                Some(database) => {
                    self.ensure_backup_config(cluster, database.id, false).await?;
                    database.clone()
                }
                None => {
                    let database = DatabaseEntity {
                        id: Uuid::new_v4(),
                        workspace_id: cluster.workspace_id,
                        name: name.clone(),
                        engine: cluster.engine,
                        connection: cluster.connection.clone(),
                        catalog_name: Some(name.clone()),
                        created_at: Utc::now(),
                    };
                    self.catalog.create(database.clone()).await?;
                    self.ensure_backup_config(cluster, database.id, true).await?;
                    report.created += 1;
                    info!(cluster = %cluster.name, database = %name, "发现新数据库并已纳管");
                    database
                }
            };

            let config = self.db.get_or_create_backup_config(database.id).await?;
            if !config.is_enabled {
                continue;
            }
            report.triggered += 1;

            let semaphore = semaphore.clone();
            let backups = self.backups.clone();
            let database_id = database.id;
            let database_name = database.name.clone();
            jobs.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                match backups.make_backup(database_id, true).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(database = %database_name, "集群扇出遇到在途备份，跳过"),
                    // 失败已记录在备份历史上，扇出继续
                    Err(e) => warn!(database = %database_name, "集群扇出备份失败: {e}"),
                }
            });
        }

        // 等待本轮的全部提交结束后才返回
        while jobs.join_next().await.is_some() {}

        info!(
            cluster = %cluster.name,
            discovered = report.discovered,
            created = report.created,
            triggered = report.triggered,
            "集群发现完成"
        );
        Ok(report)
    }

    /// 把集群默认设置写入数据库配置。
    /// 只升级新建配置或仍处于默认状态的配置，用户改过的配置绝不覆盖。
    async fn ensure_backup_config(
        &self,
        cluster: &Cluster,
        database_id: Uuid,
        freshly_created: bool,
    ) -> Result<BackupConfig> {
        let config = self.db.get_or_create_backup_config(database_id).await?;
        if !freshly_created && !config.is_untouched_default() {
            return Ok(config);
        }

        let mut config = config;
        config.is_enabled = cluster.is_backups_enabled;
        config.store_period = cluster.store_period;
        config.schedule = cluster.effective_schedule();
        config.storage_id = cluster.storage_id;
        config.notify_on = NotificationKind::parse_list(&cluster.notify_on);
        config.cpu_count = cluster.cpu_count;
        config.managed_by_cluster = true;
        config.cluster_id = Some(cluster.id);
        config.validate()?;

        self.db.save_backup_config(config.clone()).await?;
        Ok(config)
    }

    /// 工作区内连接指纹与集群一致的数据库实体
    async fn matching_databases(&self, cluster: &Cluster) -> Result<Vec<DatabaseEntity>> {
        let databases = self.catalog.list_by_workspace(cluster.workspace_id).await?;
        Ok(databases
            .into_iter()
            .filter(|db| db.engine == cluster.engine && db.connection.matches(&cluster.connection))
            .collect())
    }

    // ========== 设置下发 ==========

    /// 预览集群默认设置与各库配置的差异，不做任何写入
    pub async fn preview_propagation(
        &self,
        principal: &Principal,
        cluster_id: Uuid,
        options: PropagationOptions,
    ) -> Result<Vec<PropagationChange>> {
        let cluster = self
            .db
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("集群不存在: {cluster_id}")))?;
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;

        let diffs = self.compute_propagation(&cluster, options).await?;
        Ok(diffs.into_iter().map(|(_, change)| change).collect())
    }

    /// 按请求的维度把集群默认设置应用到差异库，并标记为集群托管
    pub async fn apply_propagation(
        &self,
        principal: &Principal,
        cluster_id: Uuid,
        options: PropagationOptions,
    ) -> Result<Vec<PropagationChange>> {
        let cluster = self
            .db
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| SentinelError::not_found(format!("集群不存在: {cluster_id}")))?;
        self.authorizer
            .can_manage_dbs(principal, cluster.workspace_id)?;

        let diffs = self.compute_propagation(&cluster, options).await?;
        let mut changes = Vec::with_capacity(diffs.len());

        for (mut config, change) in diffs {
            if change.change_storage {
                config.storage_id = cluster.storage_id;
            }
            if change.change_schedule {
                config.schedule = cluster.effective_schedule();
            }
            if change.change_enabled {
                config.is_enabled = cluster.is_backups_enabled;
            }
            config.managed_by_cluster = true;
            config.cluster_id = Some(cluster.id);
            self.db.save_backup_config(config).await?;
            changes.push(change);
        }

        self.sinks
            .audit(
                AuditEntry::new("user", "cluster.apply_propagation")
                    .with_subject(cluster.name.clone())
                    .with_details(format!("updated={}", changes.len())),
            )
            .await;
        Ok(changes)
    }

    /// 逐库计算差异；未持久化配置的库按安全默认值比较
    async fn compute_propagation(
        &self,
        cluster: &Cluster,
        options: PropagationOptions,
    ) -> Result<Vec<(BackupConfig, PropagationChange)>> {
        let excluded = cluster.excluded_set();
        let mut diffs = Vec::new();

        for database in self.matching_databases(cluster).await? {
            if let Some(catalog_name) = &database.catalog_name {
                if cluster.engine.is_system_catalog(catalog_name) {
                    continue;
                }
                if options.respect_exclusions
                    && excluded.contains(&catalog_name.trim().to_lowercase())
                {
                    continue;
                }
            }

            let config = match self.db.find_backup_config(database.id).await? {
                Some(config) => config,
                None => BackupConfig::default_for(database.id),
            };

            let mut change = PropagationChange::new(database.id, database.name.clone());
            if options.apply_storage && config.storage_id != cluster.storage_id {
                change.change_storage = true;
            }
            if options.apply_schedule && config.schedule != cluster.effective_schedule() {
                change.change_schedule = true;
            }
            if options.apply_enabled && config.is_enabled != cluster.is_backups_enabled {
                change.change_enabled = true;
            }
            if change.has_changes() {
                diffs.push((config, change));
            }
        }
        Ok(diffs)
    }
}

fn find_by_catalog_name<'a>(
    databases: &'a [DatabaseEntity],
    name: &str,
) -> Option<&'a DatabaseEntity> {
    let wanted = name.trim().to_lowercase();
    databases.iter().find(|db| {
        db.catalog_name
            .as_deref()
            .is_some_and(|catalog| catalog.trim().to_lowercase() == wanted)
    })
}
