use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use sentinel_core::backup::BackupManager;
use sentinel_core::catalog::{DatabaseCatalog, DuckDbCatalog, RoleAuthorizer};
use sentinel_core::cluster::ClusterManager;
use sentinel_core::context::BackupContextManager;
use sentinel_core::db::DuckDbManager;
use sentinel_core::dispatch::{ExecutionDispatch, LocalDirStorage, StorageDispatch};
use sentinel_core::models::{
    Cluster, ConnectionInfo, DatabaseEntity, EngineKind, NotificationKind, Principal,
    PropagationChange, PropagationOptions, Role, StorageKind, StorageRef, StorePeriod,
};
use sentinel_core::restore::RestoreManager;
use sentinel_core::schedule::Schedule;
use sentinel_core::scheduler::{AuditLogCleaner, BackupScheduler, ClusterScheduler};
use sentinel_core::sinks::{DuckDbAuditSink, SinkHub, TracingMetricsSink};

use crate::cli::{
    BackupCommand, ClusterCommand, Commands, DatabaseCommand, PropagationArgs, RestoreCommand,
    StorageCommand,
};
use crate::config::AppConfig;
use crate::connector::PsqlClusterConnector;
use crate::strategy::PgDumpStrategy;

/// CLI 应用：装配核心管理器并分发子命令
pub struct CliApp {
    pub config: AppConfig,
    pub db: DuckDbManager,
    pub backups: Arc<BackupManager>,
    pub restores: Arc<RestoreManager>,
    pub clusters: Arc<ClusterManager>,
}

/// 单机部署下CLI操作者视为管理员
fn operator() -> Principal {
    Principal {
        id: Uuid::nil(),
        role: Role::Admin,
    }
}

impl CliApp {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = DuckDbManager::new(&config.data.db_path).await?;
        let catalog: Arc<dyn DatabaseCatalog> = Arc::new(DuckDbCatalog::new(db.clone()));
        let contexts = Arc::new(BackupContextManager::new());

        let mut engines = ExecutionDispatch::new();
        engines.register(EngineKind::Postgres, Arc::new(PgDumpStrategy::new()));
        let engines = Arc::new(engines);

        let mut storages = StorageDispatch::new();
        storages.register(Arc::new(LocalDirStorage::new(PathBuf::from(
            &config.storage.backup_dir,
        ))));
        let storages = Arc::new(storages);

        let mut sinks = SinkHub::new();
        sinks.add_metrics(Arc::new(TracingMetricsSink));
        sinks.add_auditor(Arc::new(DuckDbAuditSink::new(db.clone())));
        let sinks = Arc::new(sinks);

        let backups = Arc::new(BackupManager::new(
            db.clone(),
            catalog.clone(),
            contexts.clone(),
            engines.clone(),
            storages.clone(),
            sinks.clone(),
        ));
        let restores = Arc::new(RestoreManager::new(
            db.clone(),
            catalog.clone(),
            contexts,
            engines,
            storages,
            sinks.clone(),
        ));
        let clusters = Arc::new(ClusterManager::new(
            db.clone(),
            catalog,
            Arc::new(PsqlClusterConnector::new()),
            backups.clone(),
            Arc::new(RoleAuthorizer),
            sinks,
        ));

        Ok(Self {
            config,
            db,
            backups,
            restores,
            clusters,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            // init 在 main.rs 中特判，不会走到这里
            Commands::Init { .. } => Ok(()),
            Commands::Serve => self.run_serve().await,
            Commands::Database(cmd) => self.handle_database(cmd).await,
            Commands::Storage(cmd) => self.handle_storage(cmd).await,
            Commands::Backup(cmd) => self.handle_backup(cmd).await,
            Commands::Restore(cmd) => self.handle_restore(cmd).await,
            Commands::Cluster(cmd) => self.handle_cluster(cmd).await,
            Commands::Audit { limit } => self.show_audit(limit).await,
        }
    }

    // ========== 调度器前台运行 ==========

    async fn run_serve(&self) -> Result<()> {
        // 上次运行残留的在途记录先判定为失败，避免永久阻塞调度
        let recovered = self.backups.recover_orphans().await?;
        if recovered > 0 {
            info!("已回收 {recovered} 条残留的在途任务记录");
        }

        let shutdown = CancellationToken::new();
        let backup_loop = tokio::spawn(
            BackupScheduler::new(self.db.clone(), self.backups.clone())
                .with_tick(Duration::from_secs(self.config.scheduler.backup_tick_secs))
                .run(shutdown.clone()),
        );
        let cluster_loop = tokio::spawn(
            ClusterScheduler::new(self.db.clone(), self.clusters.clone())
                .with_tick(Duration::from_secs(self.config.scheduler.cluster_tick_secs))
                .run(shutdown.clone()),
        );
        let audit_loop = tokio::spawn(AuditLogCleaner::new(self.db.clone()).run(shutdown.clone()));

        println!("🚀 调度器已启动，Ctrl+C 退出");
        tokio::signal::ctrl_c().await?;
        info!("收到退出信号，正在停止调度器");
        shutdown.cancel();

        let _ = backup_loop.await;
        let _ = cluster_loop.await;
        let _ = audit_loop.await;
        println!("👋 调度器已停止");
        Ok(())
    }

    // ========== 数据库实体 ==========

    async fn handle_database(&self, command: DatabaseCommand) -> Result<()> {
        match command {
            DatabaseCommand::Add {
                name,
                host,
                port,
                username,
                engine,
                tls,
            } => {
                let database = DatabaseEntity {
                    id: Uuid::new_v4(),
                    workspace_id: self.config.workspace.id,
                    name: name.clone(),
                    engine: EngineKind::parse(&engine)?,
                    connection: ConnectionInfo {
                        host,
                        port,
                        username,
                        use_tls: tls,
                    },
                    catalog_name: None,
                    created_at: Utc::now(),
                };
                self.db.save_database(database.clone()).await?;
                println!("✅ 已登记数据库 '{name}': {}", database.id);
            }
            DatabaseCommand::List => {
                let databases = self
                    .db
                    .list_databases_by_workspace(self.config.workspace.id)
                    .await?;
                if databases.is_empty() {
                    println!("工作区内还没有数据库，先用 'database add' 登记一个");
                    return Ok(());
                }
                for database in databases {
                    let config = self.db.find_backup_config(database.id).await?;
                    let enabled = config.map(|c| c.is_enabled).unwrap_or(false);
                    println!(
                        "{}  {}  {}:{}  {}  备份{}",
                        database.id,
                        database.name,
                        database.connection.host,
                        database.connection.port,
                        database.engine.as_str(),
                        if enabled { "已启用" } else { "未启用" },
                    );
                }
            }
            DatabaseCommand::Enable {
                database_id,
                storage,
                time,
            } => {
                let mut config = self.db.get_or_create_backup_config(database_id).await?;
                config.is_enabled = true;
                config.storage_id = Some(storage);
                config.schedule = Schedule::daily(Schedule::parse_time_of_day(&time)?);
                config.validate()?;
                self.db.save_backup_config(config).await?;
                println!("✅ 已启用备份，每日 {time} 触发");
            }
            DatabaseCommand::Disable { database_id } => {
                let mut config = self.db.get_or_create_backup_config(database_id).await?;
                config.is_enabled = false;
                self.db.save_backup_config(config).await?;
                println!("✅ 已停用备份");
            }
        }
        Ok(())
    }

    // ========== 存储后端 ==========

    async fn handle_storage(&self, command: StorageCommand) -> Result<()> {
        match command {
            StorageCommand::AddLocal { name } => {
                let storage = StorageRef {
                    id: Uuid::new_v4(),
                    workspace_id: self.config.workspace.id,
                    kind: StorageKind::Local,
                    name: name.clone(),
                };
                self.db.save_storage(storage.clone()).await?;
                println!(
                    "✅ 已登记本地存储 '{name}': {}（目录: {}）",
                    storage.id, self.config.storage.backup_dir
                );
            }
            StorageCommand::List => {
                let storages = self
                    .db
                    .list_storages_by_workspace(self.config.workspace.id)
                    .await?;
                if storages.is_empty() {
                    println!("还没有存储后端，先用 'storage add-local' 登记一个");
                    return Ok(());
                }
                for storage in storages {
                    println!("{}  {}  {}", storage.id, storage.name, storage.kind.as_str());
                }
            }
        }
        Ok(())
    }

    // ========== 备份任务 ==========

    async fn handle_backup(&self, command: BackupCommand) -> Result<()> {
        match command {
            BackupCommand::Run { database_id } => {
                println!("⏳ 开始备份...");
                match self.backups.make_backup(database_id, false).await? {
                    Some(backup_id) => println!("✅ 备份完成: {backup_id}"),
                    None => println!("⏭️ 该库已有备份在途，本次跳过"),
                }
            }
            BackupCommand::Cancel { backup_id } => {
                self.backups.cancel_backup(backup_id)?;
                println!("✅ 已发出取消信号: {backup_id}");
            }
            BackupCommand::List { database_id } => {
                let backups = self.backups.backup_history(database_id).await?;
                if backups.is_empty() {
                    println!("该库还没有备份记录");
                    return Ok(());
                }
                for backup in backups {
                    println!(
                        "{}  {}  {:.2}MB  {}ms  {}{}",
                        backup.id,
                        backup.status.as_str(),
                        backup.size_mb,
                        backup.duration_ms,
                        backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                        backup
                            .fail_message
                            .map(|m| format!("  {m}"))
                            .unwrap_or_default(),
                    );
                }
            }
            BackupCommand::Delete { backup_id } => {
                self.backups.delete_backup(backup_id).await?;
                println!("✅ 已删除备份及其产物: {backup_id}");
            }
        }
        Ok(())
    }

    // ========== 恢复任务 ==========

    async fn handle_restore(&self, command: RestoreCommand) -> Result<()> {
        match command {
            RestoreCommand::Run { backup_id, target } => {
                let target_database_id = match target {
                    Some(id) => id,
                    // 缺省恢复到备份来源库
                    None => {
                        self.db
                            .get_backup(backup_id)
                            .await?
                            .ok_or_else(|| anyhow::anyhow!("备份不存在: {backup_id}"))?
                            .database_id
                    }
                };
                println!("⏳ 开始恢复...");
                match self
                    .restores
                    .restore_backup(backup_id, target_database_id)
                    .await?
                {
                    Some(restore_id) => println!("✅ 恢复完成: {restore_id}"),
                    None => println!("⏭️ 该备份已有恢复在途，本次跳过"),
                }
            }
            RestoreCommand::Cancel { restore_id } => {
                self.restores.cancel_restore(restore_id)?;
                println!("✅ 已发出取消信号: {restore_id}");
            }
        }
        Ok(())
    }

    // ========== 集群 ==========

    async fn handle_cluster(&self, command: ClusterCommand) -> Result<()> {
        match command {
            ClusterCommand::Add {
                name,
                host,
                port,
                username,
                password,
                enable_backups,
                storage,
                excluded,
            } => {
                let cluster = Cluster {
                    id: Uuid::new_v4(),
                    workspace_id: self.config.workspace.id,
                    name: name.clone(),
                    engine: EngineKind::Postgres,
                    connection: ConnectionInfo {
                        host,
                        port,
                        username,
                        use_tls: false,
                    },
                    password,
                    is_backups_enabled: enable_backups,
                    store_period: StorePeriod::Week,
                    schedule: None,
                    storage_id: storage,
                    notify_on: NotificationKind::join_list(&[
                        NotificationKind::BackupFailed,
                        NotificationKind::BackupSuccess,
                    ]),
                    cpu_count: 1,
                    last_run_at: None,
                    excluded_databases: excluded,
                };
                self.clusters.save_cluster(&operator(), cluster.clone()).await?;
                println!("✅ 已登记集群 '{name}': {}", cluster.id);
            }
            ClusterCommand::List => {
                let clusters = self
                    .clusters
                    .list_clusters(&operator(), self.config.workspace.id)
                    .await?;
                if clusters.is_empty() {
                    println!("工作区内还没有集群");
                    return Ok(());
                }
                for cluster in clusters {
                    println!(
                        "{}  {}  {}:{}  发现备份{}  上次运行: {}",
                        cluster.id,
                        cluster.name,
                        cluster.connection.host,
                        cluster.connection.port,
                        if cluster.is_backups_enabled {
                            "已启用"
                        } else {
                            "未启用"
                        },
                        cluster
                            .last_run_at
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "从未".to_string()),
                    );
                }
            }
            ClusterCommand::Run { cluster_id } => {
                println!("⏳ 开始集群发现与备份扇出...");
                let report = self.clusters.run_backup(&operator(), cluster_id).await?;
                println!(
                    "✅ 发现 {} 个数据库，新建 {} 个，触发 {} 个备份",
                    report.discovered, report.created, report.triggered
                );
            }
            ClusterCommand::Preview {
                cluster_id,
                options,
            } => {
                let changes = self
                    .clusters
                    .preview_propagation(&operator(), cluster_id, propagation_options(options))
                    .await?;
                print_propagation_changes(&changes, "预览");
            }
            ClusterCommand::Apply {
                cluster_id,
                options,
            } => {
                let changes = self
                    .clusters
                    .apply_propagation(&operator(), cluster_id, propagation_options(options))
                    .await?;
                print_propagation_changes(&changes, "已应用");
            }
            ClusterCommand::Delete { cluster_id } => {
                self.clusters.delete_cluster(&operator(), cluster_id).await?;
                println!("✅ 已删除集群: {cluster_id}");
            }
        }
        Ok(())
    }

    // ========== 审计 ==========

    async fn show_audit(&self, limit: usize) -> Result<()> {
        let entries = self.db.list_audit_logs(limit).await?;
        if entries.is_empty() {
            println!("还没有审计记录");
            return Ok(());
        }
        for entry in entries {
            println!(
                "{}  {}  {}  {}{}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.actor,
                entry.action,
                entry.subject.unwrap_or_default(),
                entry
                    .details
                    .map(|d| format!("  {d}"))
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }
}

fn propagation_options(args: PropagationArgs) -> PropagationOptions {
    PropagationOptions {
        apply_storage: args.storage,
        apply_schedule: args.schedule,
        apply_enabled: args.enabled,
        respect_exclusions: args.respect_exclusions,
    }
}

fn print_propagation_changes(changes: &[PropagationChange], verb: &str) {
    if changes.is_empty() {
        println!("所有数据库配置已与集群默认设置一致");
        return;
    }
    println!("{verb} {} 处差异:", changes.len());
    for change in changes {
        let mut axes = Vec::new();
        if change.change_storage {
            axes.push("存储");
        }
        if change.change_schedule {
            axes.push("调度");
        }
        if change.change_enabled {
            axes.push("启用开关");
        }
        println!("  {}  {}  [{}]", change.database_id, change.name, axes.join(", "));
    }
}
