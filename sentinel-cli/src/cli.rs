use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// 数据库实体相关命令
#[derive(Subcommand, Debug)]
pub enum DatabaseCommand {
    /// 登记一个数据库
    Add {
        /// 数据库显示名，同时作为连接内目录名
        name: String,
        /// 主机地址
        #[arg(long, default_value = "localhost")]
        host: String,
        /// 端口
        #[arg(long, default_value = "5432")]
        port: u16,
        /// 连接用户名
        #[arg(long, default_value = "postgres")]
        username: String,
        /// 数据库引擎 (POSTGRES/MYSQL/MARIADB/MONGODB)
        #[arg(long, default_value = "POSTGRES")]
        engine: String,
        /// 启用TLS连接
        #[arg(long)]
        tls: bool,
    },
    /// 列出工作区内的数据库
    List,
    /// 启用备份并绑定存储后端
    Enable {
        /// 数据库 ID
        database_id: Uuid,
        /// 存储后端 ID
        #[arg(long)]
        storage: Uuid,
        /// 每日触发时刻，格式 HH:MM
        #[arg(long, default_value = "04:00")]
        time: String,
    },
    /// 停用备份
    Disable {
        /// 数据库 ID
        database_id: Uuid,
    },
}

/// 备份任务相关命令
#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// 立即执行一次备份
    Run {
        /// 数据库 ID
        database_id: Uuid,
    },
    /// 取消在途备份
    Cancel {
        /// 备份 ID
        backup_id: Uuid,
    },
    /// 列出数据库的备份历史
    List {
        /// 数据库 ID
        database_id: Uuid,
    },
    /// 删除备份记录及产物
    Delete {
        /// 备份 ID
        backup_id: Uuid,
    },
}

/// 恢复任务相关命令
#[derive(Subcommand, Debug)]
pub enum RestoreCommand {
    /// 把备份恢复到目标数据库
    Run {
        /// 备份 ID
        backup_id: Uuid,
        /// 目标数据库 ID（缺省恢复到源库）
        #[arg(long)]
        target: Option<Uuid>,
    },
    /// 取消在途恢复
    Cancel {
        /// 恢复 ID
        restore_id: Uuid,
    },
}

/// 集群相关命令
#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// 登记一个集群连接
    Add {
        /// 集群名称
        name: String,
        /// 主机地址
        #[arg(long, default_value = "localhost")]
        host: String,
        /// 端口
        #[arg(long, default_value = "5432")]
        port: u16,
        /// 连接用户名
        #[arg(long, default_value = "postgres")]
        username: String,
        /// 连接密码
        #[arg(long)]
        password: String,
        /// 发现新库后默认启用备份
        #[arg(long)]
        enable_backups: bool,
        /// 默认存储后端 ID（启用备份时必填）
        #[arg(long)]
        storage: Option<Uuid>,
        /// 排除的数据库名，可重复指定
        #[arg(long = "exclude")]
        excluded: Vec<String>,
    },
    /// 列出工作区内的集群
    List,
    /// 立即执行一轮发现与备份扇出
    Run {
        /// 集群 ID
        cluster_id: Uuid,
    },
    /// 预览默认设置下发的差异
    Preview {
        /// 集群 ID
        cluster_id: Uuid,
        #[command(flatten)]
        options: PropagationArgs,
    },
    /// 应用默认设置下发
    Apply {
        /// 集群 ID
        cluster_id: Uuid,
        #[command(flatten)]
        options: PropagationArgs,
    },
    /// 删除集群
    Delete {
        /// 集群 ID
        cluster_id: Uuid,
    },
}

/// 设置下发的维度选择
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct PropagationArgs {
    /// 对齐存储后端
    #[arg(long)]
    pub storage: bool,
    /// 对齐调度定义
    #[arg(long)]
    pub schedule: bool,
    /// 对齐启用开关
    #[arg(long)]
    pub enabled: bool,
    /// 跳过排除名单内的库
    #[arg(long, default_value = "true")]
    pub respect_exclusions: bool,
}

/// 存储后端相关命令
#[derive(Subcommand, Debug)]
pub enum StorageCommand {
    /// 登记一个本地目录存储后端（目录取自配置文件 storage.backup_dir）
    AddLocal {
        /// 存储名称
        name: String,
    },
    /// 列出已登记的存储后端
    List,
}

/// Sentinel CLI - 数据库备份调度与编排工具
#[derive(Parser)]
#[command(name = "sentinel-cli")]
#[command(version)]
#[command(about = "数据库备份调度与编排工具")]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// 详细输出
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 首次使用时初始化配置文件和本地元数据库
    Init {
        /// 如果配置文件已存在，强制覆盖
        #[arg(long)]
        force: bool,
    },
    /// 前台运行调度器（备份tick、集群tick、审计清理）
    Serve,
    /// 数据库管理
    #[command(subcommand)]
    Database(DatabaseCommand),
    /// 存储后端管理
    #[command(subcommand)]
    Storage(StorageCommand),
    /// 备份任务管理
    #[command(subcommand)]
    Backup(BackupCommand),
    /// 恢复任务管理
    #[command(subcommand)]
    Restore(RestoreCommand),
    /// 集群管理
    #[command(subcommand)]
    Cluster(ClusterCommand),
    /// 查看最近的审计日志
    Audit {
        /// 显示条数
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}
