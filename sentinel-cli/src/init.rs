use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use sentinel_core::db::DuckDbManager;

use crate::config::AppConfig;

/// 运行独立的初始化流程：生成配置文件并建好本地元数据库
pub async fn run_init(config_path: &Path, force: bool) -> Result<()> {
    info!("🛡️ Sentinel 初始化");
    info!("======================");

    if !force && config_path.exists() {
        warn!("⚠️  配置文件 '{}' 已存在", config_path.display());
        info!("如果要重新初始化，请使用 --force 参数");
        info!("示例: sentinel-cli init --force");
        return Ok(());
    }

    info!("📋 步骤 1: 创建配置文件和目录结构");

    let config = AppConfig::default();
    config.save(config_path)?;
    info!("   ✅ 创建配置文件: {}", config_path.display());

    std::fs::create_dir_all(&config.storage.backup_dir)?;
    info!("   ✅ 创建备份存储目录: {}", config.storage.backup_dir);

    info!("📋 步骤 2: 初始化本地元数据库");

    let _db = DuckDbManager::new(&config.data.db_path).await?;
    info!("   ✅ 创建DuckDB元数据库: {}", config.data.db_path);

    info!("🎉 初始化完成，接下来:");
    info!("   1. sentinel-cli storage add-local <名称>   登记存储后端");
    info!("   2. sentinel-cli database add <名称>        登记数据库");
    info!("   3. sentinel-cli database enable <ID> --storage <存储ID>");
    info!("   4. sentinel-cli serve                      前台运行调度器");
    Ok(())
}
