use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub workspace: WorkspaceConfig,
    pub data: DataConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

/// 工作区配置，单机部署只有一个默认工作区
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub id: Uuid,
}

/// 本地元数据库配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DataConfig {
    pub db_path: String,
}

/// 本地存储后端配置，备份产物统一落在这个目录下
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    pub backup_dir: String,
}

/// 调度周期配置（秒）
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub backup_tick_secs: u64,
    pub cluster_tick_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig { id: Uuid::new_v4() },
            data: DataConfig {
                db_path: "sentinel.db".to_string(),
            },
            storage: StorageConfig {
                backup_dir: "backups".to_string(),
            },
            scheduler: SchedulerConfig {
                backup_tick_secs: 60,
                cluster_tick_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// 从指定路径加载配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "配置文件 '{}' 未找到，请先运行 'sentinel-cli init'",
                path.display()
            );
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 把配置写入指定路径
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }
}
