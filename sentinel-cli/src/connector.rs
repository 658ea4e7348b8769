use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use sentinel_core::catalog::ClusterConnector;
use sentinel_core::models::{Cluster, EngineKind};
use sentinel_core::{Result, SentinelError};

/// 通过 psql 枚举Postgres集群内可达目录的连接器
pub struct PsqlClusterConnector;

impl PsqlClusterConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PsqlClusterConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterConnector for PsqlClusterConnector {
    async fn list_catalogs(&self, cluster: &Cluster) -> Result<Vec<String>> {
        if cluster.engine != EngineKind::Postgres {
            return Err(SentinelError::UnsupportedEngine(
                cluster.engine.as_str().to_string(),
            ));
        }
        which::which("psql").map_err(|_| {
            SentinelError::cluster("未找到 psql，请安装 PostgreSQL 客户端工具".to_string())
        })?;

        debug!(cluster = %cluster.name, host = %cluster.connection.host, "枚举集群目录");
        let output = Command::new("psql")
            .arg("-h")
            .arg(&cluster.connection.host)
            .arg("-p")
            .arg(cluster.connection.port.to_string())
            .arg("-U")
            .arg(&cluster.connection.username)
            .arg("-d")
            .arg("postgres")
            .arg("-At")
            .arg("-c")
            .arg("SELECT datname FROM pg_database WHERE datistemplate = false")
            .env("PGPASSWORD", &cluster.password)
            .output()
            .await
            .map_err(|e| SentinelError::cluster(format!("执行 psql 失败: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SentinelError::cluster(format!(
                "psql 退出码 {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let names = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Ok(names)
    }
}
