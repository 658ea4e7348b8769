use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use sentinel_core::dispatch::{ExecutionReport, ExecutionStrategy, ProgressFn, StorageBackend};
use sentinel_core::models::{Backup, BackupConfig, DatabaseEntity};
use sentinel_core::{Result, SentinelError};

/// 基于 pg_dump/pg_restore 的Postgres执行策略。
///
/// 备份产物先落在临时目录，完成后整体流入存储后端。
/// 认证走 libpq 的常规途径（.pgpass / PGPASSWORD 环境变量）。
pub struct PgDumpStrategy;

impl PgDumpStrategy {
    pub fn new() -> Self {
        Self
    }

    fn preflight(binary: &str) -> Result<()> {
        which::which(binary).map_err(|_| {
            SentinelError::execution(format!("未找到 {binary}，请安装 PostgreSQL 客户端工具"))
        })?;
        Ok(())
    }
}

impl Default for PgDumpStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStrategy for PgDumpStrategy {
    async fn backup(
        &self,
        cancel: CancellationToken,
        backup_id: Uuid,
        _config: &BackupConfig,
        database: &DatabaseEntity,
        storage: Arc<dyn StorageBackend>,
        on_progress: ProgressFn,
    ) -> Result<ExecutionReport> {
        Self::preflight("pg_dump")?;

        let workdir = tempfile::tempdir()?;
        let dump_path = workdir.path().join(format!("{backup_id}.dump"));
        let catalog = database
            .catalog_name
            .clone()
            .unwrap_or_else(|| database.name.clone());

        let mut command = Command::new("pg_dump");
        command
            .arg("-h")
            .arg(&database.connection.host)
            .arg("-p")
            .arg(database.connection.port.to_string())
            .arg("-U")
            .arg(&database.connection.username)
            .arg("--no-password")
            .arg("-Fc")
            .arg("-f")
            .arg(&dump_path)
            .arg(&catalog)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // 取消时随任务一起结束外部进程
            .kill_on_drop(true);

        debug!(database = %database.name, "执行 pg_dump");
        let child = command
            .spawn()
            .map_err(|e| SentinelError::execution(format!("启动 pg_dump 失败: {e}")))?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(SentinelError::Cancelled),
            output = child.wait_with_output() => {
                output.map_err(|e| SentinelError::execution(format!("等待 pg_dump 失败: {e}")))?
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SentinelError::execution(format!(
                "pg_dump 退出码 {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let mut dump_file = tokio::fs::File::open(&dump_path).await?;
        let written = storage.save_file(backup_id, &mut dump_file).await?;
        let size_mb = written as f64 / 1024.0 / 1024.0;
        on_progress(size_mb);

        info!(database = %database.name, size_mb, "备份产物已写入存储后端");
        Ok(ExecutionReport { size_mb })
    }

    async fn restore(
        &self,
        cancel: CancellationToken,
        restore_id: Uuid,
        backup: &Backup,
        target: &DatabaseEntity,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<()> {
        Self::preflight("pg_restore")?;

        // 先把产物从存储后端取回本地
        let workdir = tempfile::tempdir()?;
        let dump_path = workdir.path().join(format!("{restore_id}.dump"));
        let mut reader = storage.get_file(backup.id).await?;
        let mut dump_file = tokio::fs::File::create(&dump_path).await?;
        tokio::io::copy(&mut reader, &mut dump_file).await?;
        drop(dump_file);

        let catalog = target
            .catalog_name
            .clone()
            .unwrap_or_else(|| target.name.clone());

        let mut command = Command::new("pg_restore");
        command
            .arg("-h")
            .arg(&target.connection.host)
            .arg("-p")
            .arg(target.connection.port.to_string())
            .arg("-U")
            .arg(&target.connection.username)
            .arg("--no-password")
            .arg("--clean")
            .arg("--if-exists")
            .arg("-d")
            .arg(&catalog)
            .arg(&dump_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target = %target.name, "执行 pg_restore");
        let child = command
            .spawn()
            .map_err(|e| SentinelError::execution(format!("启动 pg_restore 失败: {e}")))?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(SentinelError::Cancelled),
            output = child.wait_with_output() => {
                output.map_err(|e| SentinelError::execution(format!("等待 pg_restore 失败: {e}")))?
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SentinelError::execution(format!(
                "pg_restore 退出码 {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        info!(target = %target.name, "恢复完成");
        Ok(())
    }
}
