use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SentinelError};
use crate::models::{Backup, BackupConfig, DatabaseEntity, EngineKind, StorageKind, StorageRef};

/// 备份执行进度回调（已完成的MB数）
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// 执行策略返回的备份产物元数据
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub size_mb: f64,
}

/// 引擎相关的备份/恢复执行策略。
///
/// 实现方必须持续观察取消句柄并及时停止底层外部进程；
/// 编排层只发取消信号，不做强制终止。
#[async_trait]
pub trait ExecutionStrategy: Send + Sync + 'static {
    async fn backup(
        &self,
        cancel: CancellationToken,
        backup_id: Uuid,
        config: &BackupConfig,
        database: &DatabaseEntity,
        storage: Arc<dyn StorageBackend>,
        on_progress: ProgressFn,
    ) -> Result<ExecutionReport>;

    async fn restore(
        &self,
        cancel: CancellationToken,
        restore_id: Uuid,
        backup: &Backup,
        target: &DatabaseEntity,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ExecutionStrategy")
    }
}

/// 存储后端能力接口，具体IO实现在引擎之外
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    fn kind(&self) -> StorageKind;

    async fn save_file(
        &self,
        file_id: Uuid,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    async fn get_file(&self, file_id: Uuid) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn delete_file(&self, file_id: Uuid) -> Result<()>;

    async fn test_connection(&self) -> Result<()>;

    fn validate(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StorageBackend")
    }
}

/// 按数据库引擎类型选择执行策略的分发表。
/// 新增引擎只需注册新策略，不触碰调度/重试/取消逻辑。
#[derive(Default)]
pub struct ExecutionDispatch {
    strategies: HashMap<EngineKind, Arc<dyn ExecutionStrategy>>,
}

impl ExecutionDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: EngineKind, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.insert(engine, strategy);
    }

    pub fn resolve(&self, engine: EngineKind) -> Result<Arc<dyn ExecutionStrategy>> {
        self.strategies
            .get(&engine)
            .cloned()
            .ok_or_else(|| SentinelError::UnsupportedEngine(engine.as_str().to_string()))
    }
}

/// 按存储后端类型选择实现的分发表
#[derive(Default)]
pub struct StorageDispatch {
    backends: HashMap<StorageKind, Arc<dyn StorageBackend>>,
}

impl StorageDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn resolve(&self, storage: &StorageRef) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(&storage.kind)
            .cloned()
            .ok_or_else(|| SentinelError::UnsupportedStorage(storage.kind.as_str().to_string()))
    }
}

/// 本地目录存储后端，产物以 `<file_id>.dump` 落盘
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, file_id: Uuid) -> PathBuf {
        self.root.join(format!("{file_id}.dump"))
    }
}

#[async_trait]
impl StorageBackend for LocalDirStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn save_file(
        &self,
        file_id: Uuid,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::File::create(self.file_path(file_id)).await?;
        let written = tokio::io::copy(data, &mut file).await?;
        Ok(written)
    }

    async fn get_file(&self, file_id: Uuid) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.file_path(file_id);
        if !path.exists() {
            return Err(SentinelError::not_found(format!(
                "备份文件不存在: {}",
                path.display()
            )));
        }
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn delete_file(&self, file_id: Uuid) -> Result<()> {
        let path = self.file_path(file_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(SentinelError::invalid_config("存储目录不能为空"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStrategy;

    #[async_trait]
    impl ExecutionStrategy for NoopStrategy {
        async fn backup(
            &self,
            _cancel: CancellationToken,
            _backup_id: Uuid,
            _config: &BackupConfig,
            _database: &DatabaseEntity,
            _storage: Arc<dyn StorageBackend>,
            _on_progress: ProgressFn,
        ) -> Result<ExecutionReport> {
            Ok(ExecutionReport { size_mb: 0.0 })
        }

        async fn restore(
            &self,
            _cancel: CancellationToken,
            _restore_id: Uuid,
            _backup: &Backup,
            _target: &DatabaseEntity,
            _storage: Arc<dyn StorageBackend>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_unknown_engine_fails() {
        let dispatch = ExecutionDispatch::new();
        let err = dispatch.resolve(EngineKind::Mongodb).unwrap_err();
        assert!(matches!(err, SentinelError::UnsupportedEngine(_)));
    }

    #[test]
    fn test_registered_engine_resolves() {
        let mut dispatch = ExecutionDispatch::new();
        dispatch.register(EngineKind::Postgres, Arc::new(NoopStrategy));
        assert!(dispatch.resolve(EngineKind::Postgres).is_ok());
        assert!(dispatch.resolve(EngineKind::Mysql).is_err());
    }

    #[tokio::test]
    async fn test_local_dir_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDirStorage::new(dir.path());
        let file_id = Uuid::new_v4();

        let mut data: &[u8] = b"dump-bytes";
        let written = storage.save_file(file_id, &mut data).await.unwrap();
        assert_eq!(written, 10);

        let mut reader = storage.get_file(file_id).await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"dump-bytes");

        storage.delete_file(file_id).await.unwrap();
        assert!(storage.get_file(file_id).await.is_err());
    }

    #[test]
    fn test_storage_dispatch_by_kind() {
        let mut dispatch = StorageDispatch::new();
        dispatch.register(Arc::new(LocalDirStorage::new("/tmp/sentinel-test")));

        let local = StorageRef {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            kind: StorageKind::Local,
            name: "local".to_string(),
        };
        assert!(dispatch.resolve(&local).is_ok());

        let s3 = StorageRef {
            kind: StorageKind::S3,
            ..local
        };
        assert!(matches!(
            dispatch.resolve(&s3).unwrap_err(),
            SentinelError::UnsupportedStorage(_)
        ));
    }
}
