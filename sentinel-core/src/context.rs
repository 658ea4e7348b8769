use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SentinelError};

/// 在途任务取消句柄注册表。
///
/// 只保存取消句柄，任务状态一律以持久化的备份/恢复记录为准。
/// 读写锁仅在访问map期间持有，绝不跨IO持锁。
#[derive(Debug, Default)]
pub struct BackupContextManager {
    cancel_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl BackupContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册在途任务的取消句柄
    pub fn register(&self, job_id: Uuid, token: CancellationToken) {
        if let Ok(mut tokens) = self.cancel_tokens.write() {
            tokens.insert(job_id, token);
        }
    }

    /// 取消在途任务；任务不存在（已完成/已取消/从未启动）时返回 NotFound
    pub fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut tokens = self
            .cancel_tokens
            .write()
            .map_err(|_| SentinelError::custom("取消句柄注册表锁已失效"))?;

        match tokens.remove(&job_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(SentinelError::not_found(format!(
                "任务不在进行中或已结束: {job_id}"
            ))),
        }
    }

    /// 注销任务句柄，幂等；编排器在每个终态转换处都会调用
    pub fn unregister(&self, job_id: Uuid) {
        if let Ok(mut tokens) = self.cancel_tokens.write() {
            tokens.remove(&job_id);
        }
    }

    pub fn is_registered(&self, job_id: Uuid) -> bool {
        self.cancel_tokens
            .read()
            .map(|tokens| tokens.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.cancel_tokens
            .read()
            .map(|tokens| tokens.len())
            .unwrap_or(0)
    }
}

/// 任务结束时保证注销句柄的守卫，错误路径也不会泄漏注册项
pub struct ContextGuard {
    contexts: Arc<BackupContextManager>,
    job_id: Uuid,
}

impl ContextGuard {
    pub fn new(contexts: Arc<BackupContextManager>, job_id: Uuid) -> Self {
        Self { contexts, job_id }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.contexts.unregister(self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_roundtrip() {
        let manager = BackupContextManager::new();
        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();

        manager.register(job_id, token.clone());
        assert!(manager.is_registered(job_id));

        manager.cancel(job_id).unwrap();
        assert!(token.is_cancelled());
        assert!(!manager.is_registered(job_id));
    }

    #[test]
    fn test_cancel_unknown_job_returns_not_found() {
        let manager = BackupContextManager::new();
        let err = manager.cancel(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let manager = BackupContextManager::new();
        let job_id = Uuid::new_v4();

        manager.register(job_id, CancellationToken::new());
        manager.unregister(job_id);
        manager.unregister(job_id);
        assert!(!manager.is_registered(job_id));
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let manager = Arc::new(BackupContextManager::new());
        let job_id = Uuid::new_v4();
        manager.register(job_id, CancellationToken::new());

        {
            let _guard = ContextGuard::new(manager.clone(), job_id);
            assert!(manager.is_registered(job_id));
        }

        assert!(!manager.is_registered(job_id));
        assert_eq!(manager.in_flight_count(), 0);
    }
}
