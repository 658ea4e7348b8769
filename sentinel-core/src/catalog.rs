use async_trait::async_trait;
use uuid::Uuid;

use crate::db::DuckDbManager;
use crate::error::{Result, SentinelError};
use crate::models::{Cluster, DatabaseEntity, Principal, Role};

/// 数据库实体目录
#[async_trait]
pub trait DatabaseCatalog: Send + Sync + 'static {
    async fn get_database(&self, database_id: Uuid) -> Result<Option<DatabaseEntity>>;

    async fn list_by_workspace(&self, workspace_id: Uuid) -> Result<Vec<DatabaseEntity>>;

    async fn create(&self, database: DatabaseEntity) -> Result<()>;

    async fn transfer_to_workspace(&self, database_id: Uuid, workspace_id: Uuid) -> Result<()>;
}

/// 本地元数据库实现的实体目录
#[derive(Clone)]
pub struct DuckDbCatalog {
    db: DuckDbManager,
}

impl DuckDbCatalog {
    pub fn new(db: DuckDbManager) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DatabaseCatalog for DuckDbCatalog {
    async fn get_database(&self, database_id: Uuid) -> Result<Option<DatabaseEntity>> {
        self.db.get_database(database_id).await
    }

    async fn list_by_workspace(&self, workspace_id: Uuid) -> Result<Vec<DatabaseEntity>> {
        self.db.list_databases_by_workspace(workspace_id).await
    }

    async fn create(&self, database: DatabaseEntity) -> Result<()> {
        self.db.save_database(database).await
    }

    async fn transfer_to_workspace(&self, database_id: Uuid, workspace_id: Uuid) -> Result<()> {
        self.db.transfer_database(database_id, workspace_id).await
    }
}

/// 集群目标连接器：用集群凭据枚举可达的目录名。
/// 连接失败只中断当前集群这一轮发现，不影响其他集群。
#[async_trait]
pub trait ClusterConnector: Send + Sync + 'static {
    async fn list_catalogs(&self, cluster: &Cluster) -> Result<Vec<String>>;
}

/// 工作区管理权限校验（完整RBAC由外层负责）
pub trait Authorizer: Send + Sync + 'static {
    fn can_manage_dbs(&self, principal: &Principal, workspace_id: Uuid) -> Result<()>;
}

/// 放行所有请求，单机部署模式使用
#[derive(Debug, Default)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn can_manage_dbs(&self, _principal: &Principal, _workspace_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// 按角色校验：只有管理员能管理工作区（后台系统主体即管理员角色）
#[derive(Debug, Default)]
pub struct RoleAuthorizer;

impl Authorizer for RoleAuthorizer {
    fn can_manage_dbs(&self, principal: &Principal, workspace_id: Uuid) -> Result<()> {
        match principal.role {
            Role::Admin => Ok(()),
            Role::Member => Err(SentinelError::permission_denied(format!(
                "无权管理工作区 {workspace_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_authorizer_rejects_member() {
        let authorizer = RoleAuthorizer;
        let workspace_id = Uuid::new_v4();

        assert!(
            authorizer
                .can_manage_dbs(&Principal::system(), workspace_id)
                .is_ok()
        );

        let member = Principal {
            id: Uuid::new_v4(),
            role: Role::Member,
        };
        assert!(matches!(
            authorizer.can_manage_dbs(&member, workspace_id),
            Err(SentinelError::PermissionDenied(_))
        ));
    }
}
