//! Actions the service guards, and the permission each one requires.

use crate::auth::{Permission, Scope};
use crate::impl_simple_perm;

/// See every cloud and its effective options.
pub struct ListClouds;
impl_simple_perm!(ListClouds, Permission::Read);

/// Try out connection parameters before they are saved.
pub struct TestConnection;
impl_simple_perm!(TestConnection, Permission::Configure);

/// Launch a worker on a cloud. `Configure` on the cloud implies this.
pub struct ProvisionWorker {
    pub cloud: String,
}
impl_simple_perm!(
    ProvisionWorker,
    Permission::Provision,
    self,
    Scope::Cloud(self.cloud.clone())
);

/// List the servers a cloud has launched.
pub struct ReadWorkers {
    pub cloud: String,
}
impl_simple_perm!(
    ReadWorkers,
    Permission::Read,
    self,
    Scope::Cloud(self.cloud.clone())
);

/// Retire a worker of a cloud.
pub struct TerminateWorker {
    pub cloud: String,
}
impl_simple_perm!(
    TerminateWorker,
    Permission::Provision,
    self,
    Scope::Cloud(self.cloud.clone())
);

/// Drop every cached OpenStack session.
pub struct InvalidateClients;
impl_simple_perm!(InvalidateClients, Permission::Administer);
