//! Per-request authorization.
//!
//! The security system uses a subject-privilege abstraction:
//!   - a _permission_ is an action paired with the scope it acts on (e.g. provisioning a worker
//!     on a particular cloud is a permission).
//!   - a _subject_ is an entity that can perform an action, or, to use the parlance we've
//!     established, can have privileges (e.g. the holder of an API token).
//!   - a _privilege_ is a _(subject, permission)_ pair.
//!
//! In this system, permissions are represented by [`PrivilegedAction`], subjects are represented
//! by [`Subject`]s, and privileges by [`Privilege`]s. Whether a subject holds a permission is
//! decided by an [`Acl`].

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

pub mod extract;
pub mod token;

/// Security identity of a subject.
pub type Sid = String;

/// Accessible _subject_ information (see module docs).
#[derive(Debug, Clone)]
pub struct SubjectDetail {
    sid: Sid,
}
impl SubjectDetail {
    pub fn sid(&self) -> &str {
        &self.sid
    }
}

/// Opaque _subject_ type (see module docs).
///
/// The actual information inside the subject (i.e. the [`SubjectDetail`]) can only be accessed
/// through [`Privilege::subject`]. In this way, it is not possible to forge a `SubjectDetail` _and_
/// pass it to a privileged function that requires a [`Privilege`].
//
// Note that an Axum extractor for `Subject` is implemented in the `extract` module.
#[derive(Debug, Clone)]
pub struct Subject(SubjectDetail);
impl Subject {
    /// Only authentication code (and tests) should create subjects.
    pub fn authenticated(sid: impl Into<Sid>) -> Self {
        Self(SubjectDetail { sid: sid.into() })
    }
}

// -- SECTION: PERMISSIONS

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Administer,
    Read,
    /// Change the configuration of an item (here: a cloud).
    Configure,
    /// Launch new workers on a cloud.
    Provision,
}
impl Permission {
    /// The permission that, when held, also grants `self`.
    pub fn implied_by(self) -> Option<Permission> {
        match self {
            Permission::Administer => None,
            Permission::Read => Some(Permission::Administer),
            Permission::Configure => Some(Permission::Administer),
            Permission::Provision => Some(Permission::Configure),
        }
    }
}
impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Permission::Administer => "administer",
            Permission::Read => "read",
            Permission::Configure => "configure",
            Permission::Provision => "provision",
        };
        write!(f, "{name}")
    }
}

/// What a permission is checked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Cloud(String),
}
impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Cloud(name) => write!(f, "cloud '{name}'"),
        }
    }
}

/// Access control list.
pub trait Acl: Send + Sync {
    /// Whether `sid` was granted exactly `permission` on `scope`.
    fn grants(&self, sid: &str, scope: &Scope, permission: Permission) -> bool;

    /// Whether `sid` holds `permission` on `scope`, directly or through a permission implying it.
    fn has_permission(&self, sid: &str, scope: &Scope, permission: Permission) -> bool {
        let mut candidate = Some(permission);
        while let Some(p) = candidate {
            if self.grants(sid, scope, p) {
                return true;
            }
            candidate = p.implied_by();
        }
        false
    }
}

// -- SECTION: AUTHORIZATIONS

/// Things that may go wrong with an attempt to authorize an action.
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("access denied: {sid} is missing the {permission} permission on {scope}")]
    Unauthorized {
        sid: Sid,
        permission: Permission,
        scope: Scope,
    },
}

/// Internal type of [`PermissionResult`]. Not exposed publicly to prevent arbitrary construction.
enum PermissionResultInner {
    /// The query succeeded, and [`PermissionResult::try_into_privilege`] can be used to make
    /// `self` into a [`Privilege`].
    Authorized(Subject),
    /// The query failed.
    Unauthorized(AuthorizationError),
}
/// Result of a permission query.
pub struct PermissionResult(PermissionResultInner);
impl PermissionResult {
    fn unauthorized(error: AuthorizationError) -> Self {
        Self(PermissionResultInner::Unauthorized(error))
    }

    /// Try to create a [`Privilege`] from `self` and a given [`PrivilegedAction`].
    pub fn try_into_privilege<'source, A: PrivilegedAction>(
        self,
        action: A,
    ) -> Result<Privilege<'source, A>, AuthorizationError> {
        match self {
            Self(PermissionResultInner::Authorized(subject)) => Ok(Privilege {
                subject,
                action,
                _pd: Default::default(),
            }),
            Self(PermissionResultInner::Unauthorized(e)) => Err(e),
        }
    }
}

/// Semantically, represents a type of _permission_ (see module level docs).
pub trait PrivilegedAction: Sized {
    fn authorize<'source, PQE: PermissionQueryExecutor>(
        self,
        perm_query_exec: &PQE,
    ) -> Result<Privilege<'source, Self>, AuthorizationError>;
}

/// Represents a _privilege_ (see module level docs).
pub struct Privilege<'a, A: PrivilegedAction> {
    subject: Subject,
    action: A,
    _pd: PhantomData<&'a ()>,
}
impl<A: PrivilegedAction> Privilege<'_, A> {
    /// Extract the subject information. This is the _only_ way to access the inside of a
    /// `SubjectDetail`.
    pub fn subject(&self) -> &SubjectDetail {
        &self.subject.0
    }
    pub fn action(&self) -> &A {
        &self.action
    }
}

/// Abstracts the ability to query whether a certain subject has a permission.
pub trait PermissionQueryExecutor {
    fn query(&self, scope: Scope, permission: Permission) -> PermissionResult;
}

/// Abstracts a source of permissions; semantically, a subject and a capability to look up
/// permissions for that subject (and only that subject).
pub trait AuthorizationSource {
    /// Attempt to authorize the subject embedded in this source to use a permission.
    fn authorize<'a, A: PrivilegedAction>(
        &'a self,
        action: A,
    ) -> Result<Privilege<'a, A>, AuthorizationError>;
}

/// [`AuthorizationSource`] and [`PermissionQueryExecutor`] backed by an [`Acl`].
#[derive(Clone)]
pub struct AclAuth {
    acl: Arc<dyn Acl>,
    subject: Subject,
}
impl AclAuth {
    pub fn new(acl: Arc<dyn Acl>, subject: Subject) -> Self {
        Self { acl, subject }
    }
}
impl PermissionQueryExecutor for AclAuth {
    fn query(&self, scope: Scope, permission: Permission) -> PermissionResult {
        let sid = &self.subject.0.sid;
        if self.acl.has_permission(sid, &scope, permission) {
            PermissionResult(PermissionResultInner::Authorized(self.subject.clone()))
        } else {
            tracing::warn!("{sid} denied {permission} on {scope}");
            PermissionResult::unauthorized(AuthorizationError::Unauthorized {
                sid: sid.clone(),
                permission,
                scope,
            })
        }
    }
}
impl AuthorizationSource for AclAuth {
    fn authorize<'a, A: PrivilegedAction>(
        &'a self,
        action: A,
    ) -> Result<Privilege<'a, A>, AuthorizationError> {
        action.authorize(self)
    }
}
impl std::fmt::Debug for AclAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sid ({})", self.subject.0.sid)
    }
}

//--

/// Helper macro to implement simple [`PrivilegedAction`]s.
///
/// Syntax:
/// ```rs
/// struct MyPerm;
/// impl_simple_perm!(MyPerm, Permission::Read);
///
/// struct MyOtherPerm {
///     cloud: String,
/// }
/// impl_simple_perm!(MyOtherPerm, Permission::Provision, self, Scope::Cloud(self.cloud.clone()));
/// ```
///
/// The first form checks against [`Scope::Global`]. In the second form it is required (due to
/// macro hygiene) to explicitly pass through the `self` identifier as a literal.
#[macro_export]
macro_rules! impl_simple_perm {
    ($t:ty, $perm:expr) => {
        impl $crate::auth::PrivilegedAction for $t {
            fn authorize<'source, PQE: $crate::auth::PermissionQueryExecutor>(
                self,
                perm_query_exec: &PQE,
            ) -> ::core::result::Result<
                $crate::auth::Privilege<'source, Self>,
                $crate::auth::AuthorizationError,
            > {
                perm_query_exec
                    .query($crate::auth::Scope::Global, $perm)
                    .try_into_privilege(self)
            }
        }
    };
    ($t:ty, $perm:expr , $this:ident, $scope:expr $(,)?) => {
        impl $crate::auth::PrivilegedAction for $t {
            fn authorize<'source, PQE: $crate::auth::PermissionQueryExecutor>(
                $this,
                perm_query_exec: &PQE,
            ) -> ::core::result::Result<
                $crate::auth::Privilege<'source, Self>,
                $crate::auth::AuthorizationError,
            > {
                let scope = $scope;
                perm_query_exec
                    .query(scope, $perm)
                    .try_into_privilege($this)
            }
        }
    };
}
pub use impl_simple_perm;

/// Helper macro for adding a [`From`] impl for [`AuthorizationError`] to a given type.
///
/// Syntax:
/// ```rs
/// enum MyResponseTy {
///     CustomUnauthorized,
/// }
/// impl_from_auth_err!(MyResponseTy, Unauthorized => CustomUnauthorized);
/// ```
#[macro_export]
macro_rules! impl_from_auth_err {
    ($t:ident, Unauthorized => $unauth:ident) => {
        impl ::core::convert::From<$crate::auth::AuthorizationError> for $t {
            fn from(value: $crate::auth::AuthorizationError) -> Self {
                match value {
                    $crate::auth::AuthorizationError::Unauthorized { .. } => $t::$unauth,
                }
            }
        }
    };
}
pub use impl_from_auth_err;
