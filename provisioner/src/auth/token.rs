//! Static bearer-token authentication and ACL.

use super::{Acl, Permission, Scope, Subject};
use serde::Deserialize;
use subtle::ConstantTimeEq;

/// One permission, either everywhere or on a single cloud.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Grant {
    pub permission: Permission,
    /// Restrict the grant to this cloud. Unrestricted grants also apply to global scope.
    #[serde(default)]
    pub cloud: Option<String>,
}
impl Grant {
    fn covers(&self, scope: &Scope, permission: Permission) -> bool {
        if self.permission != permission {
            return false;
        }
        match (&self.cloud, scope) {
            (None, _) => true,
            (Some(granted), Scope::Cloud(cloud)) => granted == cloud,
            (Some(_), Scope::Global) => false,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    pub sid: String,
    pub token: String,
    #[serde(default)]
    pub grants: Vec<Grant>,
}
impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("sid", &self.sid)
            .field("token", &"<redacted>")
            .field("grants", &self.grants)
            .finish()
    }
}

/// Maps bearer tokens to subjects, and subjects to their grants.
#[derive(Debug, Clone, Default)]
pub struct TokenAcl {
    entries: Vec<TokenEntry>,
}

impl TokenAcl {
    pub fn new(entries: Vec<TokenEntry>) -> Self {
        for entry in &entries {
            if entry.token.is_empty() {
                tracing::warn!("token for {} is empty and will never match", entry.sid);
            }
        }
        Self { entries }
    }

    /// Find the subject owning `token`.
    ///
    /// Every entry is compared, so the time taken does not depend on which (if any) entry matched.
    pub fn authenticate(&self, token: &str) -> Option<Subject> {
        let mut found = None;
        for entry in &self.entries {
            let matches = !entry.token.is_empty()
                && bool::from(entry.token.as_bytes().ct_eq(token.as_bytes()));
            if matches && found.is_none() {
                found = Some(entry.sid.as_str());
            }
        }
        found.map(Subject::authenticated)
    }
}

impl Acl for TokenAcl {
    fn grants(&self, sid: &str, scope: &Scope, permission: Permission) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.sid == sid)
            .flat_map(|entry| entry.grants.iter())
            .any(|grant| grant.covers(scope, permission))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn acl() -> TokenAcl {
        TokenAcl::new(vec![
            TokenEntry {
                sid: "ci".into(),
                token: "s3cret".into(),
                grants: vec![Grant {
                    permission: Permission::Provision,
                    cloud: Some("openstack".into()),
                }],
            },
            TokenEntry {
                sid: "root".into(),
                token: "r00t".into(),
                grants: vec![Grant {
                    permission: Permission::Administer,
                    cloud: None,
                }],
            },
            TokenEntry {
                sid: "nobody".into(),
                token: String::new(),
                grants: vec![],
            },
        ])
    }

    #[test]
    fn authenticate_by_token() {
        let acl = acl();
        assert_eq!(acl.authenticate("s3cret").unwrap().0.sid(), "ci");
        assert_eq!(acl.authenticate("r00t").unwrap().0.sid(), "root");
        assert!(acl.authenticate("s3cre").is_none());
        assert!(acl.authenticate("").is_none());
    }

    #[test]
    fn cloud_grants_are_scoped() {
        let acl = acl();
        let os = Scope::Cloud("openstack".into());
        let other = Scope::Cloud("other".into());
        assert!(acl.has_permission("ci", &os, Permission::Provision));
        assert!(!acl.has_permission("ci", &other, Permission::Provision));
        assert!(!acl.has_permission("ci", &Scope::Global, Permission::Provision));
        assert!(!acl.has_permission("ci", &os, Permission::Read));
    }

    #[test]
    fn global_grants_apply_everywhere() {
        let acl = acl();
        assert!(acl.has_permission("root", &Scope::Global, Permission::Administer));
        assert!(acl.has_permission("root", &Scope::Cloud("x".into()), Permission::Provision));
        assert!(!acl.has_permission("nobody", &Scope::Global, Permission::Read));
    }

    #[test]
    fn token_is_redacted() {
        let printed = format!("{:?}", acl());
        assert!(!printed.contains("s3cret"));
    }
}
