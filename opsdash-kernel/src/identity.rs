use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::error::{OpsError, OpsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Already-resolved caller. The core never re-derives permissions from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user: impl Into<String>, role: Role) -> Self {
        Self { user: user.into(), role }
    }

    /// Rate-limit bucket key, one per (user, role) pair
    pub fn bucket_key(&self) -> String {
        format!("{}:{}", self.user, self.role)
    }

    pub fn require_role(&self, allowed: &[Role]) -> OpsResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(OpsError::Forbidden)
        }
    }
}

/// user -> role table, loaded from roles.json (`{"alice": "admin"}`)
#[derive(Debug, Clone, Default)]
pub struct RoleBook {
    roles: HashMap<String, Role>,
}

impl RoleBook {
    pub fn from_map(roles: HashMap<String, Role>) -> Self {
        Self { roles }
    }

    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Role>>(&raw) {
                Ok(roles) => Self { roles },
                Err(e) => {
                    warn!("[identity] invalid roles file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("[identity] no roles file at {:?}, everyone is viewer", path);
                Self::default()
            }
        }
    }

    /// Unknown users resolve to viewer.
    pub fn resolve(&self, user: Option<&str>) -> Identity {
        let user = user.map(str::trim).filter(|u| !u.is_empty()).unwrap_or("unknown");
        let role = self.roles.get(user).copied().unwrap_or(Role::Viewer);
        Identity::new(user, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults_to_viewer() {
        let book = RoleBook::from_map(HashMap::from([("alice".to_string(), Role::Admin)]));
        assert_eq!(book.resolve(Some("alice")).role, Role::Admin);
        assert_eq!(book.resolve(Some(" bob ")), Identity::new("bob", Role::Viewer));
        assert_eq!(book.resolve(None).user, "unknown");
    }

    #[test]
    fn test_require_role() {
        let op = Identity::new("carol", Role::Operator);
        assert!(op.require_role(&[Role::Operator, Role::Admin]).is_ok());
        assert_eq!(op.require_role(&[Role::Admin]), Err(OpsError::Forbidden));
        assert_eq!(op.bucket_key(), "carol:operator");
    }
}
