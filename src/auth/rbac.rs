use std::collections::HashSet;

use crate::auth::models::{role_permissions, Permission, Principal, Role};
use crate::error::AuthError;

/// How a set of required permissions combines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLogic {
    /// At least one required permission must be held
    Any,
    /// Every required permission must be held
    All,
}

impl Default for PermissionLogic {
    fn default() -> Self {
        Self::Any
    }
}

/// Effective permissions of a principal: role-derived plus directly
/// granted, deduplicated.
pub fn effective_permissions(principal: &Principal) -> HashSet<Permission> {
    let mut permissions = principal.permissions.clone();
    for role in &principal.roles {
        permissions.extend(role_permissions(*role).iter().copied());
    }
    permissions
}

/// Check role and permission predicates against a principal.
///
/// Roles use ANY semantics. When both sets are given, both predicates must
/// pass. The error names the predicate that failed.
pub fn authorize(
    principal: &Principal,
    required_roles: &[Role],
    required_permissions: &[Permission],
    logic: PermissionLogic,
) -> Result<(), AuthError> {
    if !required_roles.is_empty() {
        let role_ok = required_roles.iter().any(|r| principal.has_role(*r));
        if !role_ok {
            return Err(AuthError::InsufficientPermissions(format!(
                "requires role {}",
                describe_roles(required_roles)
            )));
        }
    }

    if !required_permissions.is_empty() {
        let held = effective_permissions(principal);
        let perms_ok = match logic {
            PermissionLogic::Any => required_permissions.iter().any(|p| held.contains(p)),
            PermissionLogic::All => required_permissions.iter().all(|p| held.contains(p)),
        };
        if !perms_ok {
            return Err(AuthError::InsufficientPermissions(
                "missing required permission".to_string(),
            ));
        }
    }

    Ok(())
}

fn describe_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|r| format!("{:?}", r).to_lowercase())
        .collect::<Vec<_>>()
        .join(" or ")
}
