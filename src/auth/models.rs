use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Closed set of roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    User,
    Guest,
}

/// Closed set of permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "create:user")]
    CreateUser,
    #[serde(rename = "read:user")]
    ReadUser,
    #[serde(rename = "update:user")]
    UpdateUser,
    #[serde(rename = "delete:user")]
    DeleteUser,
    #[serde(rename = "configure:routes")]
    ConfigureRoutes,
    #[serde(rename = "view:metrics")]
    ViewMetrics,
    #[serde(rename = "manage:rate_limits")]
    ManageRateLimits,
    #[serde(rename = "view:logs")]
    ViewLogs,
    #[serde(rename = "manage:system")]
    ManageSystem,
    #[serde(rename = "access:admin")]
    AccessAdmin,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::CreateUser,
        Permission::ReadUser,
        Permission::UpdateUser,
        Permission::DeleteUser,
        Permission::ConfigureRoutes,
        Permission::ViewMetrics,
        Permission::ManageRateLimits,
        Permission::ViewLogs,
        Permission::ManageSystem,
        Permission::AccessAdmin,
    ];
}

/// Static role → permission assignment
pub fn role_permissions(role: Role) -> &'static [Permission] {
    match role {
        Role::Admin => &Permission::ALL,
        Role::Moderator => &[
            Permission::ReadUser,
            Permission::UpdateUser,
            Permission::ViewMetrics,
            Permission::ViewLogs,
        ],
        Role::User => &[Permission::ReadUser],
        Role::Guest => &[],
    }
}

/// Authenticated identity attached to a request
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<Role>,
    pub permissions: HashSet<Permission>,
}

impl Principal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Token kind claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims carried in gateway-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id)
    pub sub: String,

    pub username: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub roles: Vec<Role>,

    /// Permissions granted directly, beyond the role-derived set
    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(rename = "type")]
    pub token_type: TokenType,

    /// Issued at (Unix seconds)
    pub iat: u64,

    /// Expiration (Unix seconds)
    pub exp: u64,
}

/// Access/refresh token pair returned by the auth endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// A stored user account (mock in-memory storage)
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub roles: Vec<Role>,

    /// Permissions granted directly to the user
    pub permissions: Vec<Permission>,
}

/// User shape exposed over the API (no credentials)
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<Role>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
        }
    }
}
