use std::collections::HashMap;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::models::{Permission, Role, User};
use crate::config::Argon2Config;
use crate::error::AuthError;

/// In-memory user storage.
///
/// Accounts live only for the process lifetime; passwords are stored as
/// Argon2id hashes and verified in constant time.
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
    hasher_config: Argon2Config,
}

impl UserStore {
    pub fn new(hasher_config: Argon2Config) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            hasher_config,
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, AuthError> {
        let params = Params::new(
            self.hasher_config.memory_cost_kib,
            self.hasher_config.time_cost,
            self.hasher_config.parallelism,
            None,
        )
        .map_err(|e| AuthError::ServiceUnavailable(format!("invalid argon2 params: {}", e)))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::ServiceUnavailable(format!("password hashing failed: {}", e)))
    }

    /// Seed the default admin account. Called once at startup.
    pub async fn seed_admin(&self, password: &str) -> Result<(), AuthError> {
        let hash = self.hash_password(password)?;
        let admin = User {
            id: Uuid::new_v4().to_string(),
            username: "admin".to_string(),
            email: "admin@localhost".to_string(),
            password_hash: hash,
            roles: vec![Role::Admin],
            permissions: Vec::new(),
        };

        let mut users = self.users.write().await;
        users.insert(admin.username.clone(), admin);
        Ok(())
    }

    /// Register a new account with role `user`.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let hash = self.hash_password(password)?;

        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash,
            roles: vec![Role::User],
            permissions: Vec::new(),
        };
        users.insert(username.to_string(), user.clone());

        tracing::info!(username, "user registered");
        Ok(user)
    }

    /// Verify credentials. Wrong username and wrong password are
    /// indistinguishable to the caller.
    pub async fn verify_login(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let user = {
            let users = self.users.read().await;
            users.get(username).cloned()
        };

        let user = user.ok_or(AuthError::InvalidCredentials)?;

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|_| AuthError::InvalidCredentials)?;
        self.hasher()?
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::InvalidCredentials)?;

        Ok(user)
    }

    pub async fn get(&self, username: &str) -> Option<User> {
        let users = self.users.read().await;
        users.get(username).cloned()
    }

    /// Grant a permission directly to a user
    pub async fn grant_permission(
        &self,
        username: &str,
        permission: Permission,
    ) -> Result<(), AuthError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or(AuthError::InvalidCredentials)?;
        if !user.permissions.contains(&permission) {
            user.permissions.push(permission);
        }
        Ok(())
    }
}
