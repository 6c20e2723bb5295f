use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use jwt::{SignWithKey, VerifyWithKey};
use sha2::Sha256;

use crate::auth::models::{
    role_permissions, Principal, TokenClaims, TokenPair, TokenType, User,
};
use crate::error::AuthError;

/// HMAC-SHA256 token issuer and verifier.
///
/// Stateless apart from the process-wide signing secret. Access and refresh
/// tokens share the secret; refresh tokens carry a `type=refresh` claim and
/// are rejected for admission.
pub struct TokenVerifier {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    fn signing_key(&self) -> Result<Hmac<Sha256>, AuthError> {
        Hmac::new_from_slice(self.secret.as_bytes())
            .map_err(|_| AuthError::ServiceUnavailable("failed to create signing key".to_string()))
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let key = self.signing_key()?;
        claims
            .sign_with_key(&key)
            .map_err(|_| AuthError::ServiceUnavailable("failed to sign token".to_string()))
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let key = self.signing_key()?;
        let claims: TokenClaims = token
            .verify_with_key(&key)
            .map_err(|_| AuthError::InvalidOrExpired)?;

        if claims.exp <= now_secs() {
            return Err(AuthError::InvalidOrExpired);
        }
        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        if claims.username.is_empty() {
            return Err(AuthError::MissingClaim("username"));
        }

        Ok(claims)
    }

    fn claims_for(&self, user: &User, token_type: TokenType, ttl: Duration) -> TokenClaims {
        let iat = now_secs();
        TokenClaims {
            sub: user.id.clone(),
            username: user.username.clone(),
            email: Some(user.email.clone()),
            roles: user.roles.clone(),
            permissions: user.permissions.clone(),
            token_type,
            iat,
            exp: iat + ttl.as_secs(),
        }
    }

    /// Issue an access/refresh token pair for a user
    pub fn issue_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        let access = self.sign(&self.claims_for(user, TokenType::Access, self.access_ttl))?;
        let refresh = self.sign(&self.claims_for(user, TokenType::Refresh, self.refresh_ttl))?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
        })
    }

    /// Verify an access token and produce the authenticated principal.
    ///
    /// All verification failures collapse to `InvalidOrExpired`; the caller
    /// cannot distinguish a bad signature from an expired token.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.decode(token)?;

        if claims.token_type != TokenType::Access {
            return Err(AuthError::InvalidOrExpired);
        }

        Ok(principal_from_claims(&claims))
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// When `expected_subject` is given, a mismatch with the refresh token's
    /// subject is an error.
    pub fn refresh(
        &self,
        refresh_token: &str,
        expected_subject: Option<&str>,
    ) -> Result<String, AuthError> {
        let claims = self.decode(refresh_token)?;

        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::NotRefreshToken);
        }
        if let Some(subject) = expected_subject {
            if subject != claims.sub {
                return Err(AuthError::SubjectMismatch);
            }
        }

        let iat = now_secs();
        let access = TokenClaims {
            token_type: TokenType::Access,
            iat,
            exp: iat + self.access_ttl.as_secs(),
            ..claims
        };
        self.sign(&access)
    }

    /// Extract the bearer portion of an `Authorization` header value.
    /// The `Bearer` scheme is matched case-sensitively.
    pub fn bearer_token(header: &str) -> Option<&str> {
        header.strip_prefix("Bearer ")
    }
}

/// Build a principal with effective permissions: the union of role-derived
/// permissions and directly granted ones, deduplicated.
pub fn principal_from_claims(claims: &TokenClaims) -> Principal {
    let mut permissions: HashSet<_> = claims.permissions.iter().copied().collect();
    for role in &claims.roles {
        permissions.extend(role_permissions(*role).iter().copied());
    }

    Principal {
        id: claims.sub.clone(),
        username: claims.username.clone(),
        email: claims.email.clone(),
        roles: claims.roles.clone(),
        permissions,
    }
}
