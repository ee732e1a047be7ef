//! Connection handshake.
//!
//! A connection is admitted only after its token verifies and the subject
//! it names resolves to a live user. Every failure looks the same to the
//! client; the cause is only logged.

use crate::connection::Identity;
use crate::directory::{DirectoryError, UserDirectory};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// The only message a rejected client ever sees.
pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("No token provided")]
    MissingToken,

    /// The token is not structurally a token.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Signature or claims did not verify.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token has expired.
    #[error("Token expired")]
    ExpiredToken,

    /// The token names a user that does not exist.
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// The user lookup itself failed.
    #[error("User lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl AuthError {
    /// Message safe to return to the client.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        AUTH_FAILED_MESSAGE
    }

    /// Short label for the failure cause.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::ExpiredToken => "expired_token",
            AuthError::UnknownUser(_) => "unknown_user",
            AuthError::Directory(_) => "directory",
        }
    }
}

/// Token claims. The subject is `sub`, or `id` for older issuers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.sub
            .as_deref()
            .or(self.id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Verifies a credential token and returns the subject it names.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// HS256 JWT verifier with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier allowing `leeway_secs` of clock skew on expiry.
    #[must_use]
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token.split('.').count() != 3 {
            return Err(AuthError::MalformedToken("expected three segments".into()));
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => AuthError::MalformedToken(e.to_string()),
                _ => AuthError::InvalidToken(e.to_string()),
            },
        )?;

        data.claims
            .subject()
            .map(str::to_string)
            .ok_or_else(|| AuthError::InvalidToken("token has no subject".into()))
    }
}

/// Resolves a presented token to an identity.
#[derive(Clone)]
pub struct Handshake {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn UserDirectory>,
}

impl Handshake {
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            verifier,
            directory,
        }
    }

    /// Verify a token and resolve its subject to a live user.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is missing, malformed, invalid or
    /// expired, or if its subject does not resolve to a user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let subject = self.verifier.verify(token).await?;

        let profile = self
            .directory
            .find_user(&subject)
            .await?
            .ok_or(AuthError::UnknownUser(subject))?;

        debug!(user = %profile.id, "Handshake: token resolved");
        Ok(Identity::new(profile.id, profile.username))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, UserProfile};
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) const SECRET: &[u8] = b"test-secret";

    pub(crate) fn token_for(subject: &str, ttl_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: Some(subject.to_string()),
            id: None,
            exp: now + ttl_secs,
            iat: Some(now),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn handshake() -> Handshake {
        let directory = MemoryDirectory::with_users([UserProfile::new("u-1", "alice")]);
        Handshake::new(
            Arc::new(JwtVerifier::new(SECRET, 0)),
            Arc::new(directory),
        )
    }

    #[tokio::test]
    async fn test_valid_token() {
        let identity = handshake()
            .authenticate(Some(&token_for("u-1", 60)))
            .await
            .unwrap();
        assert_eq!(identity, Identity::new("u-1", "alice"));
    }

    #[tokio::test]
    async fn test_legacy_id_claim() {
        let claims = serde_json::json!({"id": "u-1", "exp": chrono::Utc::now().timestamp() + 60});
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        let identity = handshake().authenticate(Some(&token)).await.unwrap();
        assert_eq!(identity.user_id, "u-1");
    }

    #[tokio::test]
    async fn test_failures() {
        let hs = handshake();

        let missing = hs.authenticate(None).await.unwrap_err();
        assert!(matches!(missing, AuthError::MissingToken));
        assert!(matches!(
            hs.authenticate(Some("   ")).await,
            Err(AuthError::MissingToken)
        ));

        assert!(matches!(
            hs.authenticate(Some("not-a-token")).await,
            Err(AuthError::MalformedToken(_))
        ));

        let foreign = encode(
            &Header::default(),
            &Claims {
                sub: Some("u-1".into()),
                id: None,
                exp: chrono::Utc::now().timestamp() + 60,
                iat: None,
            },
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert!(matches!(
            hs.authenticate(Some(&foreign)).await,
            Err(AuthError::InvalidToken(_))
        ));

        assert!(matches!(
            hs.authenticate(Some(&token_for("u-1", -120))).await,
            Err(AuthError::ExpiredToken)
        ));

        let unknown = hs
            .authenticate(Some(&token_for("u-404", 60)))
            .await
            .unwrap_err();
        assert!(matches!(unknown, AuthError::UnknownUser(_)));

        // Causes differ, the client-facing message does not.
        for err in [missing, unknown] {
            assert_eq!(err.client_message(), AUTH_FAILED_MESSAGE);
        }
    }
}
