//! Signed gateway session tokens.
//!
//! A gateway session is an HMAC-SHA256 signed token minted on client
//! `initialize` and validated on every subsequent use. The design is
//! stateless: expiry does the bookkeeping, so `terminate` has nothing to
//! revoke and exists for API symmetry.

use crate::error::{Error, Result};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind, get_current_timestamp,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Claims carried by a gateway session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Issued-at (seconds since epoch).
    pub iat: u64,
    /// Not-before (seconds since epoch).
    pub nbf: u64,
    /// Expiry (seconds since epoch).
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
}

/// Mints and validates gateway session tokens.
pub struct SessionSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl SessionSigner {
    /// Create a signer from the shared secret.
    ///
    /// `audience` is the public hostname clients reach the gateway under;
    /// tokens minted for one deployment do not validate on another.
    pub fn new(secret: &[u8], issuer: &str, audience: &str, ttl: Duration) -> Self {
        // HMAC-SHA256 only: `none` and public-key algorithms presented by
        // a client are rejected by the algorithm check in validation.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            ttl,
        }
    }

    /// Mint a fresh gateway session token.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn generate(&self) -> Result<String> {
        let now = get_current_timestamp();
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            nbf: now,
            exp: now + self.ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::SessionInvalid(format!("failed to sign session token: {e}")))
    }

    /// Validate a token: signature, algorithm, and time bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionInvalid`] describing what failed.
    pub fn validate(&self, token: &str) -> Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "session expired".to_string(),
                    ErrorKind::ImmatureSignature => "session not yet valid".to_string(),
                    ErrorKind::InvalidSignature => "bad signature".to_string(),
                    ErrorKind::InvalidAlgorithm => "unacceptable signing algorithm".to_string(),
                    other => format!("{other:?}"),
                };
                Error::SessionInvalid(reason)
            })
    }

    /// Terminate a session. Stateless tokens expire on their own; this is
    /// a no-op kept for API symmetry with stateful session stores.
    pub fn terminate(&self, _token: &str) {}
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn signer() -> SessionSigner {
        SessionSigner::new(b"test-secret", "conduit", "mcp.example.com", Duration::from_secs(60))
    }

    #[test]
    fn test_generate_validate_roundtrip() {
        let signer = signer();
        let token = signer.generate().unwrap();
        let claims = signer.validate(&token).unwrap();

        assert_eq!(claims.iss, "conduit");
        assert_eq!(claims.aud, "mcp.example.com");
        assert!(claims.exp > claims.iat);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_tokens_are_unique() {
        let signer = signer();
        let a = signer.generate().unwrap();
        let b = signer.generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let minted = signer().generate().unwrap();
        let other =
            SessionSigner::new(b"other-secret", "conduit", "mcp.example.com", Duration::from_secs(60));
        let err = other.validate(&minted).unwrap_err();
        assert!(err.to_string().contains("bad signature"));
    }

    #[test]
    fn test_rejects_wrong_audience() {
        let minted = signer().generate().unwrap();
        let other =
            SessionSigner::new(b"test-secret", "conduit", "elsewhere.example.com", Duration::from_secs(60));
        assert!(other.validate(&minted).is_err());
    }

    #[test]
    fn test_rejects_expired_token() {
        let expired =
            SessionSigner::new(b"test-secret", "conduit", "mcp.example.com", Duration::from_secs(0));
        let token = expired.generate().unwrap();
        // exp == now; leeway is the default 60s, so shrink it to zero to
        // observe the expiry instead of sleeping through the leeway.
        let mut strict = signer();
        strict.validation.leeway = 0;
        std::thread::sleep(Duration::from_millis(1100));
        let err = strict.validate(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_rejects_unsigned_token() {
        let signer = signer();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let now = get_current_timestamp();
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&SessionClaims {
                iss: "conduit".to_string(),
                aud: "mcp.example.com".to_string(),
                iat: now,
                nbf: now,
                exp: now + 60,
                jti: "forged".to_string(),
            })
            .unwrap(),
        );
        let forged = format!("{header}.{payload}.");
        assert!(signer.validate(&forged).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(signer().validate("definitely-not-a-token").is_err());
        assert!(signer().validate("").is_err());
    }

    #[test]
    fn test_terminate_is_noop() {
        let signer = signer();
        let token = signer.generate().unwrap();
        signer.terminate(&token);
        // Stateless: the token remains valid until expiry.
        assert!(signer.validate(&token).is_ok());
    }
}
