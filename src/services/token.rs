//! Upload tokens: an opaque credential binding a session to its metadata.
//!
//! Shape: `base64url(json claims) + "." + hex(hmac_sha256(secret, payload))`.
//! Clients treat the whole string as opaque; the server only ever extracts
//! the `uploadId` after checking the signature and the 24-hour expiry.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use super::{ServiceError, ServiceResult};

type HmacSha256 = Hmac<Sha256>;

/// Tokens are refused this long after issue.
const TOKEN_TTL_HOURS: i64 = 24;

/// What a token carries.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub upload_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
}

/// Issues and validates upload tokens with a process-wide secret.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { key: secret.into() }
    }

    /// Signer with a random 32-byte secret; tokens die with the process.
    pub fn random() -> Self {
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn issue(&self, claims: &TokenClaims) -> ServiceResult<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        Ok(format!("{}.{}", payload, self.sign(&payload)))
    }

    /// Check signature and expiry, returning the embedded claims.
    pub fn decode(&self, token: &str) -> ServiceResult<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ServiceError::Unauthorized("malformed upload token".into()))?;

        let expected = self.sign(payload);
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return Err(ServiceError::Unauthorized("invalid token signature".into()));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ServiceError::Unauthorized("malformed token payload".into()))?;
        let claims: TokenClaims = serde_json::from_slice(&raw)
            .map_err(|_| ServiceError::Unauthorized("malformed token payload".into()))?;

        if Utc::now() - claims.created_at > Duration::hours(TOKEN_TTL_HOURS) {
            return Err(ServiceError::Unauthorized("upload token expired".into()));
        }

        Ok(claims)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> TokenClaims {
        TokenClaims {
            upload_id: Uuid::new_v4(),
            file_name: "video.mp4".into(),
            file_size: 123_456,
            file_type: "video/mp4".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn issue_then_decode_roundtrips() {
        let signer = TokenSigner::random();
        let original = claims();
        let token = signer.issue(&original).unwrap();

        let decoded = signer.decode(&token).unwrap();
        assert_eq!(decoded.upload_id, original.upload_id);
        assert_eq!(decoded.file_name, original.file_name);
        assert_eq!(decoded.file_size, original.file_size);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = TokenSigner::random();
        let token = signer.issue(&claims()).unwrap();

        let (payload, sig) = token.split_once('.').unwrap();
        let mut forged_claims = claims();
        forged_claims.file_size = 1;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_ne!(payload, forged_payload);

        let forged = format!("{}.{}", forged_payload, sig);
        assert!(matches!(
            signer.decode(&forged),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let token = TokenSigner::random().issue(&claims()).unwrap();
        assert!(TokenSigner::random().decode(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::new(b"secret".to_vec());
        let mut old = claims();
        old.created_at = Utc::now() - Duration::hours(25);
        let token = signer.issue(&old).unwrap();
        assert!(matches!(
            signer.decode(&token),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let signer = TokenSigner::random();
        assert!(signer.decode("no-dot-here").is_err());
        assert!(signer.decode("payload.badsig").is_err());
    }
}
