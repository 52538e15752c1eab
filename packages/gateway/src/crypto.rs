//! Credential encryption, signed bearer tokens, and connect tickets.
//!
//! The cipher is deliberately a narrow utility so the handshake logic
//! never depends on the cipher choice.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use exec_gateway_error::GatewayError;
use exec_gateway_wire::EncryptedSecret;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const TICKET_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM cipher for provider secrets. Output is ciphertext,
/// IV, and detached authentication tag, each base64-encoded.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a key from an arbitrary-length secret string.
    pub fn from_secret(secret: &str) -> Self {
        use sha2::Digest;
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, GatewayError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| GatewayError::CryptoFailure {
                message: "aead seal failed".to_string(),
            })?;

        // aes-gcm appends the tag to the ciphertext; the wire format
        // carries it detached.
        let split = sealed.len() - TAG_LEN;
        Ok(EncryptedSecret {
            ciphertext: B64.encode(&sealed[..split]),
            iv: B64.encode(iv),
            tag: B64.encode(&sealed[split..]),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, GatewayError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let decode = |field: &str, name: &str| {
            B64.decode(field).map_err(|_| GatewayError::CryptoFailure {
                message: format!("invalid base64 in {name}"),
            })
        };
        let mut sealed = decode(&secret.ciphertext, "ciphertext")?;
        sealed.extend(decode(&secret.tag, "tag")?);
        let iv = decode(&secret.iv, "iv")?;

        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| GatewayError::CryptoFailure {
                message: "aead open failed".to_string(),
            })?;
        String::from_utf8(plain).map_err(|_| GatewayError::CryptoFailure {
            message: "plaintext is not utf-8".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: String,
    pub org_id: String,
    pub exp: i64,
}

/// HMAC-SHA256 signed bearer tokens: `base64url(claims).base64url(mac)`.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(
        &self,
        user_id: &str,
        org_id: &str,
        ttl: std::time::Duration,
    ) -> Result<String, GatewayError> {
        let claims = TokenClaims {
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64,
        };
        let payload = serde_json::to_vec(&claims).map_err(|err| GatewayError::CryptoFailure {
            message: format!("claims serialization failed: {err}"),
        })?;
        let encoded = B64_URL.encode(&payload);
        Ok(format!("{encoded}.{}", self.mac_for(encoded.as_bytes())?))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, GatewayError> {
        let (payload, mac) = token.split_once('.').ok_or(GatewayError::TokenInvalid {
            message: Some("malformed token".to_string()),
        })?;
        let mut verifier = <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| {
            GatewayError::CryptoFailure {
                message: "invalid signing key".to_string(),
            }
        })?;
        verifier.update(payload.as_bytes());
        let mac_bytes = B64_URL.decode(mac).map_err(|_| GatewayError::TokenInvalid {
            message: Some("malformed signature".to_string()),
        })?;
        verifier
            .verify_slice(&mac_bytes)
            .map_err(|_| GatewayError::TokenInvalid {
                message: Some("signature mismatch".to_string()),
            })?;

        let payload_bytes = B64_URL
            .decode(payload)
            .map_err(|_| GatewayError::TokenInvalid {
                message: Some("malformed claims".to_string()),
            })?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| GatewayError::TokenInvalid {
                message: Some("malformed claims".to_string()),
            })?;
        if claims.exp < OffsetDateTime::now_utc().unix_timestamp() {
            return Err(GatewayError::TokenInvalid {
                message: Some("token expired".to_string()),
            });
        }
        Ok(claims)
    }

    fn mac_for(&self, payload: &[u8]) -> Result<String, GatewayError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| {
            GatewayError::CryptoFailure {
                message: "invalid signing key".to_string(),
            }
        })?;
        mac.update(payload);
        Ok(B64_URL.encode(mac.finalize().into_bytes()))
    }
}

/// Mint a single-use connect ticket: 32 bytes of entropy, base64url.
pub fn mint_ticket() -> String {
    let mut bytes = [0u8; TICKET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    B64_URL.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = CredentialCipher::from_secret("test-key");
        let sealed = cipher.encrypt("sk-ant-secret").unwrap();
        assert_ne!(sealed.ciphertext, B64.encode("sk-ant-secret"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-ant-secret");
    }

    #[test]
    fn tampered_tag_fails_to_open() {
        let cipher = CredentialCipher::from_secret("test-key");
        let mut sealed = cipher.encrypt("sk-ant-secret").unwrap();
        sealed.tag = B64.encode([0u8; 16]);
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn token_round_trip_and_expiry() {
        let signer = TokenSigner::new(b"signing-secret".to_vec());
        let token = signer.issue("u1", "o1", Duration::from_secs(60)).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.org_id, "o1");

        let expired = signer.issue("u1", "o1", Duration::from_secs(0)).unwrap();
        // exp == now is still valid; rewind it by hand.
        let (payload, _) = expired.split_once('.').unwrap();
        let mut claims: TokenClaims =
            serde_json::from_slice(&B64_URL.decode(payload).unwrap()).unwrap();
        claims.exp -= 120;
        let stale_payload = B64_URL.encode(serde_json::to_vec(&claims).unwrap());
        let stale = format!(
            "{stale_payload}.{}",
            signer.mac_for(stale_payload.as_bytes()).unwrap()
        );
        assert!(signer.verify(&stale).is_err());
    }

    #[test]
    fn forged_signature_rejected() {
        let signer = TokenSigner::new(b"signing-secret".to_vec());
        let other = TokenSigner::new(b"other-secret".to_vec());
        let token = signer.issue("u1", "o1", Duration::from_secs(60)).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn tickets_are_unique() {
        assert_ne!(mint_ticket(), mint_ticket());
    }
}
