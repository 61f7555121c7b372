//! Peer authentication
//!
//! Two roles share one interface. A client presents a tuple
//! (signature, identity, timestamp, access_token): the access token is
//! an ES256 JWT issued by the identity service binding the user id to
//! an ephemeral P-256 key, and the signature is that ephemeral key
//! signing the canonical connect string. A communication server
//! presents a pre-shared secret. The authenticator is a small tagged
//! variant rather than a plugin surface: `Noop` for tests,
//! `SharedSecret` for server-to-server trust, `ThirdParty` for the
//! identity-service chain.
//!
//! The trusted public key is fetched from the identity service once at
//! startup (`GET {identity_url}/api/v1/public_key`, a PEM document)
//! and cached for the process lifetime.

use crate::error::CommResult;
use crate::proto::{AuthData, AuthMessage, MessageType, Role};
use base64::{engine::general_purpose, Engine as _};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Verified peer identity. For clients this is the user id extracted
/// from the access token; for communication servers it is empty.
pub type Identity = Vec<u8>;

/// Authentication failure kinds
///
/// Every kind except `Internal` is a clean rejection: the peer is
/// closed and the caller must not retry. `Internal` is logged and may
/// be retried.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("request expired")]
    ExpiredRequest,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid access token: {0}")]
    InvalidAccessToken(String),

    #[error("internal auth error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Only internal faults are worth retrying; the rest are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Internal(_))
    }

    /// Label used by the `auth_failures_total` counter
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "missing",
            AuthError::InvalidCredential(_) => "invalid_credential",
            AuthError::ExpiredRequest => "expired",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::InvalidAccessToken(_) => "invalid_access_token",
            AuthError::Internal(_) => "internal",
        }
    }
}

/// Claims inside an identity-service access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub user_id: String,
    pub ephemeral_key: String,
    #[serde(default)]
    pub version: String,
    pub exp: u64,
}

/// Peer authenticator
pub enum Authenticator {
    /// Accepts everything; test harnesses only
    Noop,
    /// Server-to-server shared secret
    SharedSecret { secret: String },
    /// Identity-service token chain for clients, plus the shared
    /// secret for server peers dialing in
    ThirdParty {
        trusted_key_pem: String,
        secret: String,
        request_ttl: i64,
    },
}

impl Authenticator {
    /// Build a third-party authenticator, fetching the identity
    /// service public key once and caching it.
    pub async fn third_party(
        identity_url: &str,
        secret: String,
        request_ttl: i64,
    ) -> CommResult<Self> {
        let trusted_key_pem = fetch_trusted_key(identity_url).await?;
        // Fail at startup rather than on the first client connect.
        VerifyingKey::from_public_key_pem(&trusted_key_pem)
            .map_err(|e| AuthError::Internal(format!("identity key unusable: {}", e)))?;
        Ok(Authenticator::ThirdParty {
            trusted_key_pem,
            secret,
            request_ttl,
        })
    }

    /// Validate an AUTH envelope body received on a freshly opened
    /// data channel. Returns the verified identity.
    pub fn authenticate_from_message(
        &self,
        role: Role,
        body: &[u8],
    ) -> Result<Identity, AuthError> {
        match self {
            Authenticator::Noop => Ok(Vec::new()),
            Authenticator::SharedSecret { secret } => {
                check_secret(role, secret, std::str::from_utf8(body).unwrap_or(""))
            }
            Authenticator::ThirdParty {
                trusted_key_pem,
                secret,
                request_ttl,
            } => match role {
                Role::CommunicationServer => {
                    check_secret(role, secret, std::str::from_utf8(body).unwrap_or(""))
                }
                Role::Client => {
                    let data = AuthData::decode(body)
                        .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;
                    // Message-form auth signs the empty canonical string;
                    // possession of the ephemeral key is what is proven.
                    validate_client(trusted_key_pem, *request_ttl, &data, "")
                }
                Role::UnknownRole => Err(AuthError::MissingCredentials),
            },
        }
    }

    /// Validate the query parameters of a coordinator upgrade request.
    /// `method` and `url` form the canonical string the client signed.
    pub fn authenticate_from_url(
        &self,
        role: Role,
        method: &str,
        url: &str,
        query: &HashMap<String, String>,
    ) -> Result<(), AuthError> {
        match self {
            Authenticator::Noop => Ok(()),
            Authenticator::SharedSecret { secret } => {
                let presented = query.get("secret").ok_or(AuthError::MissingCredentials)?;
                check_secret(role, secret, presented).map(|_| ())
            }
            Authenticator::ThirdParty {
                trusted_key_pem,
                secret,
                request_ttl,
            } => match role {
                Role::CommunicationServer => {
                    let presented = query.get("secret").ok_or(AuthError::MissingCredentials)?;
                    check_secret(role, secret, presented).map(|_| ())
                }
                Role::Client => {
                    let data = AuthData {
                        signature: query.get("signature").cloned().unwrap_or_default(),
                        identity: query.get("identity").cloned().unwrap_or_default(),
                        timestamp: query.get("timestamp").cloned().unwrap_or_default(),
                        access_token: query.get("access-token").cloned().unwrap_or_default(),
                    };
                    let canonical = format!("{}:{}", method, url);
                    validate_client(trusted_key_pem, *request_ttl, &data, &canonical).map(|_| ())
                }
                Role::UnknownRole => Err(AuthError::MissingCredentials),
            },
        }
    }

    /// AUTH envelope a communication server presents over a freshly
    /// opened data channel.
    pub fn server_auth_message(&self) -> Option<AuthMessage> {
        let secret = match self {
            Authenticator::SharedSecret { secret } => secret,
            Authenticator::ThirdParty { secret, .. } => secret,
            Authenticator::Noop => return None,
        };
        Some(AuthMessage {
            r#type: MessageType::Auth as i32,
            role: Role::CommunicationServer as i32,
            body: secret.clone().into_bytes(),
        })
    }

    /// Connect URL a communication server uses to dial the coordinator
    pub fn server_connect_url(&self, coordinator_url: &str) -> String {
        match self {
            Authenticator::SharedSecret { secret }
            | Authenticator::ThirdParty { secret, .. } => {
                format!("{}?secret={}", coordinator_url, urlencoding::encode(secret))
            }
            Authenticator::Noop => coordinator_url.to_string(),
        }
    }
}

/// Full client validation chain: token signature, key binding,
/// connect-string signature, timestamp window.
fn validate_client(
    trusted_key_pem: &str,
    request_ttl: i64,
    data: &AuthData,
    canonical: &str,
) -> Result<Identity, AuthError> {
    if data.access_token.is_empty() || data.identity.is_empty() || data.timestamp.is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    let timestamp: i64 = data
        .timestamp
        .parse()
        .map_err(|_| AuthError::InvalidCredential("timestamp not a number".to_string()))?;
    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > request_ttl {
        return Err(AuthError::ExpiredRequest);
    }

    let decoding_key = jsonwebtoken::DecodingKey::from_ec_pem(trusted_key_pem.as_bytes())
        .map_err(|e| AuthError::Internal(format!("trusted key: {}", e)))?;
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
    validation.validate_exp = true;
    let token =
        jsonwebtoken::decode::<AccessTokenClaims>(&data.access_token, &decoding_key, &validation)
            .map_err(|e| AuthError::InvalidAccessToken(e.to_string()))?;
    let claims = token.claims;

    // The identity the peer asserts must be the one the token binds.
    if data.identity != claims.user_id {
        return Err(AuthError::InvalidCredential(
            "identity does not match access token".to_string(),
        ));
    }

    let ephemeral_key = decode_verifying_key(&claims.ephemeral_key)
        .map_err(|_| AuthError::InvalidAccessToken("bad ephemeral key".to_string()))?;
    let signature = decode_signature(&data.signature)?;
    ephemeral_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| AuthError::InvalidSignature)?;

    Ok(claims.user_id.into_bytes())
}

fn check_secret(role: Role, expected: &str, presented: &str) -> Result<Identity, AuthError> {
    if role != Role::CommunicationServer {
        return Err(AuthError::InvalidCredential(format!(
            "shared secret auth is for server peers, got {:?}",
            role
        )));
    }
    if presented.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
        return Err(AuthError::InvalidCredential("secret mismatch".to_string()));
    }
    Ok(Vec::new())
}

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

/// Accepts a PEM public key (the identity service form) or hex SEC1
/// bytes (the compact form used by bots and tests).
pub fn decode_verifying_key(encoded: &str) -> CommResult<VerifyingKey> {
    if encoded.contains("BEGIN") {
        return VerifyingKey::from_public_key_pem(encoded)
            .map_err(|e| AuthError::InvalidCredential(format!("public key pem: {}", e)).into());
    }
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| AuthError::InvalidCredential(format!("public key hex: {}", e)))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| AuthError::InvalidCredential(format!("public key bytes: {}", e)).into())
}

fn decode_signature(encoded: &str) -> Result<Signature, AuthError> {
    if encoded.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    // Signatures travel hex-encoded; tolerate base64 from older bots.
    let bytes = match hex::decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => general_purpose::STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|_| AuthError::InvalidSignature)?,
    };
    if bytes.len() != 64 {
        return Err(AuthError::InvalidSignature);
    }
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&bytes);
    Signature::from_bytes(&raw.into()).map_err(|_| AuthError::InvalidSignature)
}

/// Fetch the identity service's PEM public key
pub async fn fetch_trusted_key(identity_url: &str) -> CommResult<String> {
    let url = format!("{}/api/v1/public_key", identity_url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .map_err(|e| AuthError::Internal(format!("cannot reach identity service: {}", e)))?;
    if !response.status().is_success() {
        return Err(AuthError::Internal(format!(
            "identity service returned {}",
            response.status()
        ))
        .into());
    }
    let pem = response
        .text()
        .await
        .map_err(|e| AuthError::Internal(format!("identity key body: {}", e)))?;
    Ok(pem)
}

/// PEM encode a P-256 public key
pub fn pem_encode_public_key(key: &VerifyingKey) -> CommResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| AuthError::Internal(format!("pem encode: {}", e)).into())
}

/// PEM decode a P-256 public key
pub fn pem_decode_public_key(pem: &str) -> CommResult<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem)
        .map_err(|e| AuthError::InvalidCredential(format!("pem decode: {}", e)).into())
}

/// PEM encode a P-256 private key (PKCS#8)
pub fn pem_encode_private_key(key: &SigningKey) -> CommResult<String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AuthError::Internal(format!("pem encode: {}", e)))?;
    Ok(pem.to_string())
}

/// PEM decode a P-256 private key (PKCS#8)
pub fn pem_decode_private_key(pem: &str) -> CommResult<SigningKey> {
    SigningKey::from_pkcs8_pem(pem)
        .map_err(|e| AuthError::InvalidCredential(format!("pem decode: {}", e)).into())
}
