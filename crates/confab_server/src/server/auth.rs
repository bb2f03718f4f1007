#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use confab_domain::{Identity, SubjectId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::secret::SecretString;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token: {0}")]
	InvalidToken(String),

	#[error("token expired")]
	Expired,
}

/// Claims carried inside a stateless access token. `sub` is the stable
/// subject id; `name` and `avatar` are optional display claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar: Option<String>,
}

/// Validates an opaque token and resolves the identity bound to it.
/// Every connection handshake and every history request goes through an
/// implementation of this trait.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
	async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier for `v1.<payload_b64>.<sig_b64>` HMAC-SHA256 tokens.
pub struct HmacTokenVerifier {
	secret: SecretString,
}

impl HmacTokenVerifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait::async_trait]
impl TokenVerifier for HmacTokenVerifier {
	async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
		let claims = verify_hmac_token(token, self.secret.expose())?;
		identity_from_claims(claims)
	}
}

pub fn identity_from_claims(claims: AuthClaims) -> Result<Identity, AuthError> {
	let subject_id = SubjectId::new(claims.sub).map_err(|e| AuthError::InvalidToken(format!("bad subject: {e}")))?;
	Ok(Identity {
		subject_id,
		display_name: claims.name.filter(|s| !s.trim().is_empty()),
		avatar_ref: claims.avatar.filter(|s| !s.trim().is_empty()),
	})
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::InvalidToken("unexpected token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthError::InvalidToken(format!("decode payload: {e}")))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthError::InvalidToken(format!("decode signature: {e}")))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::InvalidToken("signature mismatch".to_string()));
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::InvalidToken(format!("parse claims: {e}")))?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token for the given claims. Used by provisioning tooling and
/// tests; the server itself only verifies.
pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> String {
	let payload = serde_json::to_vec(claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
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
