//! Token signing and verification.
//!
//! Two token families share the cluster's symmetric `jwt_key`:
//! connection tokens (`{user, kind, exp, v}`) presented on `auth`, and
//! bookkeeping label tokens (`{gpu_ids, user, timeout}`) that managed
//! containers carry in their `corral.managed` label. Connection tokens
//! are checked with a deliberately generous leeway so long-lived
//! daemon credentials survive clock drift and slow rotation; label
//! tokens never expire.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CorralError;

/// Expiry leeway on connection tokens: five 30-day months.
pub const LEEWAY_SECS: u64 = 5 * 2_592_000;

/// Current token schema version.
pub const TOKEN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    User,
    Daemon,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::User => "user",
            TokenKind::Daemon => "daemon",
        }
    }
}

/// The verified subject of a connection token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub kind: TokenKind,
}

#[derive(Serialize)]
struct ClaimsOut<'a> {
    exp: u64,
    user: &'a str,
    kind: TokenKind,
    v: u32,
}

/// Claims are decoded loosely so that a missing `user`/`kind` can be
/// reported as an issuer problem rather than a generic parse failure.
#[derive(Deserialize)]
struct ClaimsIn {
    user: Option<String>,
    kind: Option<String>,
}

/// Sign a connection token for `user` expiring `exp_secs` from now.
pub fn issue(
    user: &str,
    kind: TokenKind,
    exp_secs: u64,
    key: &str,
) -> Result<String, CorralError> {
    let exp = now_epoch() + exp_secs;
    let claims = ClaimsOut {
        exp,
        user,
        kind,
        v: TOKEN_VERSION,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|e| CorralError::Internal(format!("token encoding failed: {e}")))
}

/// Verify a connection token against the shared key.
pub fn verify(token: &str, key: &str) -> Result<Identity, CorralError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = LEEWAY_SECS;

    let data = decode::<ClaimsIn>(
        token,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => CorralError::TokenExpired,
        _ => CorralError::InvalidToken,
    })?;

    let user = data.claims.user.ok_or(CorralError::MissingUser)?;
    let kind = match data.claims.kind.as_deref() {
        Some("user") => TokenKind::User,
        Some("daemon") => TokenKind::Daemon,
        Some(other) => return Err(CorralError::BadKind(other.to_string())),
        None => return Err(CorralError::MissingKind),
    };
    Ok(Identity { user, kind })
}

/// Bookkeeping info a managed container carries in its label.
///
/// The label is the source of truth: a daemon that restarts rebuilds
/// its entire view of the node from these tokens alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookkeepInfo {
    pub gpu_ids: Vec<u32>,
    pub user: String,
    pub timeout: u64,
}

/// Sign a bookkeeping label token. Label tokens carry no expiry.
pub fn sign_label(info: &BookkeepInfo, key: &str) -> Result<String, CorralError> {
    encode(
        &Header::default(),
        info,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|e| CorralError::Internal(format!("label encoding failed: {e}")))
}

/// Verify and decode a bookkeeping label token.
pub fn verify_label(token: &str, key: &str) -> Result<BookkeepInfo, CorralError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<BookkeepInfo>(
        token,
        &DecodingKey::from_secret(key.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| CorralError::InvalidToken)
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "test-signing-key";

    #[test]
    fn token_round_trip() {
        let token = issue("alice", TokenKind::User, 3600, KEY).unwrap();
        let identity = verify(&token, KEY).unwrap();
        assert_eq!(identity.user, "alice");
        assert_eq!(identity.kind, TokenKind::User);
    }

    #[test]
    fn daemon_tokens_carry_their_kind() {
        let token = issue("node-7", TokenKind::Daemon, 3600, KEY).unwrap();
        let identity = verify(&token, KEY).unwrap();
        assert_eq!(identity.kind, TokenKind::Daemon);
        assert_eq!(identity.user, "node-7");
    }

    #[test]
    fn wrong_key_is_invalid() {
        let token = issue("alice", TokenKind::User, 3600, KEY).unwrap();
        assert_eq!(
            verify(&token, "other-key").unwrap_err(),
            CorralError::InvalidToken
        );
    }

    #[test]
    fn expired_beyond_leeway_is_reported() {
        // Expired well past the 5-month leeway.
        let exp = now_epoch() - LEEWAY_SECS - 86_400;
        let claims = json!({"exp": exp, "user": "alice", "kind": "user", "v": 1});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(KEY.as_bytes()),
        )
        .unwrap();
        assert_eq!(verify(&token, KEY).unwrap_err(), CorralError::TokenExpired);
    }

    #[test]
    fn expired_within_leeway_still_verifies() {
        let exp = now_epoch() - 3600;
        let claims = json!({"exp": exp, "user": "alice", "kind": "user", "v": 1});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(KEY.as_bytes()),
        )
        .unwrap();
        assert!(verify(&token, KEY).is_ok());
    }

    #[test]
    fn missing_user_and_kind_name_the_issuer_problem() {
        let exp = now_epoch() + 3600;

        let claims = json!({"exp": exp, "kind": "user"});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(KEY.as_bytes()),
        )
        .unwrap();
        assert_eq!(verify(&token, KEY).unwrap_err(), CorralError::MissingUser);

        let claims = json!({"exp": exp, "user": "alice"});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(KEY.as_bytes()),
        )
        .unwrap();
        assert_eq!(verify(&token, KEY).unwrap_err(), CorralError::MissingKind);
    }

    #[test]
    fn unexpected_kind_is_rejected() {
        let exp = now_epoch() + 3600;
        let claims = json!({"exp": exp, "user": "alice", "kind": "robot"});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(KEY.as_bytes()),
        )
        .unwrap();
        assert_eq!(
            verify(&token, KEY).unwrap_err(),
            CorralError::BadKind("robot".into())
        );
    }

    #[test]
    fn label_round_trip_without_expiry() {
        let info = BookkeepInfo {
            gpu_ids: vec![2, 3],
            user: "alice".into(),
            timeout: 86_400,
        };
        let label = sign_label(&info, KEY).unwrap();
        assert_eq!(verify_label(&label, KEY).unwrap(), info);
    }

    #[test]
    fn tampered_label_is_rejected() {
        let info = BookkeepInfo {
            gpu_ids: vec![0],
            user: "alice".into(),
            timeout: 0,
        };
        let label = sign_label(&info, KEY).unwrap();
        assert!(verify_label(&label, "other-key").is_err());

        let mut forged = label.clone();
        forged.push('x');
        assert!(verify_label(&forged, KEY).is_err());
    }
}
