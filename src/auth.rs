use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::AuthConfig;

pub const SERVER_KEY_HEADER: &str = "x-server-key";
pub const VERIFIED_UID_HEADER: &str = "x-verified-uid";
pub const MAX_UID_LEN: usize = 128;
const MAX_TOKEN_LEN: usize = 8_192;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingCredentials,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Server key rejected")]
    ServerKeyRejected,
    #[error("A verified uid header is required with the server key")]
    MissingVerifiedUid,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("Failed to mint token: {0}")]
    Minting(String),
}

/// Custom claims carried by the user record and embedded into tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomClaims {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub owner: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub committee: bool,
}

impl CustomClaims {
    /// Lenient read of the stored JSON; unknown keys and wrong types drop to false.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let flag = |key: &str| value.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        Self {
            owner: flag("owner"),
            admin: flag("admin"),
            committee: flag("committee"),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "owner": self.owner,
            "admin": self.admin,
            "committee": self.committee,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub email: String,
    #[serde(flatten)]
    pub claims: CustomClaims,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn is_admin(&self) -> bool {
        self.claims.admin
    }

    pub fn is_owner(&self) -> bool {
        self.claims.owner
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::Forbidden("Administrator access required"))
        }
    }
}

/// Mints and verifies HS256 bearer and session tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    token_ttl: Duration,
    session_ttl: Duration,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        assert!(
            !config.token_secret.is_empty(),
            "Token secret must be configured"
        );
        Self {
            encoding: EncodingKey::from_secret(config.token_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.token_secret.as_bytes()),
            issuer: config.token_issuer.clone(),
            token_ttl: Duration::seconds(config.token_ttl_seconds),
            session_ttl: Duration::seconds(config.session_ttl_seconds),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn mint_token(
        &self,
        uid: &str,
        email: &str,
        claims: &CustomClaims,
    ) -> Result<String, AuthError> {
        self.mint(uid, email, claims, self.token_ttl)
    }

    pub fn mint_session(
        &self,
        uid: &str,
        email: &str,
        claims: &CustomClaims,
    ) -> Result<String, AuthError> {
        self.mint(uid, email, claims, self.session_ttl)
    }

    fn mint(
        &self,
        uid: &str,
        email: &str,
        claims: &CustomClaims,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        assert!(!uid.is_empty(), "Token subject must not be empty");
        let issued_at = Utc::now();
        let token_claims = TokenClaims {
            sub: uid.to_string(),
            email: email.to_string(),
            claims: claims.clone(),
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &token_claims, &self.encoding)
            .map_err(|err| AuthError::Minting(err.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(AuthError::InvalidToken);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        let data = decode::<TokenClaims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.sub.is_empty() || data.claims.sub.len() > MAX_UID_LEN {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims)
    }
}

/// Post-write hook for user records: the `admin` claim follows `is_admin`.
/// Returns the claims to store when they drifted, `None` when already in sync.
pub fn sync_admin_claim(current: &CustomClaims, is_admin: bool) -> Option<CustomClaims> {
    if current.admin == is_admin {
        return None;
    }
    Some(CustomClaims {
        admin: is_admin,
        ..current.clone()
    })
}

/// Who is allowed to perform a privileged claim write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedCaller {
    Admin { uid: String },
    ServerBypass { verified_uid: String },
}

impl PrivilegedCaller {
    pub fn acting_uid(&self) -> &str {
        match self {
            PrivilegedCaller::Admin { uid } => uid,
            PrivilegedCaller::ServerBypass { verified_uid } => verified_uid,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}

pub fn session_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == cookie_name && !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

pub fn server_key_matches(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Bearer token first, then the session cookie.
pub fn authenticate(
    headers: &HeaderMap,
    verifier: &TokenVerifier,
    cookie_name: &str,
) -> Result<TokenClaims, AuthError> {
    if let Some(token) = bearer_token(headers) {
        return verifier.verify(token);
    }
    if let Some(token) = session_token(headers, cookie_name) {
        return verifier.verify(token);
    }
    Err(AuthError::MissingCredentials)
}

pub fn authenticate_session(
    headers: &HeaderMap,
    verifier: &TokenVerifier,
    cookie_name: &str,
) -> Result<TokenClaims, AuthError> {
    let token = session_token(headers, cookie_name).ok_or(AuthError::MissingCredentials)?;
    verifier.verify(token)
}

/// Admin bearer token, or the server key header paired with the uid it acts for.
///
/// A request that presents the server key is judged on the key alone and never
/// falls back to its bearer token.
pub fn resolve_privileged_caller(
    headers: &HeaderMap,
    verifier: &TokenVerifier,
    server_key: Option<&str>,
) -> Result<PrivilegedCaller, AuthError> {
    if let Some(provided) = headers.get(SERVER_KEY_HEADER) {
        let provided = provided.to_str().map_err(|_| AuthError::ServerKeyRejected)?;
        let expected = server_key.ok_or(AuthError::ServerKeyRejected)?;
        if !server_key_matches(provided, expected) {
            return Err(AuthError::ServerKeyRejected);
        }
        let verified_uid = headers
            .get(VERIFIED_UID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|uid| !uid.is_empty() && uid.len() <= MAX_UID_LEN)
            .ok_or(AuthError::MissingVerifiedUid)?;
        return Ok(PrivilegedCaller::ServerBypass {
            verified_uid: verified_uid.to_string(),
        });
    }

    let token = bearer_token(headers).ok_or(AuthError::MissingCredentials)?;
    let claims = verifier.verify(token)?;
    claims.require_admin()?;
    Ok(PrivilegedCaller::Admin { uid: claims.sub })
}

pub fn session_cookie(cookie_name: &str, token: &str, max_age_seconds: i64) -> String {
    format!(
        "{cookie_name}={token}; Max-Age={max_age_seconds}; Path=/; HttpOnly; Secure; SameSite=Strict"
    )
}

pub fn expired_session_cookie(cookie_name: &str) -> String {
    format!("{cookie_name}=; Max-Age=0; Path=/; HttpOnly; Secure; SameSite=Strict")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::HeaderValue;

    pub(crate) fn test_auth_config() -> AuthConfig {
        AuthConfig {
            token_secret: "0123456789abcdef0123456789abcdef".to_string(),
            token_issuer: "portal-test".to_string(),
            token_ttl_seconds: 3_600,
            session_ttl_seconds: 86_400,
            session_cookie_name: "__session".to_string(),
        }
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(&test_auth_config())
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn minted_token_verifies_with_claims() {
        let verifier = verifier();
        let claims = CustomClaims {
            owner: true,
            ..CustomClaims::default()
        };
        let token = verifier
            .mint_token("uid-1", "a@james-square.com", &claims)
            .expect("mint");
        let decoded = verifier.verify(&token).expect("verify");
        assert_eq!(decoded.sub, "uid-1");
        assert!(decoded.is_owner());
        assert!(!decoded.is_admin());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let mut other = test_auth_config();
        other.token_secret = "ffffffffffffffffffffffffffffffff".to_string();
        let token = TokenVerifier::new(&other)
            .mint_token("uid-1", "a@james-square.com", &CustomClaims::default())
            .unwrap();
        assert_eq!(verifier().verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; __session=tok123; lang=en"),
        );
        assert_eq!(session_token(&headers, "__session"), Some("tok123"));
        assert_eq!(session_token(&headers, "missing"), None);
    }

    #[test]
    fn server_key_comparison() {
        assert!(server_key_matches("s3cret-value", "s3cret-value"));
        assert!(!server_key_matches("s3cret-valuX", "s3cret-value"));
        assert!(!server_key_matches("s3cret", "s3cret-value"));
        assert!(!server_key_matches("", ""));
    }

    #[test]
    fn server_bypass_requires_verified_uid() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER_KEY_HEADER, HeaderValue::from_static("shared-key"));
        let result = resolve_privileged_caller(&headers, &verifier(), Some("shared-key"));
        assert_eq!(result, Err(AuthError::MissingVerifiedUid));

        headers.insert(VERIFIED_UID_HEADER, HeaderValue::from_static("uid-7"));
        let result = resolve_privileged_caller(&headers, &verifier(), Some("shared-key"));
        assert_eq!(
            result,
            Ok(PrivilegedCaller::ServerBypass {
                verified_uid: "uid-7".to_string()
            })
        );
    }

    #[test]
    fn server_bypass_disabled_without_configured_key() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER_KEY_HEADER, HeaderValue::from_static("shared-key"));
        headers.insert(VERIFIED_UID_HEADER, HeaderValue::from_static("uid-7"));
        let result = resolve_privileged_caller(&headers, &verifier(), None);
        assert_eq!(result, Err(AuthError::ServerKeyRejected));
    }

    #[test]
    fn wrong_server_key_does_not_fall_back_to_bearer() {
        let verifier = verifier();
        let admin = CustomClaims {
            admin: true,
            ..CustomClaims::default()
        };
        let token = verifier.mint_token("admin-1", "admin@james-square.com", &admin).unwrap();
        let mut headers = bearer(&token);
        headers.insert(SERVER_KEY_HEADER, HeaderValue::from_static("wrong"));
        let result = resolve_privileged_caller(&headers, &verifier, Some("shared-key"));
        assert_eq!(result, Err(AuthError::ServerKeyRejected));
    }

    #[test]
    fn non_admin_bearer_is_forbidden() {
        let verifier = verifier();
        let owner = CustomClaims {
            owner: true,
            ..CustomClaims::default()
        };
        let token = verifier.mint_token("uid-2", "o@james-square.com", &owner).unwrap();
        let result = resolve_privileged_caller(&bearer(&token), &verifier, Some("shared-key"));
        assert!(matches!(result, Err(AuthError::Forbidden(_))));
    }

    #[test]
    fn admin_bearer_is_accepted() {
        let verifier = verifier();
        let admin = CustomClaims {
            admin: true,
            ..CustomClaims::default()
        };
        let token = verifier.mint_token("admin-1", "admin@james-square.com", &admin).unwrap();
        let caller = resolve_privileged_caller(&bearer(&token), &verifier, None).unwrap();
        assert_eq!(caller.acting_uid(), "admin-1");
    }

    #[test]
    fn admin_claim_follows_flag() {
        let owner = CustomClaims {
            owner: true,
            ..CustomClaims::default()
        };
        let synced = sync_admin_claim(&owner, true).expect("drifted");
        assert!(synced.admin);
        assert!(synced.owner);
        assert_eq!(sync_admin_claim(&synced, true), None);
        assert_eq!(sync_admin_claim(&synced, false), Some(owner));
    }

    #[test]
    fn custom_claims_read_leniently() {
        let stored = serde_json::json!({"owner": true, "admin": "yes", "extra": 1});
        let claims = CustomClaims::from_json(&stored);
        assert!(claims.owner);
        assert!(!claims.admin);
        assert_eq!(CustomClaims::from_json(&claims.to_json()), claims);
    }
}
