use axum::http::StatusCode;
use axum::response::IntoResponse;
use hmac::{Hmac, Mac};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
const SUBJECT: &str = "admin";

#[derive(Debug)]
pub enum AuthError {
    WrongPassword,
    InvalidToken,
    Encoding,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match self {
            Self::WrongPassword => (StatusCode::UNAUTHORIZED, "wrong password"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid token"),
            Self::Encoding => (StatusCode::INTERNAL_SERVER_ERROR, "token encoding failed"),
        };
        (status, msg).into_response()
    }
}

/// Constant-time string comparison: both sides are MAC'd under a fixed key and
/// the tags compared with `verify_slice`.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let tag = |s: &str| {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret-compare")
            .expect("HMAC accepts any key length");
        mac.update(s.as_bytes());
        mac
    };
    let expected_tag = tag(expected).finalize().into_bytes();
    tag(provided).verify_slice(&expected_tag).is_ok()
}

/// Checks the admin password. An empty configured password never matches.
pub fn verify_password(provided: &str, expected: &str) -> Result<(), AuthError> {
    if expected.is_empty() || !secrets_match(provided, expected) {
        return Err(AuthError::WrongPassword);
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

/// Issues an admin session JWT (7-day expiry).
pub fn issue_jwt(secret: &[u8]) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as u64;
    let claims = Claims {
        sub: SUBJECT.into(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|_| AuthError::Encoding)
}

/// Validates a JWT and returns its subject.
pub fn validate_jwt(token: &str, secret: &[u8]) -> Result<String, AuthError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map_err(|_| AuthError::InvalidToken)?;
    if data.claims.sub != SUBJECT {
        return Err(AuthError::InvalidToken);
    }
    Ok(data.claims.sub)
}
