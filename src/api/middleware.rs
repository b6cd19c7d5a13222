use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;

use super::server::AppState;

/// Proof that the request carried a valid admin session token.
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let subject = super::auth::validate_jwt(token, &state.jwt_secret)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        Ok(AuthUser(subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth;
    use axum::http::Request;

    async fn extract(authorization: Option<String>) -> Result<AuthUser, StatusCode> {
        let state = AppState::for_tests("");
        let mut builder = Request::builder().uri("/api/credentials");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthUser::from_request_parts(&mut parts, &state).await
    }

    #[tokio::test]
    async fn bearer_token_is_required() {
        assert_eq!(extract(None).await.err(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(
            extract(Some("Bearer not-a-jwt".into())).await.err(),
            Some(StatusCode::UNAUTHORIZED)
        );

        let foreign = auth::issue_jwt(b"some-other-secret").unwrap();
        assert_eq!(
            extract(Some(format!("Bearer {foreign}"))).await.err(),
            Some(StatusCode::UNAUTHORIZED)
        );
    }

    #[tokio::test]
    async fn valid_session_token_is_accepted() {
        let state = AppState::for_tests("");
        let token = auth::issue_jwt(&state.jwt_secret).unwrap();

        let user = extract(Some(format!("Bearer {token}"))).await.unwrap();
        assert_eq!(user.0, "admin");

        assert_eq!(
            extract(Some(token)).await.err(),
            Some(StatusCode::UNAUTHORIZED)
        );
    }
}
