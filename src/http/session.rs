use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::post;
use axum::{Json, Router};
use sea_orm::EntityTrait;
use tracing::info;

use crate::auth::{self, AuthError, CustomClaims};
use crate::entities::user;
use crate::models::users::{OkResponse, TokenResponse};
use crate::state::AppState;

use super::{HttpError, db_error};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session", post(create_session))
        .route("/logout", post(logout))
        .route("/refresh", post(refresh_token))
}

/// Exchanges a bearer token for an HttpOnly session cookie.
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let token = auth::bearer_token(&headers).ok_or(AuthError::MissingCredentials)?;
    let claims = state.tokens.verify(token)?;
    let session = state
        .tokens
        .mint_session(&claims.sub, &claims.email, &claims.claims)?;
    let max_age = state.tokens.session_ttl().num_seconds();
    let cookie = auth::session_cookie(&state.settings.session_cookie_name, &session, max_age);

    info!(uid = %claims.sub, "Session created");
    Ok((AppendHeaders([(SET_COOKIE, cookie)]), Json(OkResponse::ok())))
}

async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    let cookie = auth::expired_session_cookie(&state.settings.session_cookie_name);
    (AppendHeaders([(SET_COOKIE, cookie)]), Json(OkResponse::ok()))
}

/// Re-mints a bearer token with the claims currently stored on the user record.
async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, HttpError> {
    let token = auth::bearer_token(&headers).ok_or(AuthError::MissingCredentials)?;
    let claims = state.tokens.verify(token)?;

    let record = user::Entity::find_by_id(claims.sub.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?;

    let (email, custom_claims) = match record {
        Some(record) => (
            record.email.clone(),
            CustomClaims::from_json(&record.custom_claims),
        ),
        None => (claims.email.clone(), CustomClaims::default()),
    };

    let fresh = state
        .tokens
        .mint_token(&claims.sub, &email, &custom_claims)?;
    Ok(Json(TokenResponse {
        token: fresh,
        expires_in: state.tokens.token_ttl().num_seconds(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    use crate::http::tests::send;

    #[tokio::test]
    async fn session_requires_bearer_token() {
        let request = Request::post("/auth/session").body(Body::empty()).unwrap();
        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_rejects_garbage_token() {
        let request = Request::post("/auth/session")
            .header("authorization", "Bearer garbage")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid or expired token");
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let request = Request::post("/auth/logout").body(Body::empty()).unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }
}
