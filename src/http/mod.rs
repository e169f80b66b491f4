use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use sea_orm::DbErr;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{self, AuthError, SERVER_KEY_HEADER, TokenClaims, VERIFIED_UID_HEADER};
use crate::bookings::BookingError;
use crate::email::EmailError;
use crate::mailer::MailerError;
use crate::state::AppState;
use crate::voting::VoteRejection;

mod bookings;
mod claims;
mod email;
mod session;
mod users;
mod voting;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            ACCEPT,
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(SERVER_KEY_HEADER),
            HeaderName::from_static(VERIFIED_UID_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .nest("/auth", session::router())
        .nest("/claims", claims::router())
        .nest("/users", users::router())
        .nest("/email", email::admin_router())
        .nest("/committee/email", email::committee_router())
        .nest("/voting", voting::router())
        .nest("/bookings", bookings::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let response = ReadyResponse {
        status: "ready",
        server_key_configured: state.settings.server_key.is_some(),
        cache_entries: CacheSummary {
            questions: state.cache.questions.entry_count(),
            tallies: state.cache.tallies.entry_count(),
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    server_key_configured: bool,
    cache_entries: CacheSummary,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    questions: u64,
    tallies: u64,
}

/// Authenticated caller, from a bearer token or the session cookie.
pub struct Caller(pub TokenClaims);

impl FromRequestParts<AppState> for Caller {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        auth::authenticate(
            &parts.headers,
            &state.tokens,
            &state.settings.session_cookie_name,
        )
        .map(Caller)
        .map_err(HttpError::from)
    }
}

/// `Json` whose rejection renders as an `HttpError` body.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(JsonBody(value))
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("Internal error: {message}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

pub fn db_error(err: DbErr) -> HttpError {
    error!("Database error: {err}");
    HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::MissingCredentials | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::ServerKeyRejected
            | AuthError::MissingVerifiedUid
            | AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Minting(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<EmailError> for HttpError {
    fn from(err: EmailError) -> Self {
        let status = match err {
            EmailError::DailyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl From<BookingError> for HttpError {
    fn from(err: BookingError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<MailerError> for HttpError {
    fn from(err: MailerError) -> Self {
        error!("Email delivery failed: {err}");
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<VoteRejection> for HttpError {
    fn from(err: VoteRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!("HTTP error: {}", self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}
