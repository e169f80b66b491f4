use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::{self, CustomClaims, MAX_UID_LEN};
use crate::entities::user;
use crate::models::users::OkResponse;
use crate::state::AppState;

use super::{HttpError, db_error};

pub const MISSING_UID_MESSAGE: &str = "A target uid is required.";

pub fn router() -> Router<AppState> {
    Router::new().route("/owner", post(set_owner_claim))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerClaimRequest {
    pub uid: String,
    pub owner: bool,
}

/// Validated at the boundary so a missing or non-string uid gets a precise 400.
pub fn parse_owner_claim_request(body: &Value) -> Result<OwnerClaimRequest, HttpError> {
    let uid = body
        .get("uid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| HttpError::bad_request(MISSING_UID_MESSAGE))?;
    if uid.len() > MAX_UID_LEN {
        return Err(HttpError::bad_request(format!(
            "uid exceeds {MAX_UID_LEN} characters"
        )));
    }
    let owner = body
        .get("owner")
        .and_then(Value::as_bool)
        .ok_or_else(|| HttpError::bad_request("owner must be a boolean."))?;
    Ok(OwnerClaimRequest {
        uid: uid.to_string(),
        owner,
    })
}

async fn set_owner_claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>, HttpError> {
    let caller = auth::resolve_privileged_caller(
        &headers,
        &state.tokens,
        state.settings.server_key.as_deref(),
    )
    .map_err(|err| {
        warn!("setOwnerClaim denied: {err}");
        HttpError::new(
            StatusCode::FORBIDDEN,
            "Only administrators can change owner claims.".to_string(),
        )
    })?;

    // Parsed only after the caller is authorized.
    let body: Value = serde_json::from_slice(&body)
        .map_err(|_| HttpError::bad_request("Request body must be a JSON object."))?;
    let request = parse_owner_claim_request(&body)?;

    let existing = user::Entity::find_by_id(request.uid.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No user with uid {}", request.uid)))?;

    let mut claims = CustomClaims::from_json(&existing.custom_claims);
    claims.owner = request.owner;
    let now = Utc::now().fixed_offset();

    let mut active = existing.into_active_model();
    active.custom_claims = Set(claims.to_json());
    active.role_owner = Set(request.owner);
    active.claims_synced_at = Set(Some(now));
    active.updated_at = Set(now);
    active.update(&state.database).await.map_err(db_error)?;

    info!(
        target_uid = %request.uid,
        owner = request.owner,
        acting_uid = %caller.acting_uid(),
        "Owner claim updated"
    );

    Ok(Json(OkResponse::ok()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::header::CONTENT_TYPE;
    use sea_orm::{DatabaseBackend, MockDatabase};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::tests::test_auth_config;
    use crate::auth::{SERVER_KEY_HEADER, TokenVerifier, VERIFIED_UID_HEADER};
    use crate::http::tests::send;
    use crate::state::testing::{TEST_SERVER_KEY, offline_state};

    fn token(claims: CustomClaims) -> String {
        TokenVerifier::new(&test_auth_config())
            .mint_token("caller-1", "caller@james-square.com", &claims)
            .unwrap()
    }

    fn admin_token() -> String {
        token(CustomClaims {
            admin: true,
            ..CustomClaims::default()
        })
    }

    fn post(body: Value, headers: &[(&str, String)]) -> Request<Body> {
        let mut builder = Request::post("/claims/owner").header(CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn parses_valid_payload() {
        let parsed = parse_owner_claim_request(&json!({"uid": " u1 ", "owner": true})).unwrap();
        assert_eq!(
            parsed,
            OwnerClaimRequest {
                uid: "u1".to_string(),
                owner: true
            }
        );
    }

    #[test]
    fn missing_or_non_string_uid_is_rejected() {
        for body in [
            json!({"owner": true}),
            json!({"uid": 42, "owner": true}),
            json!({"uid": null, "owner": false}),
            json!({"uid": "   ", "owner": true}),
            json!({"uid": ["u1"], "owner": true}),
        ] {
            let err = parse_owner_claim_request(&body).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert_eq!(err.message, MISSING_UID_MESSAGE);
        }
    }

    #[test]
    fn non_boolean_owner_is_rejected() {
        let err = parse_owner_claim_request(&json!({"uid": "u1", "owner": "yes"})).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_with_missing_uid_gets_400() {
        let request = post(
            json!({"owner": true}),
            &[("authorization", format!("Bearer {}", admin_token()))],
        );
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], MISSING_UID_MESSAGE);
    }

    #[tokio::test]
    async fn bypass_with_non_string_uid_gets_400() {
        let request = post(
            json!({"uid": 7, "owner": true}),
            &[
                (SERVER_KEY_HEADER, TEST_SERVER_KEY.to_string()),
                (VERIFIED_UID_HEADER, "service-uid".to_string()),
            ],
        );
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], MISSING_UID_MESSAGE);
    }

    #[tokio::test]
    async fn non_admin_callers_get_403() {
        let owner_only = token(CustomClaims {
            owner: true,
            ..CustomClaims::default()
        });
        let cases = vec![
            vec![],
            vec![("authorization", format!("Bearer {owner_only}"))],
            vec![("authorization", "Bearer not-a-jwt".to_string())],
            vec![
                (SERVER_KEY_HEADER, "wrong-key".to_string()),
                (VERIFIED_UID_HEADER, "service-uid".to_string()),
            ],
            vec![(SERVER_KEY_HEADER, TEST_SERVER_KEY.to_string())],
        ];
        for headers in cases {
            let request = post(json!({"uid": "target", "owner": true}), &headers);
            let (status, _) = send(request).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test]
    async fn unauthorized_caller_gets_403_whatever_the_body() {
        let malformed = Request::post("/claims/owner")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let untyped = Request::post("/claims/owner")
            .body(Body::from("uid=target"))
            .unwrap();
        for request in [malformed, untyped] {
            let (status, body) = send(request).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(body["error"], "Only administrators can change owner claims.");
        }
    }

    #[tokio::test]
    async fn owner_claim_for_unknown_user_is_not_found() {
        let mut state = offline_state();
        state.database = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<user::Model>::new()])
            .into_connection();
        let request = post(
            json!({"uid": "ghost", "owner": true}),
            &[("authorization", format!("Bearer {}", admin_token()))],
        );
        let response = crate::http::router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_with_malformed_body_gets_json_400() {
        let request = Request::post("/claims/owner")
            .header(CONTENT_TYPE, "application/json")
            .header("authorization", format!("Bearer {}", admin_token()))
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Request body must be a JSON object.");
    }
}
