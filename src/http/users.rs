use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, TransactionTrait,
};
use tracing::info;

use crate::auth::{self, CustomClaims, MAX_UID_LEN};
use crate::email::{is_valid_email, normalize_email};
use crate::entities::user;
use crate::models::users::{
    AdminFlagRequest, FindUserRequest, FindUserResponse, ProfileUpdateRequest,
    PropertyAssignRequest, RolesView, UserView,
};
use crate::state::AppState;
use crate::voting::MAX_PROPERTY_LEN;

use super::{Caller, HttpError, JsonBody, db_error};

const MAX_USERNAME_LEN: usize = 64;
const MAX_FULL_NAME_LEN: usize = 128;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/find-by-email", post(find_by_email))
        .route("/me", get(get_me).put(update_me))
        .route("/{uid}/admin", patch(set_admin_flag))
        .route("/{uid}/property", patch(assign_property))
}

pub const PROPERTY_LOCKED_MESSAGE: &str = "Only an administrator can change an owner's property.";

pub fn user_view(model: user::Model) -> UserView {
    UserView {
        uid: model.uid,
        email: model.email,
        username: model.username,
        full_name: model.full_name,
        property: model.property,
        roles: RolesView {
            owner: model.role_owner,
        },
        is_admin: model.is_admin,
        claims_synced_at: model.claims_synced_at.map(|at| at.with_timezone(&Utc)),
    }
}

/// Trims a profile field; blank becomes `None`.
fn profile_field(
    value: Option<String>,
    max_len: usize,
    label: &str,
) -> Result<Option<String>, HttpError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > max_len {
        return Err(HttpError::bad_request(format!(
            "{label} exceeds {max_len} characters"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

/// Votes are keyed by property, so owners cannot move their own.
fn property_change(
    current: Option<&str>,
    requested: Option<String>,
    locked: bool,
) -> Result<Option<String>, HttpError> {
    if !locked {
        return Ok(requested);
    }
    match requested {
        None => Ok(current.map(str::to_string)),
        Some(property) if Some(property.as_str()) == current => Ok(Some(property)),
        Some(_) => Err(HttpError::forbidden(PROPERTY_LOCKED_MESSAGE)),
    }
}

fn valid_target_uid(uid: &str) -> Result<String, HttpError> {
    let uid = uid.trim();
    if uid.is_empty() || uid.len() > MAX_UID_LEN {
        return Err(HttpError::bad_request("A target uid is required."));
    }
    Ok(uid.to_string())
}

async fn find_by_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<FindUserRequest>,
) -> Result<Json<FindUserResponse>, HttpError> {
    let claims = auth::authenticate_session(
        &headers,
        &state.tokens,
        &state.settings.session_cookie_name,
    )?;
    claims.require_admin()?;

    let email = normalize_email(&request.email);
    if !is_valid_email(&email) {
        return Err(HttpError::bad_request("A valid email is required."));
    }

    let found = user::Entity::find()
        .filter(user::Column::Email.eq(email.as_str()))
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found("No user with that email"))?;

    Ok(Json(FindUserResponse { uid: found.uid }))
}

async fn get_me(
    Caller(claims): Caller,
    State(state): State<AppState>,
) -> Result<Json<UserView>, HttpError> {
    let record = user::Entity::find_by_id(claims.sub.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found("No profile for this user"))?;
    Ok(Json(user_view(record)))
}

/// Creates the profile on first write, seeded from the token's email and claims.
async fn update_me(
    Caller(claims): Caller,
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ProfileUpdateRequest>,
) -> Result<Json<UserView>, HttpError> {
    let username = profile_field(request.username, MAX_USERNAME_LEN, "username")?;
    let full_name = profile_field(request.full_name, MAX_FULL_NAME_LEN, "fullName")?;
    let requested = profile_field(request.property, MAX_PROPERTY_LEN, "property")?;

    let existing = user::Entity::find_by_id(claims.sub.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?;
    let locked = claims.claims.owner || existing.as_ref().is_some_and(|user| user.role_owner);
    let property = property_change(
        existing.as_ref().and_then(|user| user.property.as_deref()),
        requested,
        locked,
    )?;

    let now = Utc::now().fixed_offset();
    let record = user::ActiveModel {
        uid: Set(claims.sub.clone()),
        email: Set(normalize_email(&claims.email)),
        username: Set(username),
        full_name: Set(full_name),
        property: Set(property),
        role_owner: Set(claims.claims.owner),
        is_admin: Set(claims.claims.admin),
        custom_claims: Set(claims.claims.to_json()),
        claims_synced_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    user::Entity::insert(record)
        .on_conflict(
            OnConflict::column(user::Column::Uid)
                .update_columns([
                    user::Column::Username,
                    user::Column::FullName,
                    user::Column::Property,
                    user::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(&state.database)
        .await
        .map_err(db_error)?;

    let saved = user::Entity::find_by_id(claims.sub.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found("No profile for this user"))?;

    info!(uid = %claims.sub, "Profile updated");
    Ok(Json(user_view(saved)))
}

async fn set_admin_flag(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(uid): Path<String>,
    JsonBody(request): JsonBody<AdminFlagRequest>,
) -> Result<Json<UserView>, HttpError> {
    claims.require_admin()?;
    let uid = valid_target_uid(&uid)?;

    let txn = state.database.begin().await.map_err(db_error)?;
    let existing = user::Entity::find_by_id(uid.clone())
        .one(&txn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No user with uid {uid}")))?;

    let stored_claims = CustomClaims::from_json(&existing.custom_claims);
    let synced = auth::sync_admin_claim(&stored_claims, request.is_admin);
    let now = Utc::now().fixed_offset();

    let mut active = existing.into_active_model();
    active.is_admin = Set(request.is_admin);
    active.updated_at = Set(now);
    if let Some(next) = &synced {
        active.custom_claims = Set(next.to_json());
        active.claims_synced_at = Set(Some(now));
    }
    let saved = active.update(&txn).await.map_err(db_error)?;
    txn.commit().await.map_err(db_error)?;

    info!(
        target_uid = %uid,
        is_admin = request.is_admin,
        claim_synced = synced.is_some(),
        acting_uid = %claims.sub,
        "Admin flag updated"
    );
    Ok(Json(user_view(saved)))
}

async fn assign_property(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(uid): Path<String>,
    JsonBody(request): JsonBody<PropertyAssignRequest>,
) -> Result<Json<UserView>, HttpError> {
    claims.require_admin()?;
    let uid = valid_target_uid(&uid)?;
    let property = profile_field(Some(request.property), MAX_PROPERTY_LEN, "property")?
        .ok_or_else(|| HttpError::bad_request("A property is required."))?;

    let existing = user::Entity::find_by_id(uid.clone())
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No user with uid {uid}")))?;
    let previous = existing.property.clone();

    let mut active = existing.into_active_model();
    active.property = Set(Some(property.clone()));
    active.updated_at = Set(Utc::now().fixed_offset());
    let saved = active.update(&state.database).await.map_err(db_error)?;

    info!(
        target_uid = %uid,
        previous = ?previous,
        property = %property,
        acting_uid = %claims.sub,
        "Property assigned"
    );
    Ok(Json(user_view(saved)))
}
