use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DbErr, EntityTrait, ModelTrait, QueryFilter, QueryOrder,
    SqlErr,
};
use serde::Deserialize;
use tracing::info;

use crate::bookings::{check_bookable, local_today, slot_time, validate_facility};
use crate::email::normalize_email;
use crate::entities::booking;
use crate::models::bookings::{
    BookingCreateRequest, BookingResetRequest, BookingResetResponse, BookingView,
};
use crate::models::users::OkResponse;
use crate::state::AppState;

use super::{Caller, HttpError, JsonBody, db_error};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_bookings).post(create_booking))
        .route("/mine", get(my_bookings))
        .route("/reset", post(reset_bookings))
        .route("/{id}", delete(cancel_booking))
}

pub fn booking_view(model: booking::Model) -> BookingView {
    BookingView {
        id: model.id,
        user: model.user_email,
        facility: model.facility,
        date: model.date,
        time: model.time,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn slot_conflict(err: DbErr) -> HttpError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            HttpError::conflict("That slot is already booked")
        }
        _ => db_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

async fn list_bookings(
    _caller: Caller,
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<BookingView>>, HttpError> {
    let date = query
        .date
        .unwrap_or_else(|| local_today(state.settings.timezone));
    let bookings = booking::Entity::find()
        .filter(booking::Column::Date.eq(date))
        .order_by_asc(booking::Column::Facility)
        .order_by_asc(booking::Column::Time)
        .all(&state.database)
        .await
        .map_err(db_error)?;
    Ok(Json(bookings.into_iter().map(booking_view).collect()))
}

async fn my_bookings(
    Caller(claims): Caller,
    State(state): State<AppState>,
) -> Result<Json<Vec<BookingView>>, HttpError> {
    let today = local_today(state.settings.timezone);
    let bookings = booking::Entity::find()
        .filter(booking::Column::UserEmail.eq(normalize_email(&claims.email)))
        .filter(booking::Column::Date.gte(today))
        .order_by_asc(booking::Column::Date)
        .order_by_asc(booking::Column::Time)
        .all(&state.database)
        .await
        .map_err(db_error)?;
    Ok(Json(bookings.into_iter().map(booking_view).collect()))
}

async fn create_booking(
    Caller(claims): Caller,
    State(state): State<AppState>,
    JsonBody(request): JsonBody<BookingCreateRequest>,
) -> Result<Json<BookingView>, HttpError> {
    let facility = validate_facility(&request.facility)?;
    let time = slot_time(&request.time)?;
    check_bookable(request.date, local_today(state.settings.timezone))?;
    let user_email = normalize_email(&claims.email);

    let taken = booking::Entity::find()
        .filter(booking::Column::Facility.eq(facility.as_str()))
        .filter(booking::Column::Date.eq(request.date))
        .filter(booking::Column::Time.eq(time.as_str()))
        .one(&state.database)
        .await
        .map_err(db_error)?;
    if taken.is_some() {
        return Err(HttpError::conflict("That slot is already booked"));
    }

    // The unique slot index settles races between the check and the insert.
    let saved = booking::ActiveModel {
        id: NotSet,
        user_email: Set(user_email),
        facility: Set(facility),
        date: Set(request.date),
        time: Set(time),
        created_at: Set(Utc::now().fixed_offset()),
    }
    .insert(&state.database)
    .await
    .map_err(slot_conflict)?;

    info!(
        booking_id = saved.id,
        facility = %saved.facility,
        date = %saved.date,
        time = %saved.time,
        "Booking created"
    );
    Ok(Json(booking_view(saved)))
}

async fn cancel_booking(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OkResponse>, HttpError> {
    let existing = booking::Entity::find_by_id(id)
        .one(&state.database)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No booking {id}")))?;

    if existing.user_email != normalize_email(&claims.email) && !claims.is_admin() {
        return Err(HttpError::forbidden("Only the booker or an admin can cancel"));
    }

    existing.delete(&state.database).await.map_err(db_error)?;
    info!(booking_id = id, acting_uid = %claims.sub, "Booking cancelled");
    Ok(Json(OkResponse::ok()))
}

async fn reset_bookings(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Query(request): Query<BookingResetRequest>,
) -> Result<Json<BookingResetResponse>, HttpError> {
    claims.require_admin()?;

    let mut query = booking::Entity::delete_many();
    if let Some(before) = request.before {
        query = query.filter(booking::Column::Date.lt(before));
    }
    let result = query.exec(&state.database).await.map_err(db_error)?;

    info!(
        deleted = result.rows_affected,
        before = ?request.before,
        acting_uid = %claims.sub,
        "Bookings reset"
    );
    Ok(Json(BookingResetResponse {
        deleted: result.rows_affected,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Request, StatusCode};
    use sea_orm::{DatabaseBackend, MockDatabase};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::tests::test_auth_config;
    use crate::auth::{CustomClaims, TokenVerifier};
    use crate::http::tests::send;
    use crate::state::testing::offline_state;

    fn bearer(custom: CustomClaims) -> String {
        let token = TokenVerifier::new(&test_auth_config())
            .mint_token("u1", "u1@james-square.com", &custom)
            .unwrap();
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn booking_in_the_past_is_rejected() {
        let request = Request::post("/bookings")
            .header(CONTENT_TYPE, "application/json")
            .header("authorization", bearer(CustomClaims::default()))
            .body(Body::from(
                json!({"facility": "Gym", "date": "2020-01-01", "time": "09:00"}).to_string(),
            ))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Cannot book a date in the past");
    }

    #[tokio::test]
    async fn differently_cased_facility_hits_the_same_slot() {
        let date = Utc::now().date_naive() + chrono::Duration::days(7);
        let existing = booking::Model {
            id: 9,
            user_email: "other@james-square.com".to_string(),
            facility: "gym".to_string(),
            date,
            time: "09:00".to_string(),
            created_at: Utc::now().fixed_offset(),
        };
        let mut state = offline_state();
        state.database = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![existing]])
            .into_connection();

        let request = Request::post("/bookings")
            .header(CONTENT_TYPE, "application/json")
            .header("authorization", bearer(CustomClaims::default()))
            .body(Body::from(
                json!({"facility": " GYM ", "date": date, "time": "9:00"}).to_string(),
            ))
            .unwrap();
        let response = crate::http::router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "That slot is already booked");
    }

    #[tokio::test]
    async fn reset_requires_admin() {
        let request = Request::post("/bookings/reset")
            .header("authorization", bearer(CustomClaims::default()))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
