use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QuerySelect};
use tracing::{info, warn};

use crate::auth::{AuthError, TokenClaims};
use crate::email::{self, EmailError};
use crate::entities::email_send;
use crate::mailer::OutboundEmail;
use crate::models::email::{SendEmailRequest, SendEmailResponse};
use crate::state::AppState;

use super::{Caller, HttpError, JsonBody, db_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Admin,
    Committee,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Admin => "admin",
            Channel::Committee => "committee",
        }
    }

    /// Admins may use either channel; committee members only their own.
    pub fn authorize(self, claims: &TokenClaims) -> Result<(), AuthError> {
        let allowed = match self {
            Channel::Admin => claims.is_admin(),
            Channel::Committee => claims.is_admin() || claims.claims.committee,
        };
        if allowed {
            Ok(())
        } else {
            Err(AuthError::Forbidden("Not permitted to send email"))
        }
    }
}

pub fn admin_router() -> Router<AppState> {
    Router::new().route("/send", post(send_admin_email))
}

pub fn committee_router() -> Router<AppState> {
    Router::new().route("/send", post(send_committee_email))
}

async fn send_admin_email(
    Caller(claims): Caller,
    State(state): State<AppState>,
    JsonBody(request): JsonBody<SendEmailRequest>,
) -> Result<Json<SendEmailResponse>, HttpError> {
    send_email(Channel::Admin, claims, state, request).await
}

async fn send_committee_email(
    Caller(claims): Caller,
    State(state): State<AppState>,
    JsonBody(request): JsonBody<SendEmailRequest>,
) -> Result<Json<SendEmailResponse>, HttpError> {
    send_email(Channel::Committee, claims, state, request).await
}

async fn send_email(
    channel: Channel,
    claims: TokenClaims,
    state: AppState,
    request: SendEmailRequest,
) -> Result<Json<SendEmailResponse>, HttpError> {
    channel.authorize(&claims)?;

    // Nothing goes out unless the whole request is valid.
    email::validate_content(&request.subject, &request.message)?;
    let recipients = email::collect_recipients(&request.raw_recipients())?;
    let reply_to = match request.reply_to.as_deref().map(email::normalize_email) {
        Some(address) if address.is_empty() => None,
        Some(address) if !email::is_valid_email(&address) => {
            return Err(EmailError::InvalidAddress(address).into());
        }
        other => other,
    };

    let today = Utc::now().date_naive();
    let sent_today = recipients_sent_on(&state, today).await?;
    let limit = state.settings.daily_recipient_limit;
    email::check_daily_quota(sent_today, recipients.len(), limit)?;

    let subject = request.subject.trim().to_string();
    let text = request.message.trim().to_string();
    let from = state.mailer.from_address().to_string();
    let mut batch_count = 0;

    for batch in email::batches(&recipients, state.settings.email_batch_size) {
        let outbound = OutboundEmail {
            to: vec![from.clone()],
            bcc: batch.to_vec(),
            subject: subject.clone(),
            text: text.clone(),
            reply_to: reply_to.clone(),
        };
        let receipt = state.mailer.send(&outbound).await.map_err(|err| {
            warn!(
                channel = channel.as_str(),
                delivered_batches = batch_count,
                "Email batch failed"
            );
            HttpError::from(err)
        })?;

        email_send::ActiveModel {
            id: NotSet,
            sent_on: Set(today),
            channel: Set(channel.as_str().to_string()),
            sender_uid: Set(claims.sub.clone()),
            recipient_count: Set(batch.len() as i32),
            subject: Set(subject.clone()),
            provider_message_id: Set(Some(receipt.id)),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&state.database)
        .await
        .map_err(db_error)?;
        batch_count += 1;
    }

    let remaining_today = limit
        .saturating_sub(sent_today)
        .saturating_sub(recipients.len() as u32);
    info!(
        channel = channel.as_str(),
        sender_uid = %claims.sub,
        recipients = recipients.len(),
        batches = batch_count,
        remaining_today,
        "Email sent"
    );

    Ok(Json(SendEmailResponse {
        ok: true,
        recipients: recipients.len(),
        batches: batch_count,
        remaining_today,
    }))
}

async fn recipients_sent_on(state: &AppState, day: NaiveDate) -> Result<u32, HttpError> {
    let total: Option<Option<i64>> = email_send::Entity::find()
        .select_only()
        .column_as(
            Expr::col(email_send::Column::RecipientCount).sum(),
            "total",
        )
        .filter(email_send::Column::SentOn.eq(day))
        .into_tuple()
        .one(&state.database)
        .await
        .map_err(db_error)?;
    let total = total.flatten().unwrap_or(0);
    Ok(u32::try_from(total.max(0)).unwrap_or(u32::MAX))
}
