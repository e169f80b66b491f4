use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthError, TokenClaims};
use crate::entities::{user, voting_option, voting_question, voting_vote};
use crate::models::voting::{
    MyVoteView, OptionView, QuestionCreateRequest, QuestionSummary, QuestionView,
    StatusUpdateRequest, VoteReceipt, VoteSubmissionRequest, VoteView,
};
use crate::state::AppState;
use crate::voting::{
    self, CounterChange, MAX_DESCRIPTION_LEN, MAX_OPTION_ID_LEN, MAX_OPTIONS_PER_QUESTION,
    MAX_QUESTION_ID_LEN, MAX_TITLE_LEN, QuestionStatus, Tally, TallySource, VoteRejection,
};

use super::{Caller, HttpError, JsonBody, db_error};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/questions", get(list_questions).post(create_question))
        .route("/questions/{id}", get(get_question))
        .route("/questions/{id}/status", patch(update_status))
        .route("/questions/{id}/votes", post(submit_vote))
        .route("/questions/{id}/tally", get(get_tally))
        .route("/questions/{id}/reconcile", post(reconcile_counters))
        .route("/questions/{id}/my-vote", get(my_vote))
}

/// A question ready to insert, after boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuestion {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<OptionView>,
    pub status: QuestionStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn validate_question(request: QuestionCreateRequest) -> Result<NewQuestion, HttpError> {
    let id = match request.id.as_deref() {
        Some(id) => voting::sanitize_identifier(id, MAX_QUESTION_ID_LEN, "Question id")
            .map_err(HttpError::bad_request)?,
        None => Uuid::new_v4().to_string(),
    };

    let title = request.title.trim().to_string();
    if title.is_empty() {
        return Err(HttpError::bad_request("Title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(HttpError::bad_request(format!(
            "Title exceeds {MAX_TITLE_LEN} characters"
        )));
    }
    let description = request.description.trim().to_string();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(HttpError::bad_request(format!(
            "Description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }

    if request.options.len() < 2 || request.options.len() > MAX_OPTIONS_PER_QUESTION {
        return Err(HttpError::bad_request(format!(
            "A question needs between 2 and {MAX_OPTIONS_PER_QUESTION} options"
        )));
    }
    let mut seen = HashSet::new();
    let mut options = Vec::with_capacity(request.options.len());
    for option in request.options {
        let option_id = voting::sanitize_identifier(&option.id, MAX_OPTION_ID_LEN, "Option id")
            .map_err(HttpError::bad_request)?;
        if !seen.insert(option_id.clone()) {
            return Err(HttpError::bad_request(format!(
                "Duplicate option id {option_id}"
            )));
        }
        let label = option.label.trim().to_string();
        if label.is_empty() || label.chars().count() > MAX_TITLE_LEN {
            return Err(HttpError::bad_request(format!(
                "Option {option_id} needs a label of at most {MAX_TITLE_LEN} characters"
            )));
        }
        options.push(OptionView {
            id: option_id,
            label,
        });
    }

    let status = match request.status.as_deref() {
        Some(raw) => raw.parse::<QuestionStatus>()?,
        None => QuestionStatus::Scheduled,
    };
    if status == QuestionStatus::Closed {
        return Err(HttpError::bad_request("A question cannot be created closed"));
    }

    if let (Some(start), Some(expiry)) = (request.starts_at, request.expires_at) {
        if start >= expiry {
            return Err(HttpError::bad_request("startsAt must be before expiresAt"));
        }
    }

    Ok(NewQuestion {
        id,
        title,
        description,
        options,
        status,
        starts_at: request.starts_at,
        expires_at: request.expires_at,
    })
}

fn require_owner(claims: &TokenClaims) -> Result<(), AuthError> {
    if claims.is_owner() {
        Ok(())
    } else {
        Err(AuthError::Forbidden("Only owners can vote"))
    }
}

fn stored_status(question: &voting_question::Model) -> Result<QuestionStatus, HttpError> {
    question.status.parse::<QuestionStatus>().map_err(|_| {
        HttpError::internal(format!(
            "Question {} has unknown status {}",
            question.id, question.status
        ))
    })
}

fn utc(value: Option<sea_orm::prelude::DateTimeWithTimeZone>) -> Option<DateTime<Utc>> {
    value.map(|at| at.with_timezone(&Utc))
}

async fn find_question<C: ConnectionTrait>(
    db: &C,
    question_id: &str,
) -> Result<voting_question::Model, HttpError> {
    voting_question::Entity::find_by_id(question_id.to_string())
        .one(db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No question {question_id}")))
}

/// Same as `find_question` but holds a row lock until the transaction ends,
/// which serializes concurrent votes on one question.
async fn lock_question<C: ConnectionTrait>(
    db: &C,
    question_id: &str,
) -> Result<voting_question::Model, HttpError> {
    voting_question::Entity::find_by_id(question_id.to_string())
        .lock_exclusive()
        .one(db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| HttpError::not_found(format!("No question {question_id}")))
}

async fn load_options<C: ConnectionTrait>(
    db: &C,
    question_id: &str,
) -> Result<Vec<voting_option::Model>, HttpError> {
    voting_option::Entity::find()
        .filter(voting_option::Column::QuestionId.eq(question_id))
        .order_by_asc(voting_option::Column::Position)
        .all(db)
        .await
        .map_err(db_error)
}

async fn scan_counts<C: ConnectionTrait>(
    db: &C,
    question_id: &str,
) -> Result<Vec<(String, i64)>, HttpError> {
    voting_vote::Entity::find()
        .select_only()
        .column(voting_vote::Column::OptionId)
        .column_as(Expr::col(voting_vote::Column::Id).count(), "votes")
        .filter(voting_vote::Column::QuestionId.eq(question_id))
        .group_by(voting_vote::Column::OptionId)
        .into_tuple::<(String, i64)>()
        .all(db)
        .await
        .map_err(db_error)
}

fn counter_tally(question_id: &str, options: &[voting_option::Model]) -> Tally {
    let declared: Vec<String> = options.iter().map(|o| o.option_id.clone()).collect();
    voting::build_tally(
        question_id,
        TallySource::Counters,
        &declared,
        options.iter().map(|o| (o.option_id.as_str(), o.vote_count)),
    )
}

fn scan_tally(question_id: &str, options: &[voting_option::Model], counts: &[(String, i64)]) -> Tally {
    let declared: Vec<String> = options.iter().map(|o| o.option_id.clone()).collect();
    voting::build_tally(
        question_id,
        TallySource::Scan,
        &declared,
        counts.iter().map(|(option, count)| (option.as_str(), *count)),
    )
}

async fn load_question_view(
    state: &AppState,
    question_id: &str,
) -> Result<Arc<QuestionView>, HttpError> {
    if let Some(cached) = state.cache.questions.get(question_id).await {
        return Ok(cached);
    }

    let read_epoch = state.cache.epoch();
    let question = find_question(&state.database, question_id).await?;
    let options = load_options(&state.database, question_id).await?;
    let status = stored_status(&question)?;
    let starts_at = utc(question.starts_at);
    let expires_at = utc(question.expires_at);

    let view = Arc::new(QuestionView {
        id: question.id.clone(),
        title: question.title,
        description: question.description,
        status,
        window: voting::window_state(Utc::now(), starts_at, expires_at),
        created_at: question.created_at.with_timezone(&Utc),
        starts_at,
        expires_at,
        vote_totals: counter_tally(&question.id, &options).totals,
        options: options
            .into_iter()
            .map(|o| OptionView {
                id: o.option_id,
                label: o.label,
            })
            .collect(),
    });
    state
        .cache
        .store_question(question_id, view.clone(), read_epoch)
        .await;
    Ok(view)
}

async fn list_questions(
    _caller: Caller,
    State(state): State<AppState>,
) -> Result<Json<Vec<QuestionSummary>>, HttpError> {
    let now = Utc::now();
    let questions = voting_question::Entity::find()
        .order_by_desc(voting_question::Column::CreatedAt)
        .all(&state.database)
        .await
        .map_err(db_error)?;

    let mut summaries = Vec::with_capacity(questions.len());
    for question in questions {
        let status = stored_status(&question)?;
        let starts_at = utc(question.starts_at);
        let expires_at = utc(question.expires_at);
        summaries.push(QuestionSummary {
            id: question.id,
            title: question.title,
            status,
            window: voting::window_state(now, starts_at, expires_at),
            starts_at,
            expires_at,
            created_at: question.created_at.with_timezone(&Utc),
        });
    }
    Ok(Json(summaries))
}

async fn get_question(
    _caller: Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
) -> Result<Json<QuestionView>, HttpError> {
    let cached = load_question_view(&state, &question_id).await?;
    let mut view = QuestionView::clone(&cached);
    // The cached window may be stale; it is a function of the current time.
    view.window = voting::window_state(Utc::now(), view.starts_at, view.expires_at);
    Ok(Json(view))
}

async fn create_question(
    Caller(claims): Caller,
    State(state): State<AppState>,
    JsonBody(request): JsonBody<QuestionCreateRequest>,
) -> Result<Json<QuestionView>, HttpError> {
    claims.require_admin()?;
    let question = validate_question(request)?;

    let txn = state.database.begin().await.map_err(db_error)?;
    let existing = voting_question::Entity::find_by_id(question.id.clone())
        .one(&txn)
        .await
        .map_err(db_error)?;
    if existing.is_some() {
        return Err(HttpError::conflict(format!(
            "Question {} already exists",
            question.id
        )));
    }

    let now = Utc::now().fixed_offset();
    voting_question::ActiveModel {
        id: Set(question.id.clone()),
        title: Set(question.title.clone()),
        description: Set(question.description.clone()),
        status: Set(question.status.as_str().to_string()),
        starts_at: Set(question.starts_at.map(|at| at.fixed_offset())),
        expires_at: Set(question.expires_at.map(|at| at.fixed_offset())),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&txn)
    .await
    .map_err(db_error)?;

    let options = question
        .options
        .iter()
        .enumerate()
        .map(|(position, option)| voting_option::ActiveModel {
            question_id: Set(question.id.clone()),
            option_id: Set(option.id.clone()),
            label: Set(option.label.clone()),
            position: Set(position as i32),
            vote_count: Set(0),
        });
    voting_option::Entity::insert_many(options)
        .exec(&txn)
        .await
        .map_err(db_error)?;
    txn.commit().await.map_err(db_error)?;

    info!(
        question_id = %question.id,
        options = question.options.len(),
        status = %question.status,
        acting_uid = %claims.sub,
        "Voting question created"
    );

    let view = load_question_view(&state, &question.id).await?;
    Ok(Json(QuestionView::clone(&view)))
}

async fn update_status(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    JsonBody(request): JsonBody<StatusUpdateRequest>,
) -> Result<Json<QuestionSummary>, HttpError> {
    claims.require_admin()?;
    let next = request.status.parse::<QuestionStatus>()?;

    let txn = state.database.begin().await.map_err(db_error)?;
    let question = lock_question(&txn, &question_id).await?;
    let current = stored_status(&question)?;
    if !current.can_transition_to(next) {
        return Err(HttpError::bad_request(format!(
            "Cannot move a question from {current} to {next}"
        )));
    }

    let mut active = question.into_active_model();
    active.status = Set(next.as_str().to_string());
    active.updated_at = Set(Utc::now().fixed_offset());
    let saved = active.update(&txn).await.map_err(db_error)?;
    txn.commit().await.map_err(db_error)?;
    state.cache.invalidate_question(&question_id).await;

    info!(
        question_id = %question_id,
        from = %current,
        to = %next,
        acting_uid = %claims.sub,
        "Voting question status changed"
    );

    let starts_at = utc(saved.starts_at);
    let expires_at = utc(saved.expires_at);
    Ok(Json(QuestionSummary {
        id: saved.id,
        title: saved.title,
        status: next,
        window: voting::window_state(Utc::now(), starts_at, expires_at),
        starts_at,
        expires_at,
        created_at: saved.created_at.with_timezone(&Utc),
    }))
}

async fn voter_record(
    state: &AppState,
    claims: &TokenClaims,
) -> Result<Option<user::Model>, HttpError> {
    user::Entity::find_by_id(claims.sub.clone())
        .one(&state.database)
        .await
        .map_err(db_error)
}

fn voter_property(record: Option<&user::Model>) -> Result<String, VoteRejection> {
    let raw = record
        .and_then(|user| user.property.as_deref())
        .unwrap_or_default();
    voting::property_key(raw)
}

async fn apply_counter_change<C: ConnectionTrait>(
    db: &C,
    question_id: &str,
    change: &CounterChange,
) -> Result<(), HttpError> {
    let (decrement, increment) = match change {
        CounterChange::Unchanged => return Ok(()),
        CounterChange::Increment(option) => (None, option),
        CounterChange::Move { from, to } => (Some(from), to),
    };

    if let Some(from) = decrement {
        voting_option::Entity::update_many()
            .col_expr(
                voting_option::Column::VoteCount,
                Expr::col(voting_option::Column::VoteCount).sub(1),
            )
            .filter(voting_option::Column::QuestionId.eq(question_id))
            .filter(voting_option::Column::OptionId.eq(from.as_str()))
            .filter(voting_option::Column::VoteCount.gt(0))
            .exec(db)
            .await
            .map_err(db_error)?;
    }

    voting_option::Entity::update_many()
        .col_expr(
            voting_option::Column::VoteCount,
            Expr::col(voting_option::Column::VoteCount).add(1),
        )
        .filter(voting_option::Column::QuestionId.eq(question_id))
        .filter(voting_option::Column::OptionId.eq(increment.as_str()))
        .exec(db)
        .await
        .map_err(db_error)?;
    Ok(())
}

async fn submit_vote(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    JsonBody(request): JsonBody<VoteSubmissionRequest>,
) -> Result<Json<VoteReceipt>, HttpError> {
    require_owner(&claims)?;
    let option_id = request.option_id.trim().to_string();
    if option_id.is_empty() {
        return Err(HttpError::bad_request("An option is required"));
    }

    let voter = voter_record(&state, &claims).await?;
    let property = voter_property(voter.as_ref())?;
    let vote_id = voting::vote_document_id(&question_id, &property);

    let txn = state.database.begin().await.map_err(db_error)?;
    let question = lock_question(&txn, &question_id).await?;
    let status = stored_status(&question)?;
    let window = voting::window_state(
        Utc::now(),
        utc(question.starts_at),
        utc(question.expires_at),
    );
    voting::check_submission(status, window)?;

    let option = voting_option::Entity::find_by_id((question_id.clone(), option_id.clone()))
        .one(&txn)
        .await
        .map_err(db_error)?;
    if option.is_none() {
        return Err(VoteRejection::UnknownOption(option_id).into());
    }

    let previous = voting_vote::Entity::find_by_id(vote_id.clone())
        .one(&txn)
        .await
        .map_err(db_error)?;
    let previous_option = previous.as_ref().map(|vote| vote.option_id.clone());
    let change = voting::counter_change(previous_option.as_deref(), &option_id);

    let now = Utc::now().fixed_offset();
    let voter_name = voter
        .as_ref()
        .and_then(|user| user.full_name.clone().or_else(|| user.username.clone()));
    match previous {
        Some(existing) => {
            let mut active = existing.into_active_model();
            active.option_id = Set(option_id.clone());
            active.voter_name = Set(voter_name);
            active.voter_email = Set(claims.email.clone());
            active.user_id = Set(Some(claims.sub.clone()));
            active.updated_at = Set(now);
            active.update(&txn).await.map_err(db_error)?;
        }
        None => {
            voting_vote::ActiveModel {
                id: Set(vote_id.clone()),
                question_id: Set(question_id.clone()),
                option_id: Set(option_id.clone()),
                property: Set(property.clone()),
                voter_name: Set(voter_name),
                voter_email: Set(claims.email.clone()),
                user_id: Set(Some(claims.sub.clone())),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(db_error)?;
        }
    }

    apply_counter_change(&txn, &question_id, &change).await?;
    txn.commit().await.map_err(db_error)?;
    state.cache.invalidate_question(&question_id).await;

    info!(
        question_id = %question_id,
        option_id = %option_id,
        property = %property,
        replaced = previous_option.is_some(),
        "Vote recorded"
    );

    Ok(Json(VoteReceipt {
        question_id,
        option_id,
        property,
        replaced: previous_option.is_some(),
        previous_option_id: previous_option,
    }))
}

#[derive(Debug, Deserialize)]
struct TallyQuery {
    source: Option<String>,
}

fn tally_source(query: &TallyQuery) -> Result<TallySource, HttpError> {
    match query.source.as_deref() {
        None => Ok(TallySource::Counters),
        Some(raw) => raw.parse().map_err(HttpError::bad_request),
    }
}

async fn get_tally(
    _caller: Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    Query(query): Query<TallyQuery>,
) -> Result<Json<Tally>, HttpError> {
    let source = tally_source(&query)?;
    match source {
        TallySource::Counters => {
            if let Some(cached) = state.cache.tallies.get(&question_id).await {
                return Ok(Json(Tally::clone(&cached)));
            }
            let read_epoch = state.cache.epoch();
            find_question(&state.database, &question_id).await?;
            let options = load_options(&state.database, &question_id).await?;
            let tally = counter_tally(&question_id, &options);
            state
                .cache
                .store_tally(&question_id, Arc::new(tally.clone()), read_epoch)
                .await;
            Ok(Json(tally))
        }
        TallySource::Scan => {
            find_question(&state.database, &question_id).await?;
            let options = load_options(&state.database, &question_id).await?;
            let counts = scan_counts(&state.database, &question_id).await?;
            Ok(Json(scan_tally(&question_id, &options, &counts)))
        }
    }
}

/// Rewrites every option counter from a scan of the raw votes.
async fn reconcile_counters(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
) -> Result<Json<Tally>, HttpError> {
    claims.require_admin()?;

    let txn = state.database.begin().await.map_err(db_error)?;
    lock_question(&txn, &question_id).await?;
    let options = load_options(&txn, &question_id).await?;
    let counters = counter_tally(&question_id, &options);
    let counts = scan_counts(&txn, &question_id).await?;
    let tally = scan_tally(&question_id, &options, &counts);

    let drift = counter_drift(&counters, &tally);
    for option in options {
        let actual = tally.totals.get(&option.option_id).copied().unwrap_or(0);
        if option.vote_count == actual {
            continue;
        }
        let mut active = option.into_active_model();
        active.vote_count = Set(actual);
        active.update(&txn).await.map_err(db_error)?;
    }
    txn.commit().await.map_err(db_error)?;
    state.cache.invalidate_question(&question_id).await;

    info!(
        question_id = %question_id,
        corrected = drift.len(),
        ?drift,
        scan_total = tally.total,
        acting_uid = %claims.sub,
        "Vote counters reconciled"
    );
    Ok(Json(tally))
}

async fn my_vote(
    Caller(claims): Caller,
    State(state): State<AppState>,
    Path(question_id): Path<String>,
) -> Result<Json<MyVoteView>, HttpError> {
    let voter = voter_record(&state, &claims).await?;
    let Ok(property) = voter_property(voter.as_ref()) else {
        return Ok(Json(MyVoteView {
            has_voted: false,
            vote: None,
        }));
    };

    let vote = voting_vote::Entity::find_by_id(voting::vote_document_id(&question_id, &property))
        .one(&state.database)
        .await
        .map_err(db_error)?
        .map(|vote| VoteView {
            question_id: vote.question_id,
            option_id: vote.option_id,
            property: vote.property,
            voter_name: vote.voter_name,
            voter_email: vote.voter_email,
            created_at: vote.created_at.with_timezone(&Utc),
            updated_at: vote.updated_at.with_timezone(&Utc),
        });

    Ok(Json(MyVoteView {
        has_voted: vote.is_some(),
        vote,
    }))
}

/// Per-option differences between the counters and a scan; empty when they agree.
pub fn counter_drift(counters: &Tally, scan: &Tally) -> BTreeMap<String, i64> {
    counters
        .totals
        .iter()
        .filter_map(|(option, count)| {
            let actual = scan.totals.get(option).copied().unwrap_or(0);
            (actual != *count).then(|| (option.clone(), actual - count))
        })
        .collect()
}
