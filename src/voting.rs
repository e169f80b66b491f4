use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub const MAX_QUESTION_ID_LEN: usize = 64;
pub const MAX_OPTION_ID_LEN: usize = 64;
pub const MAX_OPTIONS_PER_QUESTION: usize = 32;
pub const MAX_PROPERTY_LEN: usize = 64;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

const _: [(); 160 - (MAX_QUESTION_ID_LEN + 1 + MAX_PROPERTY_LEN)] =
    [(); 160 - (MAX_QUESTION_ID_LEN + 1 + MAX_PROPERTY_LEN)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Scheduled,
    Open,
    Closed,
}

impl QuestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionStatus::Scheduled => "scheduled",
            QuestionStatus::Open => "open",
            QuestionStatus::Closed => "closed",
        }
    }

    /// scheduled → open → closed, with scheduled → closed for withdrawn questions.
    pub fn can_transition_to(self, next: QuestionStatus) -> bool {
        matches!(
            (self, next),
            (QuestionStatus::Scheduled, QuestionStatus::Open)
                | (QuestionStatus::Scheduled, QuestionStatus::Closed)
                | (QuestionStatus::Open, QuestionStatus::Closed)
        )
    }
}

impl fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionStatus {
    type Err = VoteRejection;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(QuestionStatus::Scheduled),
            "open" => Ok(QuestionStatus::Open),
            "closed" => Ok(QuestionStatus::Closed),
            other => Err(VoteRejection::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowState {
    NotYetOpen,
    Open,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteRejection {
    #[error("Voting on this question is {0}")]
    NotOpen(QuestionStatus),
    #[error("Voting has not opened yet")]
    NotYetOpen,
    #[error("Voting window has closed")]
    WindowClosed,
    #[error("Option {0} does not belong to this question")]
    UnknownOption(String),
    #[error("Unknown question status {0}")]
    UnknownStatus(String),
    #[error("A property is required to vote")]
    MissingProperty,
    #[error("Property exceeds {MAX_PROPERTY_LEN} characters")]
    PropertyTooLong,
}

/// Half-open window `[starts_at, expires_at)`; a missing bound is unbounded.
pub fn window_state(
    now: DateTime<Utc>,
    starts_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> WindowState {
    if let Some(start) = starts_at {
        if now < start {
            return WindowState::NotYetOpen;
        }
    }
    if let Some(expiry) = expires_at {
        if now >= expiry {
            return WindowState::Closed;
        }
    }
    WindowState::Open
}

pub fn check_submission(status: QuestionStatus, window: WindowState) -> Result<(), VoteRejection> {
    if status != QuestionStatus::Open {
        return Err(VoteRejection::NotOpen(status));
    }
    match window {
        WindowState::Open => Ok(()),
        WindowState::NotYetOpen => Err(VoteRejection::NotYetOpen),
        WindowState::Closed => Err(VoteRejection::WindowClosed),
    }
}

/// Lowercased, whitespace collapsed to single dashes: `" Flat  12 "` → `"flat-12"`.
pub fn property_key(raw: &str) -> Result<String, VoteRejection> {
    let key = raw
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-");
    if key.is_empty() {
        return Err(VoteRejection::MissingProperty);
    }
    if key.chars().count() > MAX_PROPERTY_LEN {
        return Err(VoteRejection::PropertyTooLong);
    }
    Ok(key)
}

pub fn vote_document_id(question_id: &str, property_key: &str) -> String {
    assert!(!question_id.is_empty(), "Question id must not be empty");
    assert!(!property_key.is_empty(), "Property key must not be empty");
    format!("{question_id}:{property_key}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterChange {
    Increment(String),
    Move { from: String, to: String },
    Unchanged,
}

pub fn counter_change(previous: Option<&str>, next: &str) -> CounterChange {
    match previous {
        None => CounterChange::Increment(next.to_string()),
        Some(prev) if prev == next => CounterChange::Unchanged,
        Some(prev) => CounterChange::Move {
            from: prev.to_string(),
            to: next.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TallySource {
    Counters,
    Scan,
}

impl FromStr for TallySource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "counters" => Ok(TallySource::Counters),
            "scan" => Ok(TallySource::Scan),
            other => Err(format!("Unsupported tally source {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub question_id: String,
    pub source: TallySource,
    pub totals: BTreeMap<String, i64>,
    pub total: i64,
}

/// Every declared option appears, zero when nothing counted it. Counts for
/// undeclared options are dropped.
pub fn build_tally<'a, I>(
    question_id: &str,
    source: TallySource,
    declared: &[String],
    counts: I,
) -> Tally
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut totals: BTreeMap<String, i64> =
        declared.iter().map(|option| (option.clone(), 0)).collect();
    for (option, count) in counts {
        if let Some(slot) = totals.get_mut(option) {
            *slot += count.max(0);
        }
    }
    let total = totals.values().sum();
    Tally {
        question_id: question_id.to_string(),
        source,
        totals,
        total,
    }
}

pub fn sanitize_identifier(value: &str, max_len: usize, label: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} must not be empty"));
    }
    if trimmed.len() > max_len {
        return Err(format!("{label} exceeds {max_len} characters"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "{label} may only contain letters, digits, '-' and '_'"
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap()
    }

    #[test]
    fn window_is_half_open() {
        let start = Some(at(9));
        let end = Some(at(17));
        assert_eq!(window_state(at(8), start, end), WindowState::NotYetOpen);
        assert_eq!(window_state(at(9), start, end), WindowState::Open);
        assert_eq!(window_state(at(16), start, end), WindowState::Open);
        assert_eq!(window_state(at(17), start, end), WindowState::Closed);
    }

    #[test]
    fn missing_bounds_are_unbounded() {
        assert_eq!(window_state(at(0), None, None), WindowState::Open);
        assert_eq!(window_state(at(23), Some(at(1)), None), WindowState::Open);
        assert_eq!(window_state(at(0), None, Some(at(1))), WindowState::Open);
    }

    #[test]
    fn submission_requires_open_status_and_window() {
        assert!(check_submission(QuestionStatus::Open, WindowState::Open).is_ok());
        assert_eq!(
            check_submission(QuestionStatus::Closed, WindowState::Open),
            Err(VoteRejection::NotOpen(QuestionStatus::Closed))
        );
        assert_eq!(
            check_submission(QuestionStatus::Scheduled, WindowState::Open),
            Err(VoteRejection::NotOpen(QuestionStatus::Scheduled))
        );
        assert_eq!(
            check_submission(QuestionStatus::Open, WindowState::Closed),
            Err(VoteRejection::WindowClosed)
        );
        assert_eq!(
            check_submission(QuestionStatus::Open, WindowState::NotYetOpen),
            Err(VoteRejection::NotYetOpen)
        );
    }

    #[test]
    fn status_transitions() {
        use QuestionStatus::*;
        assert!(Scheduled.can_transition_to(Open));
        assert!(Scheduled.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Open.can_transition_to(Scheduled));
        assert!(!Open.can_transition_to(Open));
        assert_eq!("OPEN".parse::<QuestionStatus>(), Ok(Open));
        assert!("paused".parse::<QuestionStatus>().is_err());
    }

    #[test]
    fn property_key_collapses_spacing_and_case() {
        assert_eq!(property_key("  Flat  12 ").unwrap(), "flat-12");
        assert_eq!(property_key("flat 12").unwrap(), "flat-12");
        assert_eq!(property_key("   "), Err(VoteRejection::MissingProperty));
        assert_eq!(
            property_key(&"x".repeat(MAX_PROPERTY_LEN + 1)),
            Err(VoteRejection::PropertyTooLong)
        );
    }

    #[test]
    fn same_property_maps_to_same_vote_document() {
        let a = vote_document_id("agm-2026", &property_key("Flat 12").unwrap());
        let b = vote_document_id("agm-2026", &property_key(" flat   12").unwrap());
        assert_eq!(a, b);
        assert_ne!(a, vote_document_id("agm-2027", "flat-12"));
    }

    #[test]
    fn counter_changes_follow_last_write() {
        assert_eq!(
            counter_change(None, "yes"),
            CounterChange::Increment("yes".to_string())
        );
        assert_eq!(counter_change(Some("yes"), "yes"), CounterChange::Unchanged);
        assert_eq!(
            counter_change(Some("yes"), "no"),
            CounterChange::Move {
                from: "yes".to_string(),
                to: "no".to_string()
            }
        );
    }

    #[test]
    fn tally_includes_declared_options_only() {
        let declared = vec!["yes".to_string(), "no".to_string(), "abstain".to_string()];
        let tally = build_tally(
            "q1",
            TallySource::Scan,
            &declared,
            [("yes", 3), ("no", 1), ("stale", 4)],
        );
        assert_eq!(tally.totals["yes"], 3);
        assert_eq!(tally.totals["no"], 1);
        assert_eq!(tally.totals["abstain"], 0);
        assert!(!tally.totals.contains_key("stale"));
        assert_eq!(tally.total, 4);
    }

    #[test]
    fn identifiers_are_restricted() {
        assert_eq!(
            sanitize_identifier(" agm_2026 ", 64, "id").unwrap(),
            "agm_2026"
        );
        assert!(sanitize_identifier("a b", 64, "id").is_err());
        assert!(sanitize_identifier("", 64, "id").is_err());
        assert!(sanitize_identifier(&"a".repeat(65), 64, "id").is_err());
    }
}
