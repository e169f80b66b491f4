//! Monthly booking rollup, stored per month and mailed to the admins.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{info, warn};

use crate::entities::{booking, usage_summary};
use crate::mailer::{EmailTransport, OutboundEmail};

/// `YYYYMM` of the UTC calendar month containing `at`.
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y%m").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthRange {
    pub key: String,
    pub start: NaiveDate,
    /// First day of the following month, exclusive.
    pub end: NaiveDate,
}

/// The full calendar month before the one containing `now` (UTC).
pub fn previous_month(now: DateTime<Utc>) -> Result<MonthRange> {
    let end = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .ok_or_else(|| anyhow!("Invalid month start for {now}"))?;
    let (year, month) = if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    };
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| anyhow!("Invalid previous month {year}-{month}"))?;
    Ok(MonthRange {
        key: month_key(start.and_time(NaiveTime::MIN).and_utc()),
        start,
        end,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSummary {
    pub month_key: String,
    pub total_bookings: i64,
    pub distinct_users: i64,
    pub by_facility: BTreeMap<String, i64>,
}

pub fn summarize(month_key: &str, bookings: &[booking::Model]) -> UsageSummary {
    let mut by_facility: BTreeMap<String, i64> = BTreeMap::new();
    let mut users = BTreeSet::new();
    for booking in bookings {
        *by_facility.entry(booking.facility.clone()).or_default() += 1;
        users.insert(booking.user_email.as_str());
    }
    UsageSummary {
        month_key: month_key.to_string(),
        total_bookings: bookings.len() as i64,
        distinct_users: users.len() as i64,
        by_facility,
    }
}

pub fn compose_summary(summary: &UsageSummary, recipients: &[String]) -> OutboundEmail {
    let mut text = format!(
        "Facility usage for {}\n\nTotal bookings: {}\nDistinct residents: {}\n\n",
        summary.month_key, summary.total_bookings, summary.distinct_users
    );
    if summary.by_facility.is_empty() {
        text.push_str("No bookings were made.\n");
    }
    for (facility, count) in &summary.by_facility {
        text.push_str(&format!("  {facility}: {count}\n"));
    }
    OutboundEmail {
        to: recipients.to_vec(),
        bcc: Vec::new(),
        subject: format!("Monthly usage summary {}", summary.month_key),
        text,
        reply_to: None,
    }
}

/// Re-running for the same month overwrites the stored row.
pub async fn run_usage_summary(
    database: &DatabaseConnection,
    mailer: &dyn EmailTransport,
    admin_recipients: &[String],
    now: DateTime<Utc>,
) -> Result<UsageSummary> {
    let range = previous_month(now)?;
    let bookings = booking::Entity::find()
        .filter(booking::Column::Date.gte(range.start))
        .filter(booking::Column::Date.lt(range.end))
        .all(database)
        .await
        .with_context(|| format!("Failed to load bookings for {}", range.key))?;

    let summary = summarize(&range.key, &bookings);
    let by_facility = serde_json::to_value(&summary.by_facility)
        .context("Failed to encode facility breakdown")?;

    let row = usage_summary::ActiveModel {
        month_key: Set(summary.month_key.clone()),
        total_bookings: Set(summary.total_bookings),
        distinct_users: Set(summary.distinct_users),
        by_facility: Set(by_facility),
        generated_at: Set(Utc::now().fixed_offset()),
    };
    usage_summary::Entity::insert(row)
        .on_conflict(
            OnConflict::column(usage_summary::Column::MonthKey)
                .update_columns([
                    usage_summary::Column::TotalBookings,
                    usage_summary::Column::DistinctUsers,
                    usage_summary::Column::ByFacility,
                    usage_summary::Column::GeneratedAt,
                ])
                .to_owned(),
        )
        .exec(database)
        .await
        .with_context(|| format!("Failed to store usage summary {}", range.key))?;

    if admin_recipients.is_empty() {
        info!(month_key = %summary.month_key, "No admin recipients configured for usage summary");
        return Ok(summary);
    }
    if let Err(err) = mailer
        .send(&compose_summary(&summary, admin_recipients))
        .await
    {
        warn!(month_key = %summary.month_key, "Usage summary email failed: {err}");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn booking(email: &str, facility: &str) -> booking::Model {
        booking::Model {
            id: 1,
            user_email: email.to_string(),
            facility: facility.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            time: "09:00".to_string(),
            created_at: Utc::now().fixed_offset(),
        }
    }

    #[test]
    fn month_key_is_utc_and_zero_padded() {
        let mid_january = Utc.with_ymd_and_hms(2026, 1, 24, 12, 0, 0).unwrap();
        assert_eq!(month_key(mid_january), "202601");
        let new_years_eve = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(month_key(new_years_eve), "202512");
    }

    #[test]
    fn previous_month_wraps_the_year() {
        let range = previous_month(Utc.with_ymd_and_hms(2026, 1, 1, 6, 0, 0).unwrap()).unwrap();
        assert_eq!(range.key, "202512");
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());

        let range = previous_month(Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap()).unwrap();
        assert_eq!(range.key, "202602");
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
    }

    #[test]
    fn summary_counts_facilities_and_distinct_users() {
        let bookings = vec![
            booking("a@example.com", "Gym"),
            booking("a@example.com", "Gym"),
            booking("b@example.com", "Pool"),
        ];
        let summary = summarize("202601", &bookings);
        assert_eq!(summary.total_bookings, 3);
        assert_eq!(summary.distinct_users, 2);
        assert_eq!(summary.by_facility["Gym"], 2);
        assert_eq!(summary.by_facility["Pool"], 1);
    }

    #[test]
    fn summary_email_lists_facilities() {
        let summary = summarize("202601", &[booking("a@example.com", "Gym")]);
        let email = compose_summary(&summary, &["admin@james-square.com".to_string()]);
        assert_eq!(email.subject, "Monthly usage summary 202601");
        assert!(email.text.contains("  Gym: 1"));

        let empty = summarize("202602", &[]);
        assert!(compose_summary(&empty, &[]).text.contains("No bookings were made."));
    }
}
