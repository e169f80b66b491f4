//! Daily email to everyone with a booking today, listing their slots.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use tracing::{debug, warn};

use crate::bookings::local_today;
use crate::entities::booking;
use crate::mailer::{EmailTransport, OutboundEmail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub time: String,
    pub facility: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub email: String,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderReport {
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
}

/// One reminder per address, ordered by address, slots ordered by time.
pub fn group_reminders(bookings: Vec<booking::Model>) -> Vec<Reminder> {
    let mut by_user: BTreeMap<String, Vec<Slot>> = BTreeMap::new();
    for booking in bookings {
        by_user.entry(booking.user_email).or_default().push(Slot {
            time: booking.time,
            facility: booking.facility,
        });
    }
    by_user
        .into_iter()
        .map(|(email, mut slots)| {
            slots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.facility.cmp(&b.facility)));
            Reminder { email, slots }
        })
        .collect()
}

pub fn compose(reminder: &Reminder, date: NaiveDate) -> OutboundEmail {
    let day = date.format("%A %-d %B %Y");
    let mut text = format!("Hello,\n\nThis is a reminder of your bookings for {day}:\n\n");
    for slot in &reminder.slots {
        text.push_str(&format!("  {}  {}\n", slot.time, slot.facility));
    }
    text.push_str("\nIf you no longer need a slot, please cancel it in the portal.\n");

    OutboundEmail {
        to: vec![reminder.email.clone()],
        bcc: Vec::new(),
        subject: format!("Your bookings for {day}"),
        text,
        reply_to: None,
    }
}

/// A failure for one recipient is logged and the rest still go out.
pub async fn send_reminders(
    mailer: &dyn EmailTransport,
    reminders: &[Reminder],
    date: NaiveDate,
) -> ReminderReport {
    let mut report = ReminderReport {
        recipients: reminders.len(),
        ..ReminderReport::default()
    };
    for reminder in reminders {
        match mailer.send(&compose(reminder, date)).await {
            Ok(receipt) => {
                debug!(recipient = %reminder.email, message_id = %receipt.id, "Reminder sent");
                report.sent += 1;
            }
            Err(err) => {
                warn!(recipient = %reminder.email, "Reminder failed: {err}");
                report.failed += 1;
            }
        }
    }
    report
}

pub async fn run_booking_reminders(
    database: &DatabaseConnection,
    mailer: &dyn EmailTransport,
    timezone: Tz,
) -> Result<ReminderReport> {
    let today = local_today(timezone);
    let bookings = booking::Entity::find()
        .filter(booking::Column::Date.eq(today))
        .order_by_asc(booking::Column::UserEmail)
        .all(database)
        .await
        .with_context(|| format!("Failed to load bookings for {today}"))?;

    let reminders = group_reminders(bookings);
    Ok(send_reminders(mailer, &reminders, today).await)
}
