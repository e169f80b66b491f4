use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use sea_orm::DatabaseConnection;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::mailer::EmailTransport;

pub mod reminders;
pub mod usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    BookingReminder,
    UsageSummary,
}

impl Job {
    pub fn name(self) -> &'static str {
        match self {
            Job::BookingReminder => "booking-reminder",
            Job::UsageSummary => "usage-summary",
        }
    }
}

/// Next firing strictly after `after`, evaluated in `timezone`.
pub fn next_occurrence(cron: &Cron, after: DateTime<Utc>, timezone: Tz) -> Result<DateTime<Utc>> {
    let local = after.with_timezone(&timezone);
    cron.find_next_occurrence(&local, false)
        .map(|next| next.with_timezone(&Utc))
        .map_err(|err| anyhow!("No next occurrence after {after}: {err}"))
}

/// Earliest upcoming instant across all schedules and every job due then.
pub fn next_due(
    schedules: &[(Job, Cron)],
    after: DateTime<Utc>,
    timezone: Tz,
) -> Result<(DateTime<Utc>, Vec<Job>)> {
    assert!(!schedules.is_empty(), "Scheduler needs at least one job");
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut due = Vec::new();
    for (job, cron) in schedules {
        let next = next_occurrence(cron, after, timezone)?;
        match earliest {
            Some(current) if next > current => continue,
            Some(current) if next == current => due.push(*job),
            _ => {
                earliest = Some(next);
                due = vec![*job];
            }
        }
    }
    let at = earliest.ok_or_else(|| anyhow!("No scheduled job has a next occurrence"))?;
    Ok((at, due))
}

pub struct Scheduler {
    database: DatabaseConnection,
    mailer: Arc<dyn EmailTransport>,
    timezone: Tz,
    schedules: Vec<(Job, Cron)>,
    admin_recipients: Vec<String>,
}

impl Scheduler {
    pub fn new(
        database: DatabaseConnection,
        mailer: Arc<dyn EmailTransport>,
        config: &SchedulerConfig,
        admin_recipients: Vec<String>,
    ) -> Result<Self> {
        let schedules = vec![
            (Job::BookingReminder, config.booking_reminder()?),
            (Job::UsageSummary, config.usage_summary()?),
        ];
        Ok(Self {
            database,
            mailer,
            timezone: config.timezone()?,
            schedules,
            admin_recipients,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(timezone = %self.timezone, "Starting scheduler loop");
        let mut cursor = Utc::now();

        loop {
            let (at, jobs) = next_due(&self.schedules, cursor, self.timezone)?;
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            info!(next_run = %at, jobs = ?jobs.iter().map(|job| job.name()).collect::<Vec<_>>(), "Scheduler waiting");

            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Scheduler shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting scheduler loop");
                            break;
                        }
                    }
                }
                _ = sleep(wait) => {
                    for job in jobs {
                        self.run_job(job, at).await;
                    }
                    cursor = at;
                }
            }
        }

        Ok(())
    }

    /// Failures are logged; the next tick runs regardless.
    async fn run_job(&self, job: Job, scheduled_for: DateTime<Utc>) {
        info!(job = job.name(), %scheduled_for, "Scheduled job started");
        let outcome = match job {
            Job::BookingReminder => reminders::run_booking_reminders(
                &self.database,
                self.mailer.as_ref(),
                self.timezone,
            )
            .await
            .map(|report| {
                info!(
                    job = job.name(),
                    recipients = report.recipients,
                    sent = report.sent,
                    failed = report.failed,
                    "Booking reminders finished"
                );
            }),
            Job::UsageSummary => usage::run_usage_summary(
                &self.database,
                self.mailer.as_ref(),
                &self.admin_recipients,
                scheduled_for,
            )
            .await
            .map(|summary| {
                info!(
                    job = job.name(),
                    month_key = %summary.month_key,
                    total_bookings = summary.total_bookings,
                    distinct_users = summary.distinct_users,
                    "Usage summary finished"
                );
            }),
        };

        if let Err(err) = outcome {
            error!(job = job.name(), "Scheduled job failed: {err:#}");
        }
    }
}
