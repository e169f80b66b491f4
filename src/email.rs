use std::collections::HashSet;

use thiserror::Error;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_SUBJECT_LEN: usize = 256;
pub const MAX_MESSAGE_LEN: usize = 50_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmailError {
    #[error("At least one recipient is required")]
    NoRecipients,
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),
    #[error("Subject must not be empty")]
    MissingSubject,
    #[error("Subject exceeds {MAX_SUBJECT_LEN} characters")]
    SubjectTooLong,
    #[error("Message must not be empty")]
    MissingMessage,
    #[error("Message exceeds {MAX_MESSAGE_LEN} characters")]
    MessageTooLong,
    #[error("Daily email limit of {limit} recipients reached ({remaining} remaining today)")]
    DailyLimitExceeded { limit: u32, remaining: u32 },
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Pragmatic shape check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_valid_email(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_EMAIL_LEN {
        return false;
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Normalizes, validates every address, and removes duplicates keeping first-seen order.
/// One bad address rejects the whole list.
pub fn collect_recipients<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, EmailError> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut recipients = Vec::with_capacity(raw.len());
    for entry in raw {
        let address = normalize_email(entry.as_ref());
        if !is_valid_email(&address) {
            return Err(EmailError::InvalidAddress(entry.as_ref().trim().to_string()));
        }
        if seen.insert(address.clone()) {
            recipients.push(address);
        }
    }
    if recipients.is_empty() {
        return Err(EmailError::NoRecipients);
    }
    Ok(recipients)
}

pub fn validate_content(subject: &str, message: &str) -> Result<(), EmailError> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(EmailError::MissingSubject);
    }
    if subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(EmailError::SubjectTooLong);
    }
    let message = message.trim();
    if message.is_empty() {
        return Err(EmailError::MissingMessage);
    }
    if message.chars().count() > MAX_MESSAGE_LEN {
        return Err(EmailError::MessageTooLong);
    }
    Ok(())
}

pub fn check_daily_quota(sent_today: u32, requested: usize, limit: u32) -> Result<(), EmailError> {
    let remaining = limit.saturating_sub(sent_today);
    if requested > remaining as usize {
        return Err(EmailError::DailyLimitExceeded { limit, remaining });
    }
    Ok(())
}

pub fn batches(recipients: &[String], batch_size: usize) -> impl Iterator<Item = &[String]> {
    assert!(batch_size > 0, "Batch size must be positive");
    recipients.chunks(batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(
            normalize_email("  USER@JAMES-SQUARE.COM  "),
            "user@james-square.com"
        );
    }

    #[test]
    fn address_shapes() {
        assert!(is_valid_email("user@james-square.com"));
        assert!(is_valid_email("first.last+tag@mail.example.co.uk"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("two@@example.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@localhost"));
        assert!(!is_valid_email("user@exa mple.com"));
        assert!(!is_valid_email("user@.example.com"));
        assert!(!is_valid_email("user@example..com"));
        assert!(!is_valid_email("user@-example.com"));
    }

    #[test]
    fn invalid_address_rejects_whole_list() {
        let raw = ["a@example.com", "not-an-address", "b@example.com"];
        assert_eq!(
            collect_recipients(&raw),
            Err(EmailError::InvalidAddress("not-an-address".to_string()))
        );
    }

    #[test]
    fn duplicates_are_removed_case_insensitively() {
        let raw = ["A@example.com", "a@example.com ", "b@example.com"];
        assert_eq!(
            collect_recipients(&raw).unwrap(),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
    }

    #[test]
    fn empty_recipient_list_is_rejected() {
        let raw: [&str; 0] = [];
        assert_eq!(collect_recipients(&raw), Err(EmailError::NoRecipients));
    }

    #[test]
    fn sixty_more_after_fifty_exceeds_daily_limit() {
        assert_eq!(
            check_daily_quota(50, 60, 100),
            Err(EmailError::DailyLimitExceeded {
                limit: 100,
                remaining: 50
            })
        );
        assert!(check_daily_quota(50, 50, 100).is_ok());
        assert!(check_daily_quota(120, 1, 100).is_err());
    }

    #[test]
    fn batches_cap_at_size() {
        let recipients: Vec<String> = (0..120).map(|i| format!("r{i}@example.com")).collect();
        let sizes: Vec<usize> = batches(&recipients, 50).map(|batch| batch.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[test]
    fn content_validation() {
        assert!(validate_content("Lift outage", "The lift is out today.").is_ok());
        assert_eq!(validate_content("  ", "body"), Err(EmailError::MissingSubject));
        assert_eq!(validate_content("s", " "), Err(EmailError::MissingMessage));
        assert_eq!(
            validate_content(&"s".repeat(MAX_SUBJECT_LEN + 1), "body"),
            Err(EmailError::SubjectTooLong)
        );
    }
}
