use chrono::{NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

pub const MAX_FACILITY_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookingError {
    #[error("A facility is required")]
    MissingFacility,
    #[error("Facility exceeds {MAX_FACILITY_LEN} characters")]
    FacilityTooLong,
    #[error("Time must be HH:MM")]
    InvalidTime,
    #[error("Cannot book a date in the past")]
    PastDate,
}

/// Local calendar date in the portal's timezone.
pub fn local_today(timezone: Tz) -> NaiveDate {
    Utc::now().with_timezone(&timezone).date_naive()
}

/// Canonical facility key: lowercase with runs of whitespace collapsed, so
/// `"Gym"` and `" gym "` name the same slot.
pub fn validate_facility(raw: &str) -> Result<String, BookingError> {
    let facility = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if facility.is_empty() {
        return Err(BookingError::MissingFacility);
    }
    if facility.chars().count() > MAX_FACILITY_LEN {
        return Err(BookingError::FacilityTooLong);
    }
    Ok(facility)
}

/// Accepts `H:MM` or `HH:MM` and returns the zero-padded `HH:MM` form.
pub fn slot_time(raw: &str) -> Result<String, BookingError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map(|time| time.format("%H:%M").to_string())
        .map_err(|_| BookingError::InvalidTime)
}

pub fn check_bookable(date: NaiveDate, today: NaiveDate) -> Result<(), BookingError> {
    if date < today {
        return Err(BookingError::PastDate);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_times_are_zero_padded() {
        assert_eq!(slot_time("7:30").unwrap(), "07:30");
        assert_eq!(slot_time(" 18:00 ").unwrap(), "18:00");
        assert_eq!(slot_time("24:00"), Err(BookingError::InvalidTime));
        assert_eq!(slot_time("noon"), Err(BookingError::InvalidTime));
        assert_eq!(slot_time("12:60"), Err(BookingError::InvalidTime));
    }

    #[test]
    fn facility_must_be_named() {
        assert_eq!(validate_facility("  Gym ").unwrap(), "gym");
        assert_eq!(validate_facility("   "), Err(BookingError::MissingFacility));
        assert_eq!(
            validate_facility(&"x".repeat(MAX_FACILITY_LEN + 1)),
            Err(BookingError::FacilityTooLong)
        );
    }

    #[test]
    fn facility_names_share_one_slot_key() {
        let keys: Vec<String> = ["Gym", "gym", " GYM ", "Squash  Court", "squash court"]
            .iter()
            .map(|raw| validate_facility(raw).unwrap())
            .collect();
        assert_eq!(keys, ["gym", "gym", "gym", "squash court", "squash court"]);
    }

    #[test]
    fn past_dates_are_not_bookable() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert!(check_bookable(today, today).is_ok());
        assert!(check_bookable(today.succ_opt().unwrap(), today).is_ok());
        assert_eq!(
            check_bookable(today.pred_opt().unwrap(), today),
            Err(BookingError::PastDate)
        );
    }

    #[test]
    fn london_today_is_a_real_date() {
        let today = local_today(chrono_tz::Europe::London);
        let utc_today = Utc::now().date_naive();
        assert!((today - utc_today).num_days().abs() <= 1);
    }
}
