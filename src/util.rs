use chrono::{DateTime, NaiveDate, SubsecRound, Utc};

use crate::repository::RecordError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Trims the input, treating blank strings as absent.
pub fn nonempty(s: Option<&str>) -> Option<String> {
    let trimmed = s?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, RecordError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| RecordError::InvalidInput(format!("`{}` is not a YYYY-MM-DD date", s)))
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
