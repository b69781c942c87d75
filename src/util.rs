use std::backtrace::Backtrace;
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::status::Custom;

pub(crate) fn status_sqlx_error(err: sqlx::Error) -> Custom<String> {
    error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("SQLx error: {}", err))
}
// Short date-time used in flash messages and schedule labels.
// Wall clock is UTC everywhere.
pub(crate) fn dtstr(dt: &DateTime<Utc>) -> String {
    dt.format("%F %H:%M").to_string()
}

// Template helper input, start_time fields serialize as RFC 3339 text.
pub(crate) fn dtstr_iso(iso_date_str: Option<&str>) -> String {
    let Some(s) = iso_date_str else {
        return "---".to_string()
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        dtstr(&dt.with_timezone(&Utc))
    } else {
        s.to_string()
    }
}

pub(crate) fn durstr(minutes: i64) -> String {
    if minutes >= 60 && minutes % 60 == 0 {
        format!("{} h", minutes / 60)
    } else if minutes > 60 {
        format!("{} h {:0>2} min", minutes / 60, minutes % 60)
    } else {
        format!("{minutes} min")
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use super::*;

    #[test]
    fn test_dtstr() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 5, 14, 30, 0).unwrap();
        assert_eq!(dtstr(&dt), "2025-03-05 14:30");
    }

    #[test]
    fn test_dtstr_iso() {
        assert_eq!(dtstr_iso(None), "---");
        assert_eq!(dtstr_iso(Some("2025-03-05T14:30:00+00:00")), "2025-03-05 14:30");
        assert_eq!(dtstr_iso(Some("2025-03-05T16:30:00+02:00")), "2025-03-05 14:30");
        assert_eq!(dtstr_iso(Some("not a date")), "not a date");
    }

    #[test]
    fn test_durstr() {
        assert_eq!(durstr(45), "45 min");
        assert_eq!(durstr(60), "1 h");
        assert_eq!(durstr(90), "1 h 30 min");
        assert_eq!(durstr(120), "2 h");
    }
}
