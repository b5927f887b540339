use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, TimeZone};

/// Parses an LSF history timestamp, e.g. `Wed Aug  6 14:03:25`.
///
/// LSF omits the year; the current local year is assumed. The leading
/// weekday is redundant given month and day, so it is not interpreted.
pub fn parse_lsf_datetime(text: &str) -> anyhow::Result<NaiveDateTime> {
    parse_lsf_datetime_with_year(text, Local::now().year())
}

fn parse_lsf_datetime_with_year(text: &str, year: i32) -> anyhow::Result<NaiveDateTime> {
    let text = text.trim();
    let rest = text
        .split_once(' ')
        .map(|(_, rest)| rest.trim_start())
        .unwrap_or(text);
    let dated = format!("{rest} {year}");
    Ok(NaiveDateTime::parse_from_str(&dated, "%b %e %H:%M:%S %Y")?)
}

/// Converts a naive local datetime into epoch seconds.
pub fn local_datetime_to_epoch(datetime: NaiveDateTime) -> i64 {
    match Local.from_local_datetime(&datetime).earliest() {
        Some(local) => local.timestamp(),
        None => datetime.and_utc().timestamp(),
    }
}

/// Formats a duration as `HH:MM:SS` for the runtime report.
pub fn format_hms(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lsf_timestamp() {
        let date = parse_lsf_datetime_with_year("Mon Sep  5 10:01:22", 2022).unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "05.09.2022 10:01:22"
        );
    }

    #[test]
    fn parse_lsf_timestamp_double_digit_day() {
        let date = parse_lsf_datetime_with_year("Wed Aug 17 23:59:01", 2022).unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "17.08.2022 23:59:01"
        );
    }

    #[test]
    fn reject_garbage_timestamp() {
        assert!(parse_lsf_datetime_with_year("yesterday-ish", 2022).is_err());
    }

    #[test]
    fn format_hms_values() {
        assert_eq!(format_hms(&Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms(&Duration::from_secs(1)), "00:00:01");
        assert_eq!(format_hms(&Duration::from_secs(61)), "00:01:01");
        assert_eq!(format_hms(&Duration::from_secs(3661)), "01:01:01");
    }
}
