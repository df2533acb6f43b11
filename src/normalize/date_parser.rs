use chrono::{NaiveDate, NaiveDateTime};

/// Formats tried, in order, when a date column declares none.
pub const DEFAULT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

/// Parse `s` with the first matching format; datetime formats keep only the date.
pub fn parse_date(s: &str, formats: &[String]) -> Option<NaiveDate> {
    let s = s.trim().trim_matches('"');
    if formats.is_empty() {
        DEFAULT_DATE_FORMATS.iter().find_map(|f| parse_one(s, f))
    } else {
        formats.iter().find_map(|f| parse_one(s, f))
    }
}

fn parse_one(s: &str, format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, format).ok().map(|dt| dt.date()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn default_formats_cover_registry_and_listing_exports() {
        assert_eq!(parse_date("2021-03-07", &[]), Some(ymd(2021, 3, 7)));
        assert_eq!(parse_date("07.03.2021", &[]), Some(ymd(2021, 3, 7)));
        assert_eq!(parse_date("\"2024/12/14\"", &[]), Some(ymd(2024, 12, 14)));
        assert_eq!(parse_date("2024-12-22 00:05:00", &[]), Some(ymd(2024, 12, 22)));
        assert_eq!(parse_date("yesterday", &[]), None);
    }

    #[test]
    fn explicit_formats_replace_defaults() {
        let us = vec!["%m/%d/%Y".to_string()];
        assert_eq!(parse_date("03/07/2021", &us), Some(ymd(2021, 3, 7)));
        assert_eq!(parse_date("2021-03-07", &us), None);
    }
}
