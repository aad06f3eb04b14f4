//! Recording time resolution.
//!
//! Resolution order: the recorder's metadata timestamp, then a timestamp
//! embedded in the filename, then the current time. Timezone markers are
//! dropped, never converted; every comparison downstream works on naive
//! local time.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// Formats tried for metadata timestamps, ISO-8601 variants first
const METADATA_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

static TIMEZONE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2}:\d{2}(?::\d{2})?(?:\.\d+)?)\s*(?:[Zz]|UTC|[+-]\d{2}(?::?\d{2})?)$")
        .expect("timezone suffix regex is valid")
});

/// `2024-01-15T14-30-22`, `2024-01-15_14-30-22`, `20240115_143022` / `20240115T143022`
static FILENAME_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})T(\d{2})-(\d{2})-(\d{2})")
            .expect("dashed ISO filename regex is valid"),
        Regex::new(r"(\d{4})-(\d{2})-(\d{2})_(\d{2})-(\d{2})-(\d{2})")
            .expect("underscore filename regex is valid"),
        Regex::new(r"(\d{4})(\d{2})(\d{2})[_T](\d{2})(\d{2})(\d{2})")
            .expect("compact filename regex is valid"),
    ]
});

/// Resolve the best-effort recording time for a file.
///
/// Never fails: when neither the metadata nor the filename yields a
/// timestamp, `now` is returned.
pub fn resolve_recording_time(
    filename: &str,
    metadata_time: Option<&str>,
    now: NaiveDateTime,
) -> NaiveDateTime {
    if let Some(raw) = metadata_time {
        match parse_metadata_time(raw) {
            Some(time) => return time,
            None => debug!(filename, raw, "Failed to parse time from metadata"),
        }
    }

    if let Some(time) = parse_filename_time(filename) {
        return time;
    }

    debug!(filename, "Could not parse recording time, using current time");
    now
}

/// Parse a recorder metadata timestamp, discarding any timezone marker
pub fn parse_metadata_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let naive = TIMEZONE_SUFFIX.replace(trimmed, "$1");

    METADATA_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&naive, format).ok())
}

/// Extract a timestamp embedded in a recording filename.
///
/// Patterns are tried in order; a match with an impossible date falls
/// through to the next pattern.
pub fn parse_filename_time(filename: &str) -> Option<NaiveDateTime> {
    FILENAME_PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(filename)?;
        let field = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();

        let year = i32::try_from(field(1)?).ok()?;
        NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?
            .and_hms_opt(field(4)?, field(5)?, field(6)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_metadata_iso_with_timezone_is_stripped() {
        let expected = at(2024, 1, 15, 14, 30, 22);
        assert_eq!(parse_metadata_time("2024-01-15T14:30:22Z"), Some(expected));
        assert_eq!(
            parse_metadata_time("2024-01-15T14:30:22+00:00"),
            Some(expected)
        );
        // Offset is discarded, not converted
        assert_eq!(
            parse_metadata_time("2024-01-15T14:30:22-05:00"),
            Some(expected)
        );
        assert_eq!(
            parse_metadata_time("2024-01-15T14:30:22.123Z"),
            Some(expected + chrono::Duration::milliseconds(123))
        );
    }

    #[test]
    fn test_metadata_space_separated() {
        assert_eq!(
            parse_metadata_time("2024-01-15 14:30:22"),
            Some(at(2024, 1, 15, 14, 30, 22))
        );
    }

    #[test]
    fn test_metadata_without_time_component_rejected() {
        assert_eq!(parse_metadata_time("2024-01-15"), None);
        assert_eq!(parse_metadata_time("yesterday"), None);
    }

    #[test]
    fn test_filename_patterns() {
        let expected = at(2024, 1, 15, 14, 30, 22);
        assert_eq!(parse_filename_time("2024-01-15T14-30-22.mp4"), Some(expected));
        assert_eq!(parse_filename_time("2024-01-15_14-30-22.mkv"), Some(expected));
        assert_eq!(parse_filename_time("cam1_20240115_143022.avi"), Some(expected));
        assert_eq!(parse_filename_time("20240115T143022.mp4"), Some(expected));
        assert_eq!(parse_filename_time("clip.mp4"), None);
    }

    #[test]
    fn test_invalid_date_falls_through() {
        // Month 13 in the first pattern, valid compact stamp later on
        assert_eq!(
            parse_filename_time("2024-13-15T14-30-22_20240115_143022.mp4"),
            Some(at(2024, 1, 15, 14, 30, 22))
        );
    }

    #[test]
    fn test_resolution_order() {
        let now = at(2030, 6, 1, 0, 0, 0);

        // Metadata beats filename
        assert_eq!(
            resolve_recording_time("2024-01-15T14-30-22.mp4", Some("2024-02-01 08:00:00"), now),
            at(2024, 2, 1, 8, 0, 0)
        );

        // Unparseable metadata degrades to the filename
        assert_eq!(
            resolve_recording_time("2024-01-15T14-30-22.mp4", Some("garbage"), now),
            at(2024, 1, 15, 14, 30, 22)
        );

        // Nothing parseable degrades to now
        assert_eq!(resolve_recording_time("clip.mp4", None, now), now);
    }
}
