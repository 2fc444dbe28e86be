use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use exif::{In, Tag, Value};

/// Best-effort embedded capture timestamp, checked in EXIF preference
/// order: DateTimeOriginal, then DateTimeDigitized, then DateTime.
/// Anything unreadable (no EXIF segment, truncated file, non-image) is
/// `None`, never an error; the sorter falls back to mtime.
pub async fn read_capture_time(path: &Path) -> Option<DateTime<Utc>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_blocking(&path))
        .await
        .ok()
        .flatten()
}

fn read_blocking(path: &Path) -> Option<DateTime<Utc>> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
        .iter()
        .find_map(|tag| {
            exif.get_field(*tag, In::PRIMARY).and_then(field_datetime)
        })
}

fn field_datetime(field: &exif::Field) -> Option<DateTime<Utc>> {
    let Value::Ascii(ref text) = field.value else {
        return None;
    };
    let raw = std::str::from_utf8(text.first()?).ok()?;
    parse_exif_datetime(raw)
}

/// EXIF timestamps use `YYYY:MM:DD HH:MM:SS` with no zone; they are
/// treated as UTC.
pub fn parse_exif_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_matches(char::from(0)).trim();
    let naive =
        NaiveDateTime::parse_from_str(trimmed, "%Y:%m:%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
