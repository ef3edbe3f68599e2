//! Revision properties and the commit timestamp.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::time::{SystemTime, UNIX_EPOCH};

use fsvn_error::Result;
use fsvn_types::RevisionNumber;
use fsvn_types::encoding::{read_hash, write_hash};

use crate::fs::FileSystem;
use crate::io;

/// The commit timestamp property.
pub const PROP_REVISION_DATE: &str = "svn:date";
/// The commit log message property.
pub const PROP_REVISION_LOG: &str = "svn:log";
/// The commit author property.
pub const PROP_REVISION_AUTHOR: &str = "svn:author";

/// Transaction marker: verify the base revision is still youngest on commit.
pub const PROP_TXN_CHECK_OOD: &str = "svn:check-ood";
/// Transaction marker: verify path locks on commit.
pub const PROP_TXN_CHECK_LOCKS: &str = "svn:check-locks";
/// Transaction marker: the client supplied its own `svn:date`.
pub const PROP_TXN_CLIENT_DATE: &str = "svn:client-date";

/// A property list.
pub type PropList = BTreeMap<String, Vec<u8>>;

/// Read the properties of a committed revision.
pub fn read_revprops(fs: &FileSystem, rev: RevisionNumber) -> Result<PropList> {
    let file = std::fs::File::open(fs.layout().revprops_file(rev))?;
    read_hash(&mut BufReader::new(file))
}

/// Serialize a property list for a revprops or txn-props file.
pub fn serialize_props(props: &PropList) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_hash(&mut buf, props)?;
    Ok(buf)
}

/// Write the properties of `rev` via write-temp-then-rename.
pub fn write_revprops(fs: &FileSystem, rev: RevisionNumber, props: &PropList) -> Result<()> {
    io::write_atomic(&fs.layout().revprops_file(rev), &serialize_props(props)?)
}

/// Format the current wall-clock time the way `svn:date` expects:
/// `YYYY-MM-DDThh:mm:ss.uuuuuuZ`.
#[must_use]
pub fn format_date_now() -> String {
    format_date(SystemTime::now())
}

/// Format a timestamp as an `svn:date` value.
#[must_use]
pub fn format_date(time: SystemTime) -> String {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let micros = since_epoch.subsec_micros();

    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem / 60) % 60, rem % 60);
    let (year, month, day) = civil_from_days(days as i64);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micros:06}Z")
}

/// Convert days since 1970-01-01 to a (year, month, day) civil date.
/// Standard era-based algorithm over 400-year cycles.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let days = days + 719_468;
    let era = days.div_euclid(146_097);
    let doe = days.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64, micros: u32) -> SystemTime {
        UNIX_EPOCH + Duration::new(secs, micros * 1000)
    }

    #[test]
    fn epoch_formats_correctly() {
        assert_eq!(format_date(at(0, 0)), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn known_timestamps() {
        // 2004-02-29 is a leap day.
        assert_eq!(format_date(at(1_078_012_800, 0)), "2004-02-29T00:00:00.000000Z");
        assert_eq!(
            format_date(at(1_700_000_000, 123_456)),
            "2023-11-14T22:13:20.123456Z"
        );
    }

    #[test]
    fn date_now_is_parseable_shape() {
        let date = format_date_now();
        assert_eq!(date.len(), 27);
        assert!(date.ends_with('Z'));
        assert_eq!(&date[4..5], "-");
        assert_eq!(&date[10..11], "T");
    }
}
