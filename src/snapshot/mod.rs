//! Addressing of snapshot directories.
//!
//! A snapshot is nothing more than a directory below the base directory whose
//! name is derived from a point in time using a naming template such as
//! `{hostname}-%Y%m%d`. Whether a snapshot exists is decided by probing that
//! path, there is no other bookkeeping.

use std::fmt::Write;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDateTime, TimeDelta};
use derive_more::{Display, Error};
use regex::Regex;

/// Template used for daily snapshots if the user doesn't supply one.
pub const DEFAULT_DIR_FORMAT: &str = "{hostname}-%Y%m%d";

/// Template used for hourly snapshots if the user doesn't supply one.
pub const DEFAULT_DIR_FORMAT_HOURLY: &str = "{hostname}-%Y%m%d-%H";

const HOSTNAME_PLACEHOLDER: &str = "{hostname}";

const FALLBACK_HOSTNAME: &str = "localhost";

// %H, %I, %k, %l with an optional padding modifier
static HOUR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[-_0]?[HIkl]").expect("hour token regex is valid"));

/// Unit in which offsets from the anchor time are counted.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq)]
pub enum Granularity {
    /// One snapshot per day.
    #[default]
    #[display("daily")]
    Daily,
    /// One snapshot per hour.
    #[display("hourly")]
    Hourly,
}

impl Granularity {
    fn span(self, offset: u32) -> TimeDelta {
        match self {
            Self::Daily => TimeDelta::days(offset.into()),
            Self::Hourly => TimeDelta::hours(offset.into()),
        }
    }
}

/// The naming template contains date/time tokens that can't be formatted.
#[derive(Debug, Display, Error)]
#[display("Directory format is invalid: {_0}")]
pub struct InvalidDirFormat(#[error(ignore)] String);

/// Derives the directory of the snapshot taken `offset` days (or hours) before an anchor.
///
/// The derivation is pure: identical inputs always produce the identical path.
/// The sweeper and the link resolver share one [SnapshotAddress] so both agree on names.
#[derive(Clone, Debug)]
pub struct SnapshotAddress {
    base_dir: PathBuf,
    // hostname already substituted
    template: String,
    granularity: Granularity,
}

impl SnapshotAddress {
    /// Create a new [SnapshotAddress].
    ///
    /// The `{hostname}` placeholder of `dir_format` is replaced by `hostname` once,
    /// the remaining `strftime` tokens are validated eagerly.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        dir_format: &str,
        hostname: &str,
        granularity: Granularity,
    ) -> Result<Self, InvalidDirFormat> {
        // a hostname must never be interpreted as a date token
        let template = dir_format.replace(HOSTNAME_PLACEHOLDER, &hostname.replace('%', "%%"));

        if StrftimeItems::new(&template).any(|item| matches!(item, Item::Error)) {
            return Err(InvalidDirFormat(dir_format.to_string()));
        }
        let probe = NaiveDateTime::default();
        if write!(String::new(), "{}", probe.format(&template)).is_err() {
            return Err(InvalidDirFormat(dir_format.to_string()));
        }

        Ok(Self {
            base_dir: base_dir.into(),
            template,
            granularity,
        })
    }

    /// Path of the snapshot `offset` units before `anchor`.
    ///
    /// Returns [None] only if the offset reaches beyond the calendar range chrono can represent.
    pub fn path(&self, anchor: NaiveDateTime, offset: u32) -> Option<PathBuf> {
        let moment = anchor.checked_sub_signed(self.granularity.span(offset))?;

        let mut name = String::new();
        write!(name, "{}", moment.format(&self.template)).ok()?;

        Some(self.base_dir.join(name))
    }
}

/// Returns if the template contains a token for the hour of the day.
pub fn has_hour_token(dir_format: &str) -> bool {
    HOUR_TOKEN.is_match(dir_format)
}

/// Picks the naming template actually used for `granularity`.
///
/// Hourly snapshots using the built-in daily template silently switch to
/// [DEFAULT_DIR_FORMAT_HOURLY]. A custom template lacking an hour token is kept,
/// but consecutive hourly runs will then write into the same directory.
pub fn resolve_dir_format(dir_format: &str, granularity: Granularity) -> &str {
    if granularity != Granularity::Hourly {
        return dir_format;
    }

    if dir_format == DEFAULT_DIR_FORMAT {
        log::debug!(target: "snapshot", "Automatically switch to hourly dir format \"{DEFAULT_DIR_FORMAT_HOURLY}\"");
        DEFAULT_DIR_FORMAT_HOURLY
    } else {
        if !has_hour_token(dir_format) {
            log::warn!(target: "snapshot", "Dir format \"{dir_format}\" does not contain an hour token while hourly backups are requested");
        }
        dir_format
    }
}

/// Name of this host as substituted for `{hostname}`.
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!(target: "snapshot", "Reading the hostname failed, using \"{FALLBACK_HOSTNAME}\": {e}");
            FALLBACK_HOSTNAME.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::NaiveDate;

    use super::*;

    fn anchor() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap()
    }

    #[test]
    fn daily_offsets_count_days() {
        let addr = SnapshotAddress::new("/backup", DEFAULT_DIR_FORMAT, "host", Granularity::Daily)
            .unwrap();

        assert_eq!(
            addr.path(anchor(), 0).unwrap(),
            PathBuf::from("/backup/host-20240301")
        );
        // leap year
        assert_eq!(
            addr.path(anchor(), 1).unwrap(),
            PathBuf::from("/backup/host-20240229")
        );
        assert_eq!(
            addr.path(anchor(), 366).unwrap(),
            PathBuf::from("/backup/host-20230301")
        );
    }

    #[test]
    fn hourly_offsets_count_hours() {
        let addr = SnapshotAddress::new(
            "/backup",
            DEFAULT_DIR_FORMAT_HOURLY,
            "host",
            Granularity::Hourly,
        )
        .unwrap();

        assert_eq!(
            addr.path(anchor(), 15).unwrap(),
            PathBuf::from("/backup/host-20240229-23")
        );
    }

    #[test]
    fn address_is_deterministic_and_injective() {
        let addr = SnapshotAddress::new("/backup", DEFAULT_DIR_FORMAT, "host", Granularity::Daily)
            .unwrap();
        let again = SnapshotAddress::new("/backup", DEFAULT_DIR_FORMAT, "host", Granularity::Daily)
            .unwrap();

        let mut seen = HashSet::new();
        for offset in 0..1000 {
            let path = addr.path(anchor(), offset).unwrap();
            assert_eq!(Some(&path), again.path(anchor(), offset).as_ref());
            assert!(seen.insert(path), "offset {offset} collides");
        }
    }

    #[test]
    fn percent_in_hostname_is_literal() {
        let addr =
            SnapshotAddress::new("/backup", DEFAULT_DIR_FORMAT, "odd%Yhost", Granularity::Daily)
                .unwrap();

        assert_eq!(
            addr.path(anchor(), 0).unwrap(),
            PathBuf::from("/backup/odd%Yhost-20240301")
        );
    }

    #[test]
    fn invalid_template_is_rejected() {
        assert!(SnapshotAddress::new("/backup", "%Q-%Y", "host", Granularity::Daily).is_err());
        // needs an offset a naive date time doesn't have
        assert!(SnapshotAddress::new("/backup", "%Y%z", "host", Granularity::Daily).is_err());
    }

    #[test]
    fn hourly_switches_default_template() {
        assert_eq!(
            resolve_dir_format(DEFAULT_DIR_FORMAT, Granularity::Hourly),
            DEFAULT_DIR_FORMAT_HOURLY
        );
        assert_eq!(
            resolve_dir_format(DEFAULT_DIR_FORMAT, Granularity::Daily),
            DEFAULT_DIR_FORMAT
        );
    }

    #[test]
    fn hourly_keeps_custom_template_without_hour() {
        assert_eq!(resolve_dir_format("snap-%F", Granularity::Hourly), "snap-%F");
        assert!(!has_hour_token("snap-%F"));
        assert!(has_hour_token("snap-%F-%H"));
        assert!(has_hour_token("snap-%F-%-I%p"));
    }
}
