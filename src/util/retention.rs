use std::fs;
use std::io;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use derive_more::{Display, Error};

use crate::snapshot::SnapshotAddress;
use crate::util::remove::remove_snapshot;

/// Default age (in days or hours) up to which snapshots are kept.
pub const DEFAULT_REMOVAL_THRESHOLD: u32 = 31;

/// Default offset up to which old snapshots are searched for removal.
pub const DEFAULT_REMOVAL_SEARCH_THRESHOLD: u32 = 100;

/// Configure retention of snapshots.
///
/// Ages are counted in the [Granularity](crate::snapshot::Granularity) of the
/// [SnapshotAddress] the policy is applied with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Snapshots older than this are removed.
    ///
    /// `0` disables the removal of snapshots.
    pub threshold: u32,

    /// Oldest offset looked at for removal.
    ///
    /// Snapshots beyond this offset are never found and therefore kept.
    pub search_horizon: u32,

    /// Oldest offset looked at for a snapshot to hardlink against.
    ///
    /// Defaults to [`threshold`](Self::threshold) if [None], `0` disables hardlinking.
    pub link_search_window: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_REMOVAL_THRESHOLD,
            search_horizon: DEFAULT_REMOVAL_SEARCH_THRESHOLD,
            link_search_window: None,
        }
    }
}

impl RetentionPolicy {
    /// Returns if old snapshots are removed at all.
    pub fn prunes(&self) -> bool {
        self.threshold > 0
    }

    /// Offsets of snapshots to be removed.
    pub fn removal_offsets(&self) -> RangeInclusive<u32> {
        self.threshold.saturating_add(1)..=self.search_horizon
    }

    /// Offsets searched for a hardlink source, nearest first.
    pub fn link_offsets(&self) -> RangeInclusive<u32> {
        1..=self.link_search_window.unwrap_or(self.threshold)
    }
}

/// Removing an old snapshot failed.
#[derive(Debug, Display, Error)]
#[display("Removing old backup \"{}\" failed: {source}", path.display())]
pub struct SweepError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Removes all snapshots older than [`threshold`](RetentionPolicy::threshold).
///
/// Every offset in [`RetentionPolicy::removal_offsets`] is probed. Missing snapshots are
/// skipped and so are paths that aren't directories, symbolic links included. The first snapshot that can't be
/// removed aborts the sweep.
pub fn sweep(
    address: &SnapshotAddress,
    anchor: NaiveDateTime,
    policy: &RetentionPolicy,
) -> Result<(), SweepError> {
    if !policy.prunes() {
        return Ok(());
    }
    if policy.search_horizon <= policy.threshold {
        log::warn!(
            target: "retention",
            "Removal search threshold ({}) doesn't exceed the removal threshold ({}), no backups will be removed",
            policy.search_horizon,
            policy.threshold,
        );
        return Ok(());
    }

    for offset in policy.removal_offsets() {
        let Some(path) = address.path(anchor, offset) else {
            break;
        };

        let file_type = match fs::symlink_metadata(&path) {
            Ok(meta) => meta.file_type(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "retention", "\"{}\" does not exist.", path.display());
                continue;
            }
            Err(source) => return Err(SweepError { path, source }),
        };
        if file_type.is_symlink() {
            log::warn!(target: "retention", "\"{}\" is a symbolic link. Ignoring.", path.display());
            continue;
        }
        if !file_type.is_dir() {
            log::warn!(target: "retention", "\"{}\" is not a directory. Ignoring.", path.display());
            continue;
        }

        log::info!(target: "retention", "Removing old backup \"{}\"", path.display());
        remove_snapshot(&path).map_err(|source| SweepError {
            path: path.clone(),
            source,
        })?;
        log::debug!(target: "retention", "Finished removing \"{}\"", path.display());
    }

    Ok(())
}

/// Finds the snapshot the next one will be hardlinked against.
///
/// Returns the nearest existing snapshot directory within [`RetentionPolicy::link_offsets`],
/// [None] if there is none and a full backup is required.
pub fn resolve_link_dest(
    address: &SnapshotAddress,
    anchor: NaiveDateTime,
    policy: &RetentionPolicy,
) -> Option<PathBuf> {
    policy
        .link_offsets()
        .map_while(|offset| address.path(anchor, offset))
        .find(|path| path.is_dir())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::snapshot::{Granularity, DEFAULT_DIR_FORMAT};

    fn anchor() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap()
    }

    fn policy(threshold: u32, search_horizon: u32) -> RetentionPolicy {
        RetentionPolicy {
            threshold,
            search_horizon,
            link_search_window: None,
        }
    }

    fn setup(offsets: &[u32]) -> (TempDir, SnapshotAddress) {
        let tmp = TempDir::new().unwrap();
        let address =
            SnapshotAddress::new(tmp.path(), DEFAULT_DIR_FORMAT, "host", Granularity::Daily)
                .unwrap();
        for &offset in offsets {
            let path = address.path(anchor(), offset).unwrap();
            fs::create_dir_all(path.join("etc")).unwrap();
            fs::write(path.join("etc/hostname"), "host").unwrap();
        }
        (tmp, address)
    }

    fn existing(address: &SnapshotAddress, range: RangeInclusive<u32>) -> Vec<u32> {
        range
            .filter(|&offset| address.path(anchor(), offset).unwrap().exists())
            .collect()
    }

    #[test]
    fn sweep_removes_beyond_threshold() {
        let (_tmp, address) = setup(&[3, 6, 7, 9]);

        sweep(&address, anchor(), &policy(5, 10)).unwrap();

        assert_eq!(existing(&address, 0..=20), vec![3]);
    }

    #[test]
    fn sweep_keeps_beyond_search_horizon() {
        let (_tmp, address) = setup(&[4, 8, 12]);

        sweep(&address, anchor(), &policy(5, 10)).unwrap();

        assert_eq!(existing(&address, 0..=20), vec![4, 12]);
    }

    #[test]
    fn sweep_skips_stray_files() {
        let (_tmp, address) = setup(&[7]);
        let stray = address.path(anchor(), 8).unwrap();
        fs::write(&stray, "not a snapshot").unwrap();

        sweep(&address, anchor(), &policy(5, 10)).unwrap();

        assert!(stray.is_file());
        assert_eq!(existing(&address, 0..=7), Vec::<u32>::new());
    }

    #[test]
    fn sweep_never_follows_symlinks() {
        let (_tmp, address) = setup(&[]);
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("data"), "precious").unwrap();
        let link = address.path(anchor(), 8).unwrap();
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        sweep(&address, anchor(), &policy(5, 10)).unwrap();

        assert!(outside.path().join("data").is_file());
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn zero_threshold_keeps_everything() {
        let (_tmp, address) = setup(&[1, 50, 99]);

        sweep(&address, anchor(), &policy(0, 100)).unwrap();

        assert_eq!(existing(&address, 0..=100), vec![1, 50, 99]);
    }

    #[test]
    fn resolve_picks_nearest() {
        let (_tmp, address) = setup(&[2, 4]);

        let link_dest = resolve_link_dest(&address, anchor(), &policy(5, 10));

        assert_eq!(link_dest, address.path(anchor(), 2));
    }

    #[test]
    fn resolve_ignores_todays_and_old_snapshots() {
        let (_tmp, address) = setup(&[0, 6]);

        assert_eq!(resolve_link_dest(&address, anchor(), &policy(5, 10)), None);
    }

    #[test]
    fn resolve_honors_link_search_window() {
        let (_tmp, address) = setup(&[3]);
        let mut policy = policy(5, 10);

        policy.link_search_window = Some(2);
        assert_eq!(resolve_link_dest(&address, anchor(), &policy), None);

        policy.link_search_window = Some(0);
        assert_eq!(resolve_link_dest(&address, anchor(), &policy), None);

        policy.link_search_window = Some(3);
        assert_eq!(
            resolve_link_dest(&address, anchor(), &policy),
            address.path(anchor(), 3)
        );
    }

    #[test]
    fn resolve_skips_stray_files() {
        let (_tmp, address) = setup(&[4]);
        fs::write(address.path(anchor(), 1).unwrap(), "").unwrap();

        assert_eq!(
            resolve_link_dest(&address, anchor(), &policy(5, 10)),
            address.path(anchor(), 4)
        );
    }
}
