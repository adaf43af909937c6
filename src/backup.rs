//! A complete backup run, see [Backup].

use std::fs;
use std::io;
use std::iter;
use std::path::{Component, Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use derive_more::{Display, Error, From};
use nix::unistd::{access, AccessFlags};

use crate::rsync::{
    DiscardSink, LogSink, OutputSink, Rsync, RsyncError, TransferMode, DEFAULT_RSYNC_COMMAND,
};
use crate::snapshot::{
    self, resolve_dir_format, Granularity, InvalidDirFormat, SnapshotAddress, DEFAULT_DIR_FORMAT,
};
use crate::util::retention::{resolve_link_dest, sweep, RetentionPolicy, SweepError};

/// Base directory below which snapshots are created by default.
pub const DEFAULT_BASE_DIR: &str = "/mnt/disk0/backup";

/// Paths always included.
pub const DEFAULT_INCLUDED: &[&str] = &[];

/// Paths always excluded: pseudo file systems, volatile state and the usual backup locations.
pub const DEFAULT_EXCLUDED: &[&str] = &[
    "/dev",
    "/proc",
    "/sys",
    "/tmp",
    "/mnt",
    "/media",
    "/root",
    "/run",
    "/lost+found",
    "/var/lock",
    "/var/tmp",
    "/var/run",
    "/backup",
];

/// Everything a [Backup] run needs to know.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Paths to back up, local or `host:path` for [TransferMode::Ssh].
    pub sources: Vec<String>,
    /// Directory holding one directory per snapshot.
    pub base_dir: PathBuf,
    /// Naming template of a snapshot directory, see [SnapshotAddress].
    pub dir_format: String,
    pub granularity: Granularity,
    pub retention: RetentionPolicy,
    /// Never hardlink against an older snapshot.
    ///
    /// Takes precedence over [`RetentionPolicy::link_search_window`].
    pub force_full_backup: bool,
    pub transfer_mode: TransferMode,
    pub rsync_command: String,
    /// Included in addition to [DEFAULT_INCLUDED].
    pub include: Vec<String>,
    /// Excluded in addition to [DEFAULT_EXCLUDED].
    pub exclude: Vec<String>,
    pub exclude_from: Option<PathBuf>,
    pub identity_file: Option<PathBuf>,
    /// Pass `--verbose` to rsync.
    pub verbose_rsync: bool,
    /// Forward the output of rsync to the debug log.
    pub log_rsync_output: bool,
}

impl BackupConfig {
    /// Create a new [BackupConfig] with defaults for everything but the `sources`.
    pub fn new(sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            dir_format: DEFAULT_DIR_FORMAT.to_string(),
            granularity: Granularity::default(),
            retention: RetentionPolicy::default(),
            force_full_backup: false,
            transfer_mode: TransferMode::default(),
            rsync_command: DEFAULT_RSYNC_COMMAND.to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_from: None,
            identity_file: None,
            verbose_rsync: false,
            log_rsync_output: false,
        }
    }

    /// [DEFAULT_INCLUDED] followed by the configured includes.
    pub fn included(&self) -> Vec<String> {
        DEFAULT_INCLUDED
            .iter()
            .map(ToString::to_string)
            .chain(self.include.iter().cloned())
            .collect()
    }

    /// [DEFAULT_EXCLUDED] and the base directory, followed by the configured excludes.
    pub fn excluded(&self) -> Vec<String> {
        DEFAULT_EXCLUDED
            .iter()
            .map(ToString::to_string)
            .chain(iter::once(self.base_dir.display().to_string()))
            .chain(self.exclude.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors aborting a [Backup] run.
pub enum BackupError {
    /// The base directory is `/`.
    #[display("Base dir looks like the root directory to me ({})", _0.display())]
    DestinationIsRoot(#[error(ignore)] PathBuf),
    /// The base directory exists but isn't a directory.
    #[display("Path \"{}\" is not a directory", _0.display())]
    DestinationNotDirectory(#[error(ignore)] PathBuf),
    /// The base directory can't be written to.
    #[display("Directory \"{}\" is not writable", _0.display())]
    DestinationNotWritable(#[error(ignore)] PathBuf),
    /// The base directory doesn't exist and can't be created below its parent.
    #[display("Parent dir \"{}\" is not accessible", _0.display())]
    ParentInaccessible(#[error(ignore)] PathBuf),
    /// Creating the base directory failed.
    #[display("Creating the base dir failed: {_0}")]
    CreateDestination(io::Error),
    /// No snapshot directory can be derived for this point in time.
    #[display("No backup directory can be derived for {_0}")]
    Unaddressable(#[error(ignore)] NaiveDateTime),

    /// The naming template is unusable.
    #[from]
    #[display("{_0}")]
    DirFormat(InvalidDirFormat),
    /// Removing old snapshots was aborted.
    #[from]
    #[display("{_0}")]
    Sweep(SweepError),
    /// rsync couldn't be run.
    #[from]
    #[display("{_0}")]
    Rsync(RsyncError),
}

impl BackupError {
    /// Returns if the base directory was rejected before anything got touched.
    ///
    /// These end the run unsuccessfully instead of being raised.
    pub fn rejects_destination(&self) -> bool {
        matches!(
            self,
            Self::DestinationIsRoot(_)
                | Self::DestinationNotDirectory(_)
                | Self::DestinationNotWritable(_)
                | Self::ParentInaccessible(_)
        )
    }
}

/// A backup run: removes old snapshots, then copies the sources into a new one
/// hardlinked against the closest older snapshot.
#[derive(Debug, Clone)]
pub struct Backup {
    config: BackupConfig,
    hostname: String,
}

impl Backup {
    /// Create a new [Backup] naming snapshots after this host.
    pub fn new(config: BackupConfig) -> Self {
        Self::with_hostname(config, snapshot::hostname())
    }

    pub fn with_hostname(config: BackupConfig, hostname: impl Into<String>) -> Self {
        Self {
            config,
            hostname: hostname.into(),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Runs the backup for the current local time.
    ///
    /// Returns `Ok(false)` if the run failed in an expected way, e.g. an unusable
    /// base directory or an unacceptable exit code of rsync.
    pub fn run(&self) -> Result<bool, BackupError> {
        let now = Local::now().naive_local();

        if self.config.log_rsync_output {
            let program = self
                .config
                .rsync_command
                .split_whitespace()
                .next()
                .unwrap_or(DEFAULT_RSYNC_COMMAND);
            self.run_at(now, &LogSink::new(program))
        } else {
            self.run_at(now, &DiscardSink)
        }
    }

    /// Runs the backup as if it was `now`, passing the output of rsync to `sink`.
    pub fn run_at(&self, now: NaiveDateTime, sink: &dyn OutputSink) -> Result<bool, BackupError> {
        let config = &self.config;
        let dir_format = resolve_dir_format(&config.dir_format, config.granularity);
        let address =
            SnapshotAddress::new(&config.base_dir, dir_format, &self.hostname, config.granularity)?;
        let dest_dir = address
            .path(now, 0)
            .ok_or(BackupError::Unaddressable(now))?;

        match self.prepare_base_dir() {
            Err(e) if e.rejects_destination() => {
                log::error!(target: "backup", "{e}");
                return Ok(false);
            }
            res => res?,
        }

        let sources = config
            .sources
            .iter()
            .map(|src| format!("\"{src}\""))
            .collect::<Vec<_>>()
            .join(", ");
        log::debug!(target: "backup", "Backup {sources} to \"{}\"", dest_dir.display());

        if config.retention.prunes() {
            log::debug!(target: "backup", "Remove old backups if exist (threshold: {})", config.retention.threshold);
            sweep(&address, now, &config.retention)?;
        }

        let link_dest = if config.force_full_backup {
            log::debug!(target: "backup", "Force full-backup");
            None
        } else {
            let link_dest = resolve_link_dest(&address, now, &config.retention);
            match &link_dest {
                Some(link_dest) => {
                    log::debug!(target: "backup", "Will hardlink to \"{}\" with --link-dest", link_dest.display())
                }
                None => {
                    log::debug!(target: "backup", "Did not find a precedent backup. Will do full-backup")
                }
            }
            link_dest
        };

        let included = config.included();
        let excluded = config.excluded();
        log::debug!(target: "backup", "Included files: {}", included.join(", "));
        log::debug!(target: "backup", "Excluded files: {}", excluded.join(", "));

        let outcome = Rsync::new(
            &config.rsync_command,
            config.transfer_mode,
            config.sources.iter().cloned(),
            dest_dir,
        )
        .verbose(config.verbose_rsync)
        .link_dest(link_dest)
        .include(included)
        .exclude(excluded)
        .exclude_from(config.exclude_from.clone())
        .identity_file(config.identity_file.clone())
        .run(sink)?;

        // rsync reports a failure as soon as a single file fails, 23 only tells the transfer happened
        if !outcome.is_acceptable() {
            log::error!(target: "backup", "Exit code of rsync is not acceptable (code: {})", outcome.exit_code);
            return Ok(false);
        }
        log::debug!(target: "backup", "rsync exited with code {}", outcome.exit_code);

        Ok(true)
    }

    /// Makes sure the base directory is a writable directory, creating it if necessary.
    fn prepare_base_dir(&self) -> Result<(), BackupError> {
        let base_dir = &self.config.base_dir;

        if is_filesystem_root(base_dir) {
            return Err(BackupError::DestinationIsRoot(base_dir.clone()));
        }

        if base_dir.exists() {
            if !base_dir.is_dir() {
                return Err(BackupError::DestinationNotDirectory(base_dir.clone()));
            }
            if access(base_dir.as_path(), AccessFlags::W_OK).is_err() {
                return Err(BackupError::DestinationNotWritable(base_dir.clone()));
            }
            log::debug!(target: "backup", "Directory \"{}\" exists and is writable", base_dir.display());
        } else {
            log::info!(target: "backup", "Directory \"{}\" does not exist. Creating it.", base_dir.display());

            let parent = base_dir
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            if !parent.is_dir() {
                return Err(BackupError::ParentInaccessible(parent.to_path_buf()));
            }
            fs::create_dir(base_dir).map_err(BackupError::CreateDestination)?;
        }

        Ok(())
    }
}

fn is_filesystem_root(path: &Path) -> bool {
    path.has_root()
        && path.components().all(|c| {
            matches!(
                c,
                Component::RootDir | Component::CurDir | Component::ParentDir
            )
        })
}
