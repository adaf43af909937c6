use std::path::PathBuf;

use clap::{ArgAction, Parser};
use log::LevelFilter;

use crate::backup::{BackupConfig, DEFAULT_BASE_DIR};
use crate::rsync::{TransferMode, DEFAULT_RSYNC_COMMAND};
use crate::settings::Settings;
use crate::snapshot::{Granularity, DEFAULT_DIR_FORMAT};
use crate::util::retention::{DEFAULT_REMOVAL_SEARCH_THRESHOLD, DEFAULT_REMOVAL_THRESHOLD};

#[derive(Parser, Debug)]
#[command(version, about = "Do backup to (another) local disk.", long_about = None)]
pub struct Cli {
    /// Paths to back up.
    #[arg(value_name = "SRC", required = true)]
    pub sources: Vec<String>,

    /// Base directory for destination under which a directory for each backup will be prepared.
    /// [default: /mnt/disk0/backup]
    #[arg(long, short = 'b', env = "DO_BACKUP_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Directory format for each backup. `{hostname}` is replaced by the name of this host.
    /// [default: {hostname}-%Y%m%d]
    #[arg(long)]
    pub dir_format: Option<String>,

    /// Let ssh use this private key.
    #[arg(long, short = 'i')]
    pub identity_file: Option<PathBuf>,

    /// Do not use --link-dest even when a preceding backup directory exists, consuming much more disk possibly.
    #[arg(long, short = 'f')]
    pub force_full_backup: bool,

    /// Specifies until when old backups are kept. If set to 31 for example, backups
    /// 31 days ago will be kept but backups before that date will be removed.
    /// 0 means no removal. [default: 31]
    #[arg(long, short = 'r')]
    pub removal_threshold: Option<u32>,

    /// Old backups are looked for until this many days (or hours) ago. [default: 100]
    #[arg(long)]
    pub removal_search_threshold: Option<u32>,

    /// Backups to hardlink against are looked for until this many days (or hours) ago.
    /// 0 disables hardlinking. [default: the removal threshold]
    #[arg(long)]
    pub link_search_window: Option<u32>,

    /// Relevant operations will be applied on an hourly basis.
    #[arg(long)]
    pub hourly: bool,

    /// Files (dirs) that should be excluded in addition to the default exclusion list.
    #[arg(long, short = 'e', action = ArgAction::Append)]
    pub exclude: Vec<String>,

    /// A file specifying files (dirs) to be ignored.
    #[arg(long)]
    pub exclude_from: Option<PathBuf>,

    /// Files (dirs) that should be included as backup. Note --include is prioritized over --exclude.
    #[arg(long, action = ArgAction::Append)]
    pub include: Vec<String>,

    /// Log level like debug, info or warn.
    #[arg(long, default_value = "info")]
    pub log: LevelFilter,

    /// Shortcut for --log debug.
    #[arg(long, short = 'd', conflicts_with = "warn")]
    pub debug: bool,

    /// Shortcut for --log warn.
    #[arg(long, short = 'w')]
    pub warn: bool,

    /// Include rsync output in the debug log.
    #[arg(long, short = 'l')]
    pub log_rsync_output: bool,

    /// Set --verbose option to rsync.
    #[arg(long)]
    pub verbose_rsync: bool,

    /// How the sources are transferred. [default: local]
    #[arg(long, short = 't', value_enum)]
    pub src_type: Option<TransferMode>,

    /// Exact command to use as rsync. [default: rsync]
    #[arg(long, short = 'c')]
    pub rsync_command: Option<String>,

    /// TOML file providing defaults for the options above.
    #[arg(long, env = "DO_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Level of the console log.
    pub fn log_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::Debug
        } else if self.warn {
            LevelFilter::Warn
        } else {
            self.log
        }
    }

    /// Merges the command line over `settings` and the built-in defaults.
    pub fn into_config(self, settings: Settings) -> BackupConfig {
        let mut config = BackupConfig::new(self.sources);

        config.base_dir = self
            .base_dir
            .or(settings.base_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        config.dir_format = self
            .dir_format
            .or(settings.dir_format)
            .unwrap_or_else(|| DEFAULT_DIR_FORMAT.to_string());
        config.granularity = if self.hourly {
            Granularity::Hourly
        } else {
            Granularity::Daily
        };

        config.retention.threshold = self
            .removal_threshold
            .or(settings.removal_threshold)
            .unwrap_or(DEFAULT_REMOVAL_THRESHOLD);
        config.retention.search_horizon = self
            .removal_search_threshold
            .or(settings.removal_search_threshold)
            .unwrap_or(DEFAULT_REMOVAL_SEARCH_THRESHOLD);
        config.retention.link_search_window =
            self.link_search_window.or(settings.link_search_window);
        config.force_full_backup = self.force_full_backup;

        config.transfer_mode = self.src_type.or(settings.src_type).unwrap_or_default();
        config.rsync_command = self
            .rsync_command
            .or(settings.rsync_command)
            .unwrap_or_else(|| DEFAULT_RSYNC_COMMAND.to_string());
        config.identity_file = self.identity_file.or(settings.identity_file);
        config.exclude_from = self.exclude_from.or(settings.exclude_from);

        config.include = settings.include.into_iter().chain(self.include).collect();
        config.exclude = settings.exclude.into_iter().chain(self.exclude).collect();

        config.verbose_rsync = self.verbose_rsync;
        config.log_rsync_output = self.log_rsync_output;

        config
    }
}
