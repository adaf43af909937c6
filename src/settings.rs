//! Optional TOML file providing defaults for the command line.
//!
//! ```toml
//! base_dir = "/mnt/backup"
//! removal_threshold = 14
//! src_type = "ssh"
//! exclude = ["/home/*/.cache"]
//! ```

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::rsync::TransferMode;

/// Values read from the settings file, each one optional.
///
/// Values given on the command line take precedence.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub base_dir: Option<PathBuf>,
    pub dir_format: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub removal_threshold: Option<u32>,
    pub removal_search_threshold: Option<u32>,
    pub link_search_window: Option<u32>,
    pub src_type: Option<TransferMode>,
    pub rsync_command: Option<String>,
    /// Appended to the built-in include list.
    pub include: Vec<String>,
    /// Appended to the built-in exclude list.
    pub exclude: Vec<String>,
    pub exclude_from: Option<PathBuf>,
}

#[derive(Debug, Display, Error, From)]
/// Errors on loading the [Settings].
pub enum SettingsError {
    /// The settings file can't be read.
    #[display("Reading the settings file failed: {_0}")]
    Read(io::Error),
    /// The settings file isn't valid.
    #[display("Parsing the settings file failed: {_0}")]
    Parse(toml::de::Error),
}

impl Settings {
    /// Loads the [Settings] stored at `path`.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        let settings = toml::from_str(&content)?;
        log::debug!(target: "settings", "Loaded settings from {}", path.display());

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn load_partial_settings() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("do_backup.toml");
        std::fs::write(
            &path,
            r#"
base_dir = "/mnt/backup"
removal_threshold = 14
src_type = "ssh"
exclude = ["/home/*/.cache"]
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();

        assert_eq!(
            settings,
            Settings {
                base_dir: Some("/mnt/backup".into()),
                removal_threshold: Some(14),
                src_type: Some(TransferMode::Ssh),
                exclude: vec!["/home/*/.cache".into()],
                ..Default::default()
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("do_backup.toml");
        std::fs::write(&path, "removal_treshold = 3\n").unwrap();

        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse(_))));
    }

    #[test]
    fn missing_file() {
        let tmp = TempDir::new().unwrap();

        assert!(matches!(
            Settings::load(&tmp.path().join("missing.toml")),
            Err(SettingsError::Read(_))
        ));
    }
}
