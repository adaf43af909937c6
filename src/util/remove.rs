//! Recursive removal of snapshot directories.
//!
//! Snapshots may contain directories copied without traverse or write permission
//! for their owner (e.g. a `dr--r--r--` folder). Deleting their content fails with
//! [PermissionDenied](io::ErrorKind::PermissionDenied). In this case the failing
//! step is retried once after granting the missing bits on the ancestors of the
//! failing path, but only on directories owned by the effective user.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{access, geteuid, AccessFlags, Uid};

const OWNER_EXECUTE: u32 = 0o100;
const OWNER_WRITE: u32 = 0o200;

/// Recursively removes the directory `path` including its content.
///
/// Symbolic links inside the tree are removed, never followed. A symbolic link as `path`
/// itself is refused with [InvalidInput](io::ErrorKind::InvalidInput).
pub fn remove_snapshot(path: &Path) -> io::Result<()> {
    let euid = geteuid();
    if with_repair(path, euid, || fs::symlink_metadata(path))?
        .file_type()
        .is_symlink()
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("\"{}\" is a symbolic link", path.display()),
        ));
    }
    remove_tree(path, euid)
}

fn remove_tree(path: &Path, euid: Uid) -> io::Result<()> {
    let entries = with_repair(path, euid, || fs::read_dir(path))?;

    for entry in entries {
        let entry = entry?;
        let entry_path = entry.path();

        // may need to stat the entry if the file system doesn't report its type
        let file_type = with_repair(&entry_path, euid, || entry.file_type())?;
        if file_type.is_dir() {
            remove_tree(&entry_path, euid)?;
        } else {
            with_repair(&entry_path, euid, || fs::remove_file(&entry_path))?;
        }
    }

    with_repair(path, euid, || fs::remove_dir(path))
}

/// Runs `op` on `path`, repairing permissions and retrying exactly once on
/// [PermissionDenied](io::ErrorKind::PermissionDenied).
///
/// Other errors are returned untouched.
fn with_repair<T>(
    path: &Path,
    euid: Uid,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    match op() {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            log::debug!(target: "remove", "Permission denied on \"{}\" ({e}). Try fixing the permission.", path.display());

            repair_permissions(path, e, euid)?;
            let res = op()?;

            log::debug!(target: "remove", "Successfully fixed permission problem of \"{}\"", path.display());
            Ok(res)
        }
        res => res,
    }
}

/// Grants the bits needed to delete `path` on its ancestors.
///
/// Walking from the top most ancestor (excluding `/`) down to the parent of `path`,
/// every directory lacking traverse permission gets [OWNER_EXECUTE] added. If such a
/// directory is owned by somebody else than `euid`, nothing more is modified and
/// `denied` (the error that triggered the repair) is returned.
/// The parent of `path` additionally gets [OWNER_WRITE] if it's missing and `euid` owns it.
pub(crate) fn repair_permissions(path: &Path, denied: io::Error, euid: Uid) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Err(denied);
    };

    let mut stack: Vec<PathBuf> = parent
        .ancestors()
        .take_while(|dir| dir.parent().is_some() && !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();

    while let Some(dir) = stack.pop() {
        if access(dir.as_path(), AccessFlags::X_OK).is_ok() {
            continue;
        }
        log::debug!(target: "remove", "\"{}\" is not accessible. Try modifying it.", dir.display());

        let meta = fs::metadata(&dir)?;
        if meta.uid() != euid.as_raw() {
            log::error!(
                target: "remove",
                "Unable to access \"{}\" while the owner ({}) is different from the current user (euid: {euid})",
                dir.display(),
                meta.uid(),
            );
            return Err(denied);
        }
        fs::set_permissions(&dir, Permissions::from_mode(meta.mode() | OWNER_EXECUTE))?;
    }

    let meta = fs::metadata(parent)?;
    if meta.mode() & OWNER_WRITE == 0 {
        if meta.uid() == euid.as_raw() {
            log::debug!(target: "remove", "\"{}\" is not writable. Try modifying it.", parent.display());
            fs::set_permissions(parent, Permissions::from_mode(meta.mode() | OWNER_WRITE))?;
        } else {
            log::debug!(target: "remove", "\"{}\" is not writable and owned by somebody else", parent.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().mode() & 0o777
    }

    fn running_as_root() -> bool {
        geteuid().is_root()
    }

    #[test]
    fn removes_nested_tree() {
        let tmp = TempDir::new().unwrap();
        let snapshot = tmp.path().join("host-20240101");
        fs::create_dir_all(snapshot.join("etc/ssh")).unwrap();
        fs::write(snapshot.join("etc/hostname"), "host").unwrap();
        fs::write(snapshot.join("etc/ssh/sshd_config"), "").unwrap();
        std::os::unix::fs::symlink("/etc", snapshot.join("link")).unwrap();

        remove_snapshot(&snapshot).unwrap();

        assert!(!snapshot.exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn refuses_symlinked_root() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("data"), "content").unwrap();
        let link = tmp.path().join("host-20240101");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = remove_snapshot(&link).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(target.join("data").is_file());
        assert!(fs::symlink_metadata(&link).is_ok());
    }

    #[test]
    fn repairs_non_executable_directory_once() {
        if running_as_root() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let snapshot = tmp.path().join("host-20240101");
        let locked = snapshot.join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("file"), "content").unwrap();
        fs::set_permissions(&locked, Permissions::from_mode(0o600)).unwrap();

        remove_snapshot(&snapshot).unwrap();

        assert!(!snapshot.exists());
    }

    #[test]
    fn repair_grants_write_on_parent() {
        if running_as_root() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let readonly = tmp.path().join("readonly");
        fs::create_dir(&readonly).unwrap();
        fs::write(readonly.join("file"), "content").unwrap();
        fs::set_permissions(&readonly, Permissions::from_mode(0o500)).unwrap();

        remove_snapshot(&readonly).unwrap();

        assert!(!readonly.exists());
    }

    #[test]
    fn foreign_owner_is_not_escalated() {
        if running_as_root() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("file"), "content").unwrap();
        fs::set_permissions(&locked, Permissions::from_mode(0o600)).unwrap();

        let somebody_else = Uid::from_raw(geteuid().as_raw() + 1);
        let denied = fs::remove_file(locked.join("file")).unwrap_err();
        assert_eq!(denied.kind(), io::ErrorKind::PermissionDenied);
        let raw = denied.raw_os_error();

        let err = repair_permissions(&locked.join("file"), denied, somebody_else).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(err.raw_os_error(), raw);
        assert_eq!(mode(&locked), 0o600);

        // let the TempDir clean up
        fs::set_permissions(&locked, Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn other_errors_are_not_repaired() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing");

        let err = remove_snapshot(&missing).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
