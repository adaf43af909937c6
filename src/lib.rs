//! Library to take periodical snapshots of a set of paths using [rsync][rsync].
//!
//! Every run copies the sources into a dated directory below a base directory.
//! Unchanged files are hardlinked against the closest older snapshot
//! (see [`util::retention::resolve_link_dest`]) and snapshots older than the
//! retention threshold are removed (see [`util::retention::sweep`]).
//! The whole run is driven by [`backup::Backup`].
//!
//! [rsync]: https://rsync.samba.org/

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod rsync;
pub mod settings;
pub mod snapshot;
pub mod util;
