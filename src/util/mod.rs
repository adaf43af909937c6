//! Building blocks shared by [`Backup`](crate::backup::Backup).

pub mod elapsed;
pub mod remove;
pub mod retention;
