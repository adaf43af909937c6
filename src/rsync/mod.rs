//! Invocation of [rsync](https://rsync.samba.org/) as the copy engine.
//!
//! The [Rsync] builder assembles the command line deterministically from the
//! [TransferMode] and the backup options. While rsync runs, its stdout and stderr
//! are drained by two threads into an [OutputSink]; rsync blocks as soon as one of
//! its pipes is full and nobody reads it.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::thread;

use clap::ValueEnum;
use derive_more::{Display, Error};

/// Exit codes of rsync after which a backup is considered successful.
///
/// - 0: Success
/// - 23: Partial transfer due to error
pub const ACCEPTABLE_EXIT_CODES: [i32; 2] = [0, 23];

/// Default rsync executable.
pub const DEFAULT_RSYNC_COMMAND: &str = "rsync";

/// How the sources are transferred, selecting the base flags passed to rsync.
#[derive(
    Copy,
    Clone,
    ValueEnum,
    Debug,
    Display,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Local copy preserving everything rsync's archive mode, ACLs, xattrs and hardlinks preserve.
    #[default]
    #[display("local")]
    Local,
    /// Copy from or to a remote host. Doesn't rely on archive mode, since the other
    /// side may not support every attribute.
    #[display("ssh")]
    Ssh,
    /// Preserves file contents and times only, ignoring permissions and ownership.
    #[display("rough")]
    Rough,
}

impl TransferMode {
    /// Flags always passed to rsync in this mode.
    pub fn base_flags(self) -> &'static [&'static str] {
        match self {
            Self::Local => &["-iaAHXLu", "--delete", "--no-specials", "--no-devices"],
            Self::Ssh => &["-irtlz", "--delete", "--no-specials", "--no-devices"],
            Self::Rough => &["-irtL", "--no-specials", "--no-devices"],
        }
    }
}

/// Transfer mode is unknown.
#[derive(Debug, Display, Error)]
#[display("Transfer mode is unknown: {_0}")]
pub struct UnknownTransferMode(#[error(ignore)] String);

impl FromStr for TransferMode {
    type Err = UnknownTransferMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "ssh" => Ok(Self::Ssh),
            "rough" => Ok(Self::Rough),
            other => Err(UnknownTransferMode(other.to_string())),
        }
    }
}

#[derive(Debug, Display, Error)]
/// Errors on running rsync.
pub enum RsyncError {
    /// The configured identity file doesn't exist.
    #[display("Identity file \"{}\" does not exist", _0.display())]
    IdentityFileMissing(#[error(ignore)] PathBuf),
    /// The rsync command is empty.
    #[display("No rsync command given")]
    NoCommand,
    /// Starting rsync failed.
    #[display("Starting rsync failed: {_0}")]
    Spawn(io::Error),
    /// Waiting for rsync to exit failed.
    #[display("Waiting for rsync failed: {_0}")]
    Wait(io::Error),
    /// The output of rsync couldn't be captured.
    #[display("The {_0} of rsync is not captured")]
    MissingPipe(#[error(ignore)] Stream),
}

/// Output stream of rsync.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Stream {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

/// Receiver of the lines rsync writes.
///
/// Both streams are drained concurrently, so implementations have to cope with
/// [`line`](Self::line) being called from two threads at once.
pub trait OutputSink: Sync {
    /// Handles a single line without its line terminator.
    fn line(&self, stream: Stream, line: &str);
}

/// Forwards rsync output to the debug log, e.g. `rsync(stderr): ...`.
#[derive(Debug, Clone)]
pub struct LogSink {
    program: String,
}

impl LogSink {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl OutputSink for LogSink {
    fn line(&self, stream: Stream, line: &str) {
        log::debug!(target: "rsync", "{}({stream}): {line}", self.program);
    }
}

/// Drops rsync output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl OutputSink for DiscardSink {
    fn line(&self, _stream: Stream, _line: &str) {}
}

/// Exit code of a finished rsync run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code, `128 + signal` if rsync got killed.
    pub exit_code: i32,
}

impl RunOutcome {
    /// Returns if the exit code is one of [ACCEPTABLE_EXIT_CODES].
    pub fn is_acceptable(&self) -> bool {
        ACCEPTABLE_EXIT_CODES.contains(&self.exit_code)
    }
}

impl From<ExitStatus> for RunOutcome {
    fn from(status: ExitStatus) -> Self {
        let exit_code = status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1);

        Self { exit_code }
    }
}

/// A single rsync invocation copying `sources` into `destination`.
#[derive(Debug, Clone)]
pub struct Rsync {
    command: Vec<String>,
    mode: TransferMode,
    verbose: bool,
    link_dest: Option<PathBuf>,
    include: Vec<String>,
    exclude: Vec<String>,
    exclude_from: Option<PathBuf>,
    identity_file: Option<PathBuf>,
    sources: Vec<String>,
    destination: PathBuf,
}

impl Rsync {
    /// Create a new [Rsync] invocation.
    ///
    /// `command` is split at whitespace, so it may carry leading arguments like `nice -n 19 rsync`.
    pub fn new(
        command: &str,
        mode: TransferMode,
        sources: impl IntoIterator<Item = impl Into<String>>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.split_whitespace().map(String::from).collect(),
            mode,
            verbose: false,
            link_dest: None,
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_from: None,
            identity_file: None,
            sources: sources.into_iter().map(Into::into).collect(),
            destination: destination.into(),
        }
    }

    /// Pass `--verbose` to rsync.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Hardlink unchanged files against `link_dest` (`--link-dest`).
    pub fn link_dest(mut self, link_dest: Option<PathBuf>) -> Self {
        self.link_dest = link_dest;
        self
    }

    /// Patterns passed as `--include`, taking precedence over every exclude.
    pub fn include(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Patterns passed as `--exclude`.
    pub fn exclude(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// File listing further exclude patterns (`--exclude-from`).
    pub fn exclude_from(mut self, exclude_from: Option<PathBuf>) -> Self {
        self.exclude_from = exclude_from;
        self
    }

    /// Private key used by ssh.
    pub fn identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    /// Name of the rsync program, used as prefix of its output.
    pub fn program(&self) -> &str {
        self.command
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_RSYNC_COMMAND)
    }

    /// Arguments passed to rsync, leading arguments of the command included.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.command.iter().skip(1).map(OsString::from).collect();

        args.extend(self.mode.base_flags().iter().map(OsString::from));
        if self.verbose {
            args.push("--verbose".into());
        }
        if let Some(link_dest) = &self.link_dest {
            let mut arg = OsString::from("--link-dest=");
            arg.push(link_dest);
            args.push(arg);
        }
        // rsync applies the first matching rule, so includes go first
        for pattern in &self.include {
            args.push("--include".into());
            args.push(pattern.into());
        }
        for pattern in &self.exclude {
            args.push("--exclude".into());
            args.push(pattern.into());
        }
        if let Some(exclude_from) = &self.exclude_from {
            let mut arg = OsString::from("--exclude-from=");
            arg.push(exclude_from);
            args.push(arg);
        }
        if let Some(identity_file) = &self.identity_file {
            let mut ssh = OsString::from("ssh -i ");
            ssh.push(identity_file);
            args.push("-e".into());
            args.push(ssh);
        }
        args.extend(self.sources.iter().map(OsString::from));
        args.push(self.destination.clone().into_os_string());

        args
    }

    /// The command line for logging purposes.
    pub fn command_line(&self) -> String {
        let args: Vec<_> = self.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        format!("{} {}", self.program(), args.join(" "))
    }

    /// Runs rsync and blocks until it exits.
    ///
    /// Every line rsync writes is passed to `sink`. Both reader threads are joined
    /// before this returns, errors included. Whether the exit code is acceptable is
    /// left to the caller, see [`RunOutcome::is_acceptable`].
    pub fn run(&self, sink: &dyn OutputSink) -> Result<RunOutcome, RsyncError> {
        if self.command.is_empty() {
            return Err(RsyncError::NoCommand);
        }
        if let Some(identity_file) = &self.identity_file {
            if !identity_file.exists() {
                return Err(RsyncError::IdentityFileMissing(identity_file.clone()));
            }
            log::debug!(target: "rsync", "Using identity file \"{}\"", identity_file.display());
        }

        log::debug!(target: "rsync", "Running: {}", self.command_line());
        let mut child = Command::new(self.program())
            .args(self.args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RsyncError::Spawn)?;

        let (stdout, stderr) = match both_pipes(child.stdout.take(), child.stderr.take()) {
            Ok(pipes) => pipes,
            Err(missing) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RsyncError::MissingPipe(missing));
            }
        };

        let status = thread::scope(|scope| {
            scope.spawn(move || drain(stdout, Stream::Stdout, sink));
            scope.spawn(move || drain(stderr, Stream::Stderr, sink));

            let status = child.wait();
            log::debug!(target: "rsync", "Waiting for output readers to finish");
            status
        })
        .map_err(RsyncError::Wait)?;
        log::debug!(target: "rsync", "Output readers finished");

        Ok(RunOutcome::from(status))
    }
}

/// Reads `reader` line by line until EOF, decoding lossily.
/// Both captured pipes of a child, or the [Stream] that wasn't captured.
fn both_pipes<O, E>(stdout: Option<O>, stderr: Option<E>) -> Result<(O, E), Stream> {
    match (stdout, stderr) {
        (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
        (None, _) => Err(Stream::Stdout),
        (Some(_), None) => Err(Stream::Stderr),
    }
}

fn drain(reader: impl Read, stream: Stream, sink: &dyn OutputSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.line(stream, line.trim_end_matches(['\n', '\r']));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!(target: "rsync", "Reading the {stream} of rsync failed: {e}");
                break;
            }
        }
    }
}
