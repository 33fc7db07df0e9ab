use std::{ffi::OsStr, fmt, io, num::NonZeroI32, process};

use log::debug;

pub struct Command(process::Command);

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self(process::Command::new(program))
    }

    pub fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a OsStr>,
    {
        self.0.args(args);
        self
    }

    /// Forwards the standard output of the child to our standard error. Used for commands whose
    /// progress the user should see while our own standard output stays reserved for results.
    pub fn stdout_to_stderr(mut self) -> Self {
        self.0.stdout(io::stderr());
        self
    }

    fn error(&self, kind: ErrorKind, stderr: &[u8]) -> Error {
        Error {
            program: self.0.get_program().to_string_lossy().into_owned(),
            command: format!("{:?}", self.0),
            kind,
            stderr: String::from_utf8_lossy(stderr).trim().to_owned(),
        }
    }

    pub fn try_status(mut self) -> Result<ExitStatus, Error> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("running `{command:?}`...", command = &self.0);
        }

        match self.0.status() {
            Ok(status) => Ok(ExitStatus {
                command: self,
                status,
            }),
            Err(error) => Err(self.error(error.into(), &[])),
        }
    }

    pub fn status(self) -> Result<(), Error> {
        self.try_status().and_then(ExitStatus::require_success)
    }

    pub fn try_output(mut self) -> Result<Output, Error> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("capturing `{command:?}`...", command = &self.0);
        }

        match self.0.output() {
            Ok(output) => Ok(Output {
                command: self,
                output,
            }),
            Err(error) => Err(self.error(error.into(), &[])),
        }
    }

    pub fn output(self) -> Result<Output, Error> {
        self.try_output().and_then(Output::require_success)
    }

    /// Like [`Command::output`] but writes `input` to the standard input of the child. Secrets are
    /// passed this way so they never show up in the argument list.
    pub fn output_with_input(mut self, input: &[u8]) -> Result<Output, Error> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("capturing `{command:?}` with input...", command = &self.0);
        }

        let mut child = match self
            .0
            .stdin(process::Stdio::piped())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => return Err(self.error(error.into(), &[])),
        };

        let written = std::thread::scope(|scope| {
            let stdin = child.stdin.take();
            let writer = scope.spawn(move || -> io::Result<()> {
                use std::io::Write;
                if let Some(mut stdin) = stdin {
                    stdin.write_all(input)?;
                }
                Ok(())
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload));
            written.and(output)
        });

        match written {
            Ok(output) => Output {
                command: self,
                output,
            }
            .require_success(),
            Err(error) => Err(self.error(error.into(), &[])),
        }
    }
}

#[derive(Debug)]
pub struct ExitStatus {
    command: Command,
    status: process::ExitStatus,
}

impl ExitStatus {
    pub fn require_success(self) -> Result<(), Error> {
        let ExitStatus { command, status } = self;
        if status.success() {
            Ok(())
        } else {
            Err(command.error(
                ErrorKind::NonZeroExitStatus(status.code().and_then(NonZeroI32::new)),
                &[],
            ))
        }
    }
}

#[derive(Debug)]
pub struct Output {
    pub command: Command,
    pub output: process::Output,
}

impl Output {
    pub fn require_success(self) -> Result<Output, Error> {
        let Output { command, output } = self;
        if output.status.success() {
            Ok(Output { command, output })
        } else {
            Err(command.error(
                ErrorKind::NonZeroExitStatus(output.status.code().and_then(NonZeroI32::new)),
                &output.stderr,
            ))
        }
    }

    /// Returns standard output decoded as UTF-8 with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> Result<String, std::str::Utf8Error> {
        Ok(std::str::from_utf8(&self.output.stdout)?.trim().to_owned())
    }
}

impl std::ops::Deref for Output {
    type Target = process::Output;

    fn deref(&self) -> &Self::Target {
        &self.output
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Io(io::ErrorKind),
    NonZeroExitStatus(Option<NonZeroI32>),
}

impl From<io::Error> for ErrorKind {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            other => ErrorKind::Io(other),
        }
    }
}

/// A failed invocation. Only owned strings are kept so the error can cross threads.
#[derive(Debug)]
pub struct Error {
    pub program: String,
    pub command: String,
    pub kind: ErrorKind,
    /// Captured standard error, empty when the output was not captured.
    pub stderr: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to run `{command}`: ", command = self.command)?;
        let program = &self.program;
        match self.kind {
            ErrorKind::NotFound => {
                write!(f, "the `{program}` command is required but not available on your system, please install it")
            }
            ErrorKind::PermissionDenied => {
                write!(f, "the `{program}` command is available but does not have the right permissions, please make sure the binary is executable")
            }
            ErrorKind::Io(kind) => write!(f, "{kind}"),
            ErrorKind::NonZeroExitStatus(code) => {
                if let Some(code) = code {
                    write!(f, "exited with non-zero exit code `{code}`")?;
                } else {
                    write!(f, "did not run successfully")?;
                }
                if !self.stderr.is_empty() {
                    write!(f, "\n{stderr}", stderr = self.stderr)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a new [`Command`] and supplies the provided arguments, if any, while calling
/// [`std::convert::AsRef::as_ref`] on each.
macro_rules! command {
    ($program:expr, $($arg:expr),* $(,)?) => {
        $crate::process::args!($crate::process::Command::new($program), $($arg,)*)
    };
}

/// Calls [`Command::args`] on the provided [`Command`] while calling [`std::convert::AsRef::as_ref`]
/// on each argument.
macro_rules! args {
    ($program:expr, $($arg:expr),+ $(,)?) => {
        $program.args([
            $(::std::convert::AsRef::<::std::ffi::OsStr>::as_ref(&$arg),)*
        ])
    }
}

pub(crate) use args;
pub(crate) use command;
