//! Command line and environment configuration
//!
//! There are no config files. Precedence is CLI > environment > defaults,
//! which clap resolves for us.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;

/// CLI arguments for runpty
#[derive(Parser, Debug, Clone)]
#[command(name = "runpty")]
#[command(version)]
#[command(about = "Run a program in the slave end of a pseudo terminal", long_about = None)]
pub struct CliArgs {
    /// Write diagnostic logs to this file instead of stderr
    #[arg(long, value_name = "FILE", env = "RUNPTY_DEBUG_LOG")]
    pub debug_log: Option<PathBuf>,

    /// Don't copy the invoking terminal's window size onto the pty
    #[arg(long)]
    pub no_winsize: bool,

    /// Program to run, followed by its arguments
    #[arg(
        value_name = "PROGRAM",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

/// Resolved runner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Side-channel log file
    pub debug_log: Option<PathBuf>,
    /// Copy stdin's window size onto the pty when stdin is a terminal
    pub inherit_window_size: bool,
}

/// Outcome of parsing the command line
#[derive(Debug)]
pub enum ParseOutcome {
    Run(Config),
    /// No program given: exit quietly with status 2
    MissingProgram,
    /// Help, version or a usage error; clap prints and exits
    Clap(clap::Error),
}

impl Config {
    pub fn from_args<I, T>(args: I) -> ParseOutcome
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match CliArgs::try_parse_from(args) {
            Ok(cli) => match Config::try_from(cli) {
                Ok(config) => ParseOutcome::Run(config),
                Err(()) => ParseOutcome::MissingProgram,
            },
            Err(e) if e.kind() == ErrorKind::MissingRequiredArgument => {
                ParseOutcome::MissingProgram
            }
            Err(e) => ParseOutcome::Clap(e),
        }
    }

    pub fn from_env() -> ParseOutcome {
        Self::from_args(std::env::args_os())
    }
}

impl TryFrom<CliArgs> for Config {
    type Error = ();

    fn try_from(cli: CliArgs) -> Result<Self, ()> {
        let mut command = cli.command.into_iter();
        let program = command.next().ok_or(())?;
        Ok(Config {
            program,
            args: command.collect(),
            debug_log: cli.debug_log,
            inherit_window_size: !cli.no_winsize,
        })
    }
}
