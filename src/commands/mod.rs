// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod build;
pub mod debug;
pub mod du;

use std::{
    ffi::OsString,
    fmt,
    io::{self, Write},
};

use {build::BuildArgs, debug::DebugArgs, du::DuArgs};

use {
    clap::{
        error::{ContextKind, ContextValue, ErrorKind},
        CommandFactory, FromArgMatches, Parser, Subcommand,
    },
    log::{debug, warn},
};

use crate::{
    client::{Client, ClientOpt, ConnectionError, RequestError},
    config::GlobalConfig,
};

/// Every way a `buildctl` invocation can fail. Whatever the variant, the process reports the error
/// once and exits with status 1.
#[derive(Debug)]
pub enum Error {
    /// The command line could not be parsed.
    Usage(clap::Error),

    /// The named subcommand does not exist.
    UnknownCommand(String),

    /// The async runtime could not be started.
    Runtime(io::Error),

    /// The daemon could not be reached.
    Connection(ConnectionError),

    /// The subcommand itself failed, on either side of the connection.
    Command(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T = ()> = std::result::Result<T, Error>;

impl Error {
    /// A subcommand failure described only by a message.
    pub fn command(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Error::Command(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(e) => {
                let rendered = e.to_string();
                let first = rendered.lines().next().unwrap_or_default();
                write!(f, "{}", first.strip_prefix("error: ").unwrap_or(first))
            }
            Error::UnknownCommand(name) => write!(f, "unknown command \"{name}\""),
            Error::Runtime(e) => write!(f, "could not start runtime: {e}"),
            Error::Connection(e) => write!(f, "{e}"),
            Error::Command(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Usage(e) => Some(e),
            Error::UnknownCommand(_) => None,
            Error::Runtime(e) => Some(e),
            Error::Connection(e) => Some(e),
            Error::Command(e) => Some(e.as_ref()),
        }
    }
}

impl From<clap::Error> for Error {
    fn from(e: clap::Error) -> Self {
        if e.kind() == ErrorKind::InvalidSubcommand {
            if let Some(ContextValue::String(name)) = e.get(ContextKind::InvalidSubcommand) {
                return Error::UnknownCommand(name.clone());
            }
        }
        Error::Usage(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<RequestError> for Error {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Connection(e) => Error::Connection(e),
            other => Error::Command(Box::new(other)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Command(Box::new(e))
    }
}

#[derive(Parser, Debug)]
#[command(name = "buildctl", version, about = "build utility", long_about = None)]
pub struct Cli {
    /// Enable debug output in logs
    #[arg(long, global = true)]
    pub debug: bool,

    /// buildkitd address
    #[arg(long, global = true, default_value = crate::DEFAULT_ADDRESS)]
    pub addr: String,

    /// buildkitd server name for certificate validation
    #[arg(long, global = true, default_value = "")]
    pub server_name: String,

    /// CA certificate for validation
    #[arg(long, global = true, default_value = "")]
    pub ca_cert: String,

    /// client certificate
    #[arg(long, global = true, default_value = "")]
    pub cert: String,

    /// client key
    #[arg(long, global = true, default_value = "")]
    pub key: String,

    /// Seconds to wait for the daemon connection before giving up (default: wait forever)
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The clap command with `--addr` defaulting to `buildkit_host`, or to `DEFAULT_ADDRESS` when
    /// that is unset or empty.
    pub fn command_with_host(buildkit_host: Option<String>) -> clap::Command {
        let default = crate::default_address(buildkit_host);
        Cli::command().mut_arg("addr", |arg| arg.default_value(default))
    }

    /// Parse `args` the way the `buildctl` binary does, with `buildkit_host` standing in for the
    /// value of `BUILDKIT_HOST`.
    pub fn try_parse_with_host<I, T>(
        args: I,
        buildkit_host: Option<String>,
    ) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut matches = Self::command_with_host(buildkit_host).try_get_matches_from(args)?;
        Self::from_arg_matches_mut(&mut matches)
    }
}

/// The subcommands, in the order they are listed in `--help`.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Disk usage
    Du(DuArgs),
    /// Build
    Build(BuildArgs),
    /// Debug utilities
    Debug(DebugArgs),
}

impl Commands {
    /// The subcommand names, in registration order.
    pub fn names() -> Vec<String> {
        Cli::command()
            .get_subcommands()
            .map(|cmd| cmd.get_name().to_string())
            .collect()
    }

    async fn execute(&self, config: &GlobalConfig) -> Result {
        match self {
            Commands::Du(args) => du::du(config, args).await,
            Commands::Build(args) => build::build(config, args).await,
            Commands::Debug(args) => debug::debug(config, args).await,
        }
    }
}

/// The client options implied by `config`: always block until connected, then the TLS material
/// and the connect deadline if they were asked for.
pub fn client_options(config: &GlobalConfig) -> Vec<ClientOpt> {
    let mut opts = vec![ClientOpt::WithBlock];
    if let Some(creds) = config.credentials() {
        opts.push(ClientOpt::WithCredentials(creds));
    }
    if let Some(timeout) = config.timeout {
        opts.push(ClientOpt::WithTimeout(timeout));
    }
    opts
}

/// Connect to the daemon named by `config`.
///
/// The caller owns the returned client and must not use it if this returns an error.
pub async fn resolve_client(config: &GlobalConfig) -> std::result::Result<Client, ConnectionError> {
    let client = Client::new(&config.address, client_options(config)).await?;
    debug!("using daemon at {}", client.address());
    Ok(client)
}

/// Set the log level. `--debug` overrides anything given in `BUILDCTL_LOG`.
fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().filter_or(crate::LOG_ENV, "warn"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    // A logger is already installed when this runs more than once in a process.
    let _ = builder.try_init();
}

/// Print `err` to `out`: the full structure of the error when `debug` is set, just its message
/// otherwise.
pub fn report(err: &Error, debug: bool, out: &mut dyn Write) {
    let _ = if debug {
        writeln!(out, "error: {err:?}")
    } else {
        writeln!(out, "error: {err}")
    };
}

/// Run one `buildctl` invocation and return the process exit status.
///
/// `buildkit_host` is the value of `BUILDKIT_HOST`, read by the caller before anything is parsed.
/// Errors are written to `stderr`.
pub fn run<I, T>(args: I, buildkit_host: Option<String>, stderr: &mut dyn Write) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let mut command = Cli::command_with_host(buildkit_host);

    let parsed = command
        .try_get_matches_from_mut(args.iter().cloned())
        .and_then(|mut matches| Cli::from_arg_matches_mut(&mut matches));
    let cli = match parsed {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            report(&Error::from(e), debug_requested(&args), stderr);
            return 1;
        }
    };

    let config = GlobalConfig::from(&cli);
    init_logging(config.debug);

    if config.credentials().is_none() && config.has_tls_paths() {
        warn!("--server-name is not set; ignoring --ca-cert, --cert and --key");
    }

    let Some(subcommand) = &cli.command else {
        let _ = command.print_help();
        return 0;
    };

    match execute(subcommand, &config) {
        Ok(()) => 0,
        Err(e) => {
            report(&e, config.debug, stderr);
            1
        }
    }
}

/// Whether `--debug` appears anywhere on a command line that clap refused. Global flags may follow
/// the subcommand, so the whole line is searched, up to a `--` separator.
fn debug_requested(args: &[OsString]) -> bool {
    args.iter()
        .skip(1)
        .take_while(|arg| *arg != "--")
        .any(|arg| arg == "--debug")
}

fn execute(subcommand: &Commands, config: &GlobalConfig) -> Result {
    let rt = tokio::runtime::Runtime::new().map_err(Error::Runtime)?;
    rt.block_on(subcommand.execute(config))
}
