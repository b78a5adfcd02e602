use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::host::DEFAULT_LISTEN;
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "shell-bridge",
    about = "Drive a remote shell over a JSON-over-WebSocket terminal bridge",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "SHELL_BRIDGE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "SHELL_BRIDGE_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open an interactive terminal session against a shell host
    Connect(ConnectArgs),
    /// Run the reference shell host
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[arg(
        long,
        value_name = "ORIGIN",
        help = "App origin to derive the endpoint from [default: $SHELL_BRIDGE_ORIGIN]"
    )]
    pub origin: Option<String>,

    #[arg(
        long,
        value_name = "URL",
        conflicts_with = "origin",
        help = "Connect to this WebSocket URL as-is"
    )]
    pub url: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Inject lines from a file (or - for stdin) the way dictated text is delivered"
    )]
    pub inject: Option<PathBuf>,

    #[arg(long, requires = "inject", help = "Press enter after every injected line")]
    pub submit: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "SHELL_BRIDGE_LISTEN",
        default_value = DEFAULT_LISTEN,
        help = "Address to accept terminal connections on"
    )]
    pub listen: SocketAddr,

    /// Command to run for each connection (default: $SHELL)
    #[arg(trailing_var_arg = true, value_name = "CMD")]
    pub cmd: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn connect_accepts_url_and_inject() {
        let cli = Cli::try_parse_from([
            "shell-bridge",
            "connect",
            "--url",
            "ws://10.0.0.5:3001/terminal",
            "--inject",
            "notes.txt",
            "--submit",
        ])
        .expect("parse");
        let Command::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        assert_eq!(args.url.as_deref(), Some("ws://10.0.0.5:3001/terminal"));
        assert_eq!(args.inject, Some(PathBuf::from("notes.txt")));
        assert!(args.submit);
    }

    #[test_timeout::timeout]
    fn origin_and_url_conflict() {
        let result = Cli::try_parse_from([
            "shell-bridge",
            "connect",
            "--origin",
            "http://localhost:3000",
            "--url",
            "ws://localhost:3000/terminal",
        ]);
        assert!(result.is_err());
    }

    #[test_timeout::timeout]
    fn submit_requires_inject() {
        assert!(Cli::try_parse_from(["shell-bridge", "connect", "--submit"]).is_err());
    }

    #[test_timeout::timeout]
    fn serve_takes_a_trailing_command() {
        let cli = Cli::try_parse_from([
            "shell-bridge",
            "serve",
            "--listen",
            "0.0.0.0:4000",
            "--",
            "bash",
            "--norc",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.listen.port(), 4000);
        assert_eq!(args.cmd, vec!["bash", "--norc"]);
    }

    #[test_timeout::timeout]
    fn log_flags_are_global() {
        let cli = Cli::try_parse_from([
            "shell-bridge",
            "connect",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/bridge.log",
        ])
        .expect("parse");
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/bridge.log")));
    }
}
