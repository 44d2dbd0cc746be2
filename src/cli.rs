//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shellrelay::build_info::{HELP_BUILD_METADATA, LONG_VERSION};

/// Remote command execution over SSH and reverse shells, with verified
/// file transfer. Results are printed as JSON.
#[derive(Debug, Parser)]
#[command(
    name = "shellrelay",
    version,
    long_version = LONG_VERSION,
    after_help = HELP_BUILD_METADATA
)]
pub struct Args {
    /// Path to config file (default: ./shellrelay.toml or ~/.config/shellrelay/shellrelay.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Debug logging on stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a local command with timeout and blocking detection.
    Exec {
        command: String,
        /// Seconds before the command is killed.
        #[arg(short = 't', long = "timeout")]
        timeout: Option<u64>,
        /// Print events as they happen (one JSON object per line).
        #[arg(long = "stream")]
        stream: bool,
    },
    /// Open an SSH session and run commands through it.
    Ssh {
        /// `user@host` or `user@host:port`.
        target: String,
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
        /// Private key file.
        #[arg(short = 'i', long = "key")]
        key: Option<PathBuf>,
        /// Environment variable holding the password.
        #[arg(long = "password-env", value_name = "VAR")]
        password_env: Option<String>,
        /// Command to run; repeat for several.
        #[arg(long = "command", value_name = "CMD")]
        commands: Vec<String>,
        /// Per-command timeout in seconds.
        #[arg(short = 't', long = "timeout")]
        timeout: Option<u64>,
    },
    /// Start a reverse-shell listener.
    Listen {
        #[arg(short = 'p', long = "port")]
        port: u16,
        /// netcat, pwncat or custom.
        #[arg(short = 'l', long = "listener")]
        listener: Option<String>,
        /// Local command fired in the background to make the target connect.
        #[arg(long = "trigger", value_name = "CMD")]
        trigger: Option<String>,
        /// Seconds to wait for the target to connect.
        #[arg(short = 'w', long = "wait", default_value_t = 60)]
        wait: u64,
        /// Command to run once connected; repeat for several.
        #[arg(long = "command", value_name = "CMD")]
        commands: Vec<String>,
        #[arg(short = 't', long = "timeout")]
        timeout: Option<u64>,
    },
    /// Print reverse-shell one-liners for a listener address.
    Payload {
        #[arg(long = "ip")]
        ip: String,
        #[arg(short = 'p', long = "port")]
        port: u16,
        /// bash, python, nc, php or all.
        #[arg(short = 'k', long = "kind", default_value = "all")]
        kind: String,
        /// Also print base64-wrapped variants.
        #[arg(long = "base64")]
        base64: bool,
    },
    /// Estimate a channel transfer of the given size.
    Estimate {
        bytes: u64,
        #[arg(short = 'd', long = "direction", default_value = "upload")]
        direction: String,
    },
    /// Copy a local file to a destination path with verification.
    Upload { source: PathBuf, dest: String },
    /// Copy a file to a local destination with verification.
    Download { source: String, dest: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_parses_timeout_and_stream() {
        let args = Args::parse_from(["shellrelay", "exec", "nmap -sV host", "-t", "30", "--stream"]);
        match args.command {
            Command::Exec {
                command,
                timeout,
                stream,
            } => {
                assert_eq!(command, "nmap -sV host");
                assert_eq!(timeout, Some(30));
                assert!(stream);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn ssh_collects_repeated_commands() {
        let args = Args::parse_from([
            "shellrelay",
            "-v",
            "ssh",
            "root@10.0.0.1",
            "--command",
            "id",
            "--command",
            "uname -a",
        ]);
        assert!(args.verbose);
        let Command::Ssh { commands, .. } = args.command else {
            panic!("expected ssh");
        };
        assert_eq!(commands, vec!["id", "uname -a"]);
    }

    #[test]
    fn listen_defaults_wait() {
        let args = Args::parse_from(["shellrelay", "listen", "--port", "4444"]);
        let Command::Listen { port, wait, listener, .. } = args.command else {
            panic!("expected listen");
        };
        assert_eq!((port, wait), (4444, 60));
        assert!(listener.is_none());
    }

    #[test]
    fn config_flag_is_global() {
        let args = Args::parse_from(["shellrelay", "estimate", "1024", "--config", "/x.toml"]);
        assert_eq!(args.config.as_deref(), Some("/x.toml"));
    }
}
