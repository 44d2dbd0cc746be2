//! CLI entry point for shellrelay.

mod cli;

use clap::Parser;
use serde::Serialize;
use std::time::Duration;

use shellrelay::build_info;
use shellrelay::channel::payload::{generate_payloads, PayloadEncoding, PayloadKind};
use shellrelay::channel::{CommandResponse, SessionStatus, SshTarget};
use shellrelay::config::{load_config_with_diagnostics, Config, ListenerKind};
use shellrelay::error::SessionError;
use shellrelay::exec::{ExecOptions, ExecResponse, Executor, StreamEvent};
use shellrelay::logging;
use shellrelay::registry::Sessions;
use shellrelay::transfer::{estimate_transfer, Direction, LocalTransfer, TransferReport};

const CLI_SSH_SESSION: &str = "cli-ssh";
const CLI_LISTENER_SESSION: &str = "cli-listener";

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    logging::init(args.verbose);
    tracing::debug!("shellrelay {}", build_info::startup_metadata_line());

    let config = match load_config_with_diagnostics(args.config.as_deref()) {
        Ok(loaded) => {
            for note in &loaded.diagnostics.notes {
                tracing::debug!(%note, "config");
            }
            loaded.config
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    match run(args.command, config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(msg) => {
            eprintln!("error: {msg}");
            std::process::exit(2);
        }
    }
}

/// Print one pretty JSON document on stdout.
fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("error: failed to encode output: {e}"),
    }
}

/// Dispatch a subcommand. `Ok(false)` means the operation ran but failed;
/// `Err` is a usage problem.
async fn run(command: cli::Command, config: Config) -> Result<bool, String> {
    match command {
        cli::Command::Exec {
            command,
            timeout,
            stream,
        } => run_exec(&config, &command, timeout.map(Duration::from_secs), stream).await,
        cli::Command::Ssh {
            target,
            port,
            key,
            password_env,
            commands,
            timeout,
        } => {
            let mut target = SshTarget::parse(&target)
                .ok_or_else(|| format!("invalid target `{target}` (expected user@host[:port])"))?;
            if let Some(port) = port {
                target.port = port;
            }
            target.key_file = key;
            if let Some(var) = password_env {
                let password = std::env::var(&var)
                    .map_err(|_| format!("environment variable {var} is not set"))?;
                target.password = Some(password);
            }
            run_ssh(config, target, &commands, timeout.map(Duration::from_secs)).await
        }
        cli::Command::Listen {
            port,
            listener,
            trigger,
            wait,
            commands,
            timeout,
        } => {
            let listener = listener
                .map(|name| name.parse::<ListenerKind>())
                .transpose()?;
            let plan = ListenPlan {
                port,
                listener,
                trigger,
                wait: Duration::from_secs(wait),
                timeout: timeout.map(Duration::from_secs),
            };
            run_listen(config, plan, &commands).await
        }
        cli::Command::Payload {
            ip,
            port,
            kind,
            base64,
        } => {
            let kind: PayloadKind = kind.parse()?;
            let encoding = if base64 {
                PayloadEncoding::Base64
            } else {
                PayloadEncoding::Plain
            };
            emit(&generate_payloads(&ip, port, kind, encoding));
            Ok(true)
        }
        cli::Command::Estimate { bytes, direction } => {
            if bytes == 0 {
                return Err("bytes must be greater than 0".to_string());
            }
            let direction: Direction = direction.parse()?;
            emit(&estimate_transfer(bytes, direction, &config.transfer));
            Ok(true)
        }
        cli::Command::Upload { source, dest } => {
            let report = TransferReport::from(LocalTransfer::new().upload_file(&source, &dest));
            emit(&report);
            Ok(report.success)
        }
        cli::Command::Download { source, dest } => {
            let report = TransferReport::from(LocalTransfer::new().download_file(&source, &dest));
            emit(&report);
            Ok(report.success)
        }
    }
}

async fn run_exec(
    config: &Config,
    command: &str,
    timeout: Option<Duration>,
    stream: bool,
) -> Result<bool, String> {
    let executor = Executor::from_config(config);
    if !stream {
        let options = ExecOptions {
            timeout,
            ..ExecOptions::default()
        };
        let response = ExecResponse::from(executor.execute(command, options).await);
        emit(&response);
        return Ok(response.success);
    }

    let mut events = executor.stream_execution(command, timeout, true);
    let mut success = false;
    while let Some(event) = events.recv().await {
        if let StreamEvent::Result { success: ok, .. } = &event {
            success = *ok;
        }
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("error: failed to encode event: {e}"),
        }
    }
    Ok(success)
}

#[derive(Debug, Serialize)]
struct CommandRecord<'a> {
    command: &'a str,
    #[serde(flatten)]
    response: CommandResponse,
}

#[derive(Debug, Default, Serialize)]
struct SessionRun<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger: Option<String>,
    commands: Vec<CommandRecord<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SessionRun<'_> {
    fn failed(err: impl ToString) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

async fn run_ssh(
    config: Config,
    target: SshTarget,
    commands: &[String],
    timeout: Option<Duration>,
) -> Result<bool, String> {
    let sessions = Sessions::new(config);
    let session = match sessions.start_ssh(CLI_SSH_SESSION, target).await {
        Ok(status) => status,
        Err(err) => {
            emit(&SessionRun::failed(err));
            return Ok(false);
        }
    };

    let mut run = SessionRun {
        success: true,
        session: Some(session),
        ..SessionRun::default()
    };
    for command in commands {
        let response =
            CommandResponse::from(sessions.ssh_command(CLI_SSH_SESSION, command, timeout).await);
        run.success &= response.success;
        run.commands.push(CommandRecord { command, response });
    }
    sessions.stop_all().await;
    emit(&run);
    Ok(run.success)
}

struct ListenPlan {
    port: u16,
    listener: Option<ListenerKind>,
    trigger: Option<String>,
    wait: Duration,
    timeout: Option<Duration>,
}

async fn run_listen(config: Config, plan: ListenPlan, commands: &[String]) -> Result<bool, String> {
    let sessions = Sessions::new(config);
    let session = match sessions
        .start_listener(CLI_LISTENER_SESSION, plan.port, plan.listener)
        .await
    {
        Ok(status) => status,
        Err(err) => {
            emit(&SessionRun::failed(err));
            return Ok(false);
        }
    };

    let mut run = SessionRun {
        session: Some(session),
        ..SessionRun::default()
    };
    let outcome = drive_listener(&sessions, &plan, commands, &mut run).await;
    sessions.stop_all().await;
    match outcome {
        Ok(()) => run.success = run.commands.iter().all(|c| c.response.success),
        Err(err) => {
            run.success = false;
            run.error = Some(err.to_string());
        }
    }
    emit(&run);
    Ok(run.success)
}

async fn drive_listener<'a>(
    sessions: &Sessions,
    plan: &ListenPlan,
    commands: &'a [String],
    run: &mut SessionRun<'a>,
) -> Result<(), SessionError> {
    if let Some(trigger) = &plan.trigger {
        let budget = plan.wait.max(Duration::from_secs(1));
        run.trigger = Some(sessions.trigger(CLI_LISTENER_SESSION, trigger, budget)?);
    }
    tracing::info!(
        port = plan.port,
        wait_secs = plan.wait.as_secs(),
        "waiting for reverse connection"
    );
    if !sessions
        .wait_for_connection(CLI_LISTENER_SESSION, plan.wait)
        .await?
    {
        return Err(SessionError::ConnectionFailed(format!(
            "no connection on port {} within {}s",
            plan.port,
            plan.wait.as_secs()
        )));
    }
    run.session = sessions.status(CLI_LISTENER_SESSION);
    for command in commands {
        let response = CommandResponse::from(
            sessions
                .shell_command(CLI_LISTENER_SESSION, command, plan.timeout)
                .await,
        );
        run.commands.push(CommandRecord { command, response });
    }
    Ok(())
}
