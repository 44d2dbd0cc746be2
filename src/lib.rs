//! shellrelay: interactive command execution on remote hosts over SSH and
//! reverse shells, with checksum-verified file transfer.
//!
//! Remote channels run an interactive shell on a pseudo-terminal and frame
//! every command between random start and end markers, so output can be
//! recovered from the noisy terminal transcript. Local commands go through
//! an [`exec::Executor`] that applies per-tool timeouts and kills commands
//! that stop producing output.
//!
//! ```no_run
//! use shellrelay::config::load_config;
//! use shellrelay::registry::Sessions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sessions = Sessions::new(load_config(None)?);
//! sessions.start_listener("target-1", 4444, None).await?;
//! if sessions.wait_for_connection("target-1", std::time::Duration::from_secs(60)).await? {
//!     let output = sessions.shell_command("target-1", "id", None).await?;
//!     println!("{}", output.output);
//! }
//! sessions.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod build_info;
pub mod channel;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod registry;
#[cfg(test)]
pub mod testsupport;
pub mod transfer;
