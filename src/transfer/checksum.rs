//! SHA-256 on both sides of a transfer.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::channel::transcript::extract_checksum;
use crate::channel::{CommandChannel, ScanMode};
use crate::config::TransferConfig;
use crate::error::TransferError;

use super::commands;

const HASH_BUFFER: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash a file without loading it whole.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Checksum a remote file through the channel, trying each tool in turn.
pub async fn remote_checksum(
    channel: &dyn CommandChannel,
    path: &str,
    config: &TransferConfig,
) -> Result<String, TransferError> {
    let mut last_command = String::new();
    let mut last_output = String::new();
    for command in commands::checksum_commands(path) {
        let frame = channel
            .exec_frame(&command, config.checksum_timeout(), ScanMode::Lines)
            .await?;
        let output = frame.output();
        if let Some(digest) = extract_checksum(&output) {
            return Ok(digest);
        }
        tracing::debug!(%command, "checksum tool produced no digest");
        last_command = command;
        last_output = output;
    }
    Err(TransferError::ChecksumUnavailable {
        command: last_command,
        output: last_output,
    })
}
