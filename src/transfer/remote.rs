//! Transfers through a framed channel session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;
use std::time::Instant;

use crate::channel::transcript::{extract_base64, PayloadExpectation};
use crate::channel::{CommandChannel, FrameOutput, ScanMode};
use crate::config::TransferConfig;
use crate::error::TransferError;

use super::checksum::{remote_checksum, sha256_file, sha256_hex};
use super::stats::TransferStats;
use super::strategy::{select_method, ChannelMethod};
use super::{commands, looks_like_missing_file, Direction, TransferReport};

/// Output fragments that mean a write command failed.
const WRITE_FAILURES: &[&str] = &[
    "base64: invalid input",
    "No such file or directory",
    "Permission denied",
    "not found",
];

/// Longest command text quoted back in an error.
const COMMAND_EXCERPT: usize = 96;

fn excerpt(command: &str) -> String {
    let first = command.lines().next().unwrap_or_default();
    if first.len() <= COMMAND_EXCERPT {
        return first.to_string();
    }
    let mut end = COMMAND_EXCERPT;
    while !first.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &first[..end])
}

/// A download and the bytes it produced.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub report: TransferReport,
    pub content: Vec<u8>,
}

/// Transfer engine bound to one channel.
pub struct ChannelTransfer<'a> {
    channel: &'a dyn CommandChannel,
    config: &'a TransferConfig,
    stats: Option<&'a TransferStats>,
}

impl<'a> ChannelTransfer<'a> {
    pub fn new(channel: &'a dyn CommandChannel, config: &'a TransferConfig) -> Self {
        Self {
            channel,
            config,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: &'a TransferStats) -> Self {
        self.stats = Some(stats);
        self
    }

    fn record(&self, report: &TransferReport) {
        if let Some(stats) = self.stats {
            stats.record(report);
        }
    }

    async fn run(&self, command: &str, mode: ScanMode) -> Result<FrameOutput, TransferError> {
        Ok(self
            .channel
            .exec_frame(command, self.config.command_timeout(), mode)
            .await?)
    }

    /// Run a write-side command and fail on timeouts or error text.
    async fn run_checked(&self, command: &str) -> Result<(), TransferError> {
        let frame = self.run(command, ScanMode::Lines).await?;
        let output = frame.output();
        if frame.timed_out {
            return Err(TransferError::RemoteCommandFailed {
                command: excerpt(command),
                output: format!("timed out: {output}"),
            });
        }
        if WRITE_FAILURES.iter().any(|needle| output.contains(needle)) {
            return Err(TransferError::RemoteCommandFailed {
                command: excerpt(command),
                output,
            });
        }
        Ok(())
    }

    async fn remove_remote(&self, path: &str) -> bool {
        match self.run(&commands::remove(path), ScanMode::Lines).await {
            Ok(frame) => !frame.timed_out,
            Err(err) => {
                tracing::warn!(path, error = %err, "remote cleanup failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    /// Upload base64-encoded content.
    pub async fn upload_base64(
        &self,
        encoded: &str,
        remote_path: &str,
    ) -> Result<TransferReport, TransferError> {
        let content = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TransferError::InvalidBase64(e.to_string()))?;
        self.upload(&content, remote_path).await
    }

    pub async fn upload(
        &self,
        content: &[u8],
        remote_path: &str,
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        let size = content.len() as u64;
        let method = select_method(size, self.config);
        let source_checksum = sha256_hex(content);
        let encoded = STANDARD.encode(content);
        tracing::info!(path = remote_path, size, method = method.as_str(), "uploading");

        let chunks = match method {
            ChannelMethod::SingleCommand => {
                self.run_checked(&commands::inline_upload(&encoded, remote_path))
                    .await?;
                1
            }
            ChannelMethod::Streaming => {
                let terminator = commands::heredoc_terminator();
                self.run_checked(&commands::heredoc_upload(&encoded, remote_path, &terminator))
                    .await?;
                1
            }
            ChannelMethod::Chunked => self.upload_chunked(&encoded, remote_path).await?,
        };

        let target_checksum = remote_checksum(self.channel, remote_path, self.config).await?;
        let mut report = TransferReport::verified(
            Direction::Upload,
            method.as_str(),
            remote_path,
            size,
            source_checksum,
            target_checksum,
            started,
        )
        .with_chunks(chunks);
        if report.checksum_mismatch {
            tracing::warn!(
                path = remote_path,
                source = %report.source_checksum,
                target = %report.target_checksum,
                "upload checksum mismatch"
            );
            if self.config.remove_remote_on_mismatch {
                report.artifact_removed = self.remove_remote(remote_path).await;
            }
        }
        self.record(&report);
        Ok(report)
    }

    async fn upload_chunked(&self, encoded: &str, remote_path: &str) -> Result<u64, TransferError> {
        let staging = commands::staging_path(&self.config.remote_temp_dir);
        let result = self.append_chunks(encoded, remote_path, &staging).await;
        if result.is_err() {
            self.remove_remote(&staging).await;
        }
        result
    }

    async fn append_chunks(
        &self,
        encoded: &str,
        remote_path: &str,
        staging: &str,
    ) -> Result<u64, TransferError> {
        self.run_checked(&commands::truncate(staging)).await?;
        let mut chunks = 0u64;
        // Base64 is ASCII, so byte chunks are valid str slices.
        for chunk in encoded.as_bytes().chunks(self.chunk_chars()) {
            let chunk = String::from_utf8_lossy(chunk);
            self.run_checked(&commands::append_chunk(&chunk, staging))
                .await?;
            chunks += 1;
        }
        tracing::debug!(chunks, staging, "chunks staged, decoding");
        self.run_checked(&commands::decode_staged(staging, remote_path))
            .await?;
        Ok(chunks)
    }

    /// Chunk width in base64 characters, kept a multiple of four so every
    /// slice decodes on its own.
    fn chunk_chars(&self) -> usize {
        (self.config.chunk_chars / 4).max(1) * 4
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    pub async fn download(&self, remote_path: &str) -> Result<Downloaded, TransferError> {
        let started = Instant::now();
        let size = self.remote_size(remote_path).await?;
        let source_checksum = remote_checksum(self.channel, remote_path, self.config).await?;
        // Downloads have no heredoc path: anything not chunked is one read.
        let method = match select_method(size, self.config) {
            ChannelMethod::Chunked => ChannelMethod::Chunked,
            _ => ChannelMethod::SingleCommand,
        };
        tracing::info!(path = remote_path, size, method = method.as_str(), "downloading");

        let (content, chunks) = match method {
            _ if size == 0 => (Vec::new(), 0),
            ChannelMethod::Chunked => self.download_chunked(remote_path, size).await?,
            _ => (self.download_single(remote_path, size).await?, 1),
        };
        let report = TransferReport::verified(
            Direction::Download,
            method.as_str(),
            remote_path,
            size,
            source_checksum,
            sha256_hex(&content),
            started,
        )
        .with_chunks(chunks);
        if report.checksum_mismatch {
            tracing::warn!(
                path = remote_path,
                source = %report.source_checksum,
                target = %report.target_checksum,
                "download checksum mismatch"
            );
        }
        self.record(&report);
        Ok(Downloaded { report, content })
    }

    /// Download into a local file. On mismatch the local file is deleted.
    pub async fn download_to(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferReport, TransferError> {
        let Downloaded { mut report, content } = self.download(remote_path).await?;
        if report.checksum_mismatch {
            return Ok(report);
        }
        std::fs::write(local_path, &content)?;
        let written = sha256_file(local_path)?;
        if written != report.source_checksum {
            tracing::warn!(path = %local_path.display(), "local copy does not match source");
            report.success = false;
            report.checksum_mismatch = true;
            report.target_checksum = written;
            report.artifact_removed = std::fs::remove_file(local_path).is_ok();
        }
        Ok(report)
    }

    async fn remote_size(&self, remote_path: &str) -> Result<u64, TransferError> {
        let command = commands::size(remote_path);
        let frame = self.run(&command, ScanMode::Lines).await?;
        let output = frame.output();
        if looks_like_missing_file(&output) {
            return Err(TransferError::FileNotFound(remote_path.to_string()));
        }
        let size = output
            .lines()
            .find_map(|line| line.trim().parse::<u64>().ok());
        size.ok_or(TransferError::RemoteCommandFailed { command, output })
    }

    async fn download_single(&self, remote_path: &str, size: u64) -> Result<Vec<u8>, TransferError> {
        let expect = PayloadExpectation::exactly(size as usize);
        let mut last = None;
        for command in commands::download_commands(remote_path) {
            let frame = self.run(&command, ScanMode::Payload).await?;
            let segment = &frame.transcript.segment;
            if let Some((payload, layer)) = extract_base64(segment, &frame.markers.end, expect) {
                tracing::debug!(?layer, %command, "payload extracted");
                return Ok(payload.bytes);
            }
            if looks_like_missing_file(segment) {
                return Err(TransferError::FileNotFound(remote_path.to_string()));
            }
            tracing::debug!(%command, timed_out = frame.timed_out, "no payload, trying next reader");
            last = Some((command, segment.clone()));
        }
        let (command, partial) = last.unwrap_or_default();
        Err(TransferError::MalformedExtraction { command, partial })
    }

    async fn download_chunked(
        &self,
        remote_path: &str,
        size: u64,
    ) -> Result<(Vec<u8>, u64), TransferError> {
        let staging = commands::staging_path(&self.config.remote_temp_dir);
        self.run_checked(&commands::stage_download(remote_path, &staging))
            .await?;
        let result = self.read_slices(&staging, size as usize).await;
        self.remove_remote(&staging).await;
        result
    }

    async fn read_slices(&self, staging: &str, size: usize) -> Result<(Vec<u8>, u64), TransferError> {
        let encoded_len = size.div_ceil(3) * 4;
        let width = self.chunk_chars();
        let mut content = Vec::with_capacity(size);
        let mut chunks = 0u64;
        let mut offset = 0usize;
        while offset < encoded_len {
            let len = width.min(encoded_len - offset);
            let last = offset + len >= encoded_len;
            let expected = if last { size - content.len() } else { len / 4 * 3 };
            let command = commands::read_slice(staging, offset, len);
            let frame = self.run(&command, ScanMode::Payload).await?;
            let segment = &frame.transcript.segment;
            let Some((payload, _)) =
                extract_base64(segment, &frame.markers.end, PayloadExpectation::exactly(expected))
            else {
                return Err(TransferError::MalformedExtraction {
                    command,
                    partial: segment.clone(),
                });
            };
            content.extend_from_slice(&payload.bytes);
            offset += len;
            chunks += 1;
        }
        Ok((content, chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FramedChannel;
    use crate::config::FrameConfig;
    use crate::testsupport::{FakeShell, TestTempDir};

    fn channel(shell: &FakeShell) -> FramedChannel<FakeShell> {
        FramedChannel::new(
            shell.clone(),
            FrameConfig {
                settle_ms: 1,
                poll_interval_ms: 20,
            },
        )
    }

    fn config() -> TransferConfig {
        TransferConfig {
            command_timeout_secs: 5,
            checksum_timeout_secs: 5,
            ..TransferConfig::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn small_text_upload_uses_single_command() {
        let shell = FakeShell::new();
        let channel = channel(&shell);
        let config = config();
        let report = ChannelTransfer::new(&channel, &config)
            .upload(b"hello-test", "/tmp/hello.txt")
            .await
            .expect("upload");
        assert!(report.success);
        assert_eq!(report.method, "single_command");
        assert_eq!(report.file_size, 10);
        assert_eq!(report.source_checksum, report.target_checksum);
        assert_eq!(shell.file("/tmp/hello.txt").as_deref(), Some(&b"hello-test"[..]));
    }

    #[tokio::test]
    async fn upload_tiers_switch_at_size_boundaries() {
        let config = config();
        for (size, method) in [
            (51_199, "single_command"),
            (51_200, "streaming"),
            (511_999, "streaming"),
            (512_000, "chunked"),
        ] {
            let shell = FakeShell::new();
            let channel = channel(&shell);
            let content = pattern(size);
            let report = ChannelTransfer::new(&channel, &config)
                .upload(&content, "/tmp/blob")
                .await
                .expect("upload");
            assert_eq!(report.method, method, "size {size}");
            assert!(report.success, "size {size}: {:?}", report.error);
            assert_eq!(shell.file("/tmp/blob").map(|b| b.len()), Some(size));
        }
    }

    #[tokio::test]
    async fn chunked_upload_cleans_staging_file() {
        let shell = FakeShell::new();
        let channel = channel(&shell);
        let config = TransferConfig {
            streaming_max_bytes: 1000,
            single_command_max_bytes: 10,
            chunk_chars: 400,
            ..config()
        };
        let content = pattern(5000);
        let report = ChannelTransfer::new(&channel, &config)
            .upload(&content, "/tmp/big")
            .await
            .expect("upload");
        assert!(report.success);
        assert_eq!(report.chunks, 17);
        assert_eq!(shell.file_paths(), vec!["/tmp/big".to_string()]);
    }

    #[tokio::test]
    async fn corrupted_remote_checksum_fails_and_removes_upload() {
        let shell = FakeShell::new();
        shell.corrupt_checksums();
        let channel = channel(&shell);
        let config = config();
        let stats = TransferStats::new();
        let report = ChannelTransfer::new(&channel, &config)
            .with_stats(&stats)
            .upload(b"hello-test", "/tmp/hello.txt")
            .await
            .expect("upload completes");
        assert!(!report.success);
        assert!(report.checksum_mismatch);
        assert_ne!(report.source_checksum, report.target_checksum);
        assert!(report.artifact_removed);
        assert!(shell.file("/tmp/hello.txt").is_none());
        assert_eq!(stats.report().successful_transfers, 0);
    }

    #[tokio::test]
    async fn invalid_base64_is_rejected_before_any_command() {
        let shell = FakeShell::new();
        let channel = channel(&shell);
        let config = config();
        let err = ChannelTransfer::new(&channel, &config)
            .upload_base64("not base64!!", "/tmp/x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidBase64(_)));
        assert!(shell.history().is_empty());
    }

    #[tokio::test]
    async fn small_download_round_trips() {
        let shell = FakeShell::new();
        let content = pattern(3000);
        shell.put_file("/srv/data.bin", &content);
        let channel = channel(&shell);
        let config = config();
        let downloaded = ChannelTransfer::new(&channel, &config)
            .download("/srv/data.bin")
            .await
            .expect("download");
        assert!(downloaded.report.success);
        assert_eq!(downloaded.report.method, "single_command");
        assert_eq!(downloaded.content, content);
    }

    #[tokio::test]
    async fn medium_download_reports_single_read() {
        let shell = FakeShell::new();
        let content = pattern(60_000);
        shell.put_file("/srv/medium.bin", &content);
        let channel = channel(&shell);
        let config = config();
        let downloaded = ChannelTransfer::new(&channel, &config)
            .download("/srv/medium.bin")
            .await
            .expect("download");
        assert!(downloaded.report.success, "{:?}", downloaded.report.error);
        assert_eq!(downloaded.report.method, "single_command");
        assert_eq!(downloaded.report.chunks, 1);
        assert_eq!(downloaded.content, content);
    }

    #[tokio::test]
    async fn download_falls_back_to_next_reader() {
        let shell = FakeShell::new();
        shell.without_tool("base64");
        shell.put_file("/srv/a", b"fallback payload");
        let channel = channel(&shell);
        let config = config();
        let downloaded = ChannelTransfer::new(&channel, &config)
            .download("/srv/a")
            .await
            .expect("download");
        assert!(downloaded.report.success);
        assert_eq!(downloaded.content, b"fallback payload");
        assert!(shell.history().iter().any(|c| c.starts_with("openssl base64")));
    }

    #[tokio::test]
    async fn chunked_download_reads_every_slice() {
        let shell = FakeShell::new();
        let content = pattern(10_001);
        shell.put_file("/srv/big", &content);
        let channel = channel(&shell);
        let config = TransferConfig {
            streaming_max_bytes: 4096,
            single_command_max_bytes: 1024,
            chunk_chars: 1000,
            ..config()
        };
        let downloaded = ChannelTransfer::new(&channel, &config)
            .download("/srv/big")
            .await
            .expect("download");
        assert!(downloaded.report.success, "{:?}", downloaded.report.error);
        assert_eq!(downloaded.report.method, "chunked");
        assert_eq!(downloaded.report.chunks, 14);
        assert_eq!(downloaded.content, content);
        assert_eq!(shell.file_paths(), vec!["/srv/big".to_string()]);
    }

    #[tokio::test]
    async fn empty_file_downloads_without_reading() {
        let shell = FakeShell::new();
        shell.put_file("/srv/empty", b"");
        let channel = channel(&shell);
        let config = config();
        let downloaded = ChannelTransfer::new(&channel, &config)
            .download("/srv/empty")
            .await
            .expect("download");
        assert!(downloaded.report.success);
        assert!(downloaded.content.is_empty());
    }

    #[tokio::test]
    async fn missing_remote_file_is_reported() {
        let shell = FakeShell::new();
        let channel = channel(&shell);
        let config = config();
        let err = ChannelTransfer::new(&channel, &config)
            .download("/srv/nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)), "got: {err}");
    }

    #[tokio::test]
    async fn mismatched_download_never_writes_local_file() {
        let shell = FakeShell::new();
        shell.put_file("/srv/a", b"payload");
        shell.corrupt_checksums();
        let channel = channel(&shell);
        let config = config();
        let dir = TestTempDir::new("download");
        let target = dir.child("a");
        let report = ChannelTransfer::new(&channel, &config)
            .download_to("/srv/a", &target)
            .await
            .expect("download");
        assert!(!report.success && report.checksum_mismatch);
        assert!(!target.exists());
    }

    #[test]
    fn long_commands_are_excerpted() {
        let command = format!("printf '%s' '{}' >> '/tmp/s'", "A".repeat(4000));
        let short = excerpt(&command);
        assert!(short.len() <= COMMAND_EXCERPT + 3);
        assert!(short.ends_with("..."));
        assert_eq!(excerpt("ls\nsecond"), "ls");
    }
}
