//! Direct transfers on this host's filesystem.
//!
//! Paths are vetted before anything is opened: uploads may not traverse or
//! land under `/etc/`, `/sys/` or `/proc/`, downloads may not traverse or read
//! the password databases. A digest mismatch deletes the written file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::error::TransferError;

use super::checksum::{sha256_file, sha256_hex};
use super::remote::Downloaded;
use super::stats::TransferStats;
use super::strategy::{chunk_size, TransportKind};
use super::{Direction, TransferReport, DIRECT_METHOD};

const UPLOAD_DENIED_PREFIXES: &[&str] = &["/etc/", "/sys/", "/proc/"];
const DOWNLOAD_DENIED_PREFIXES: &[&str] = &["/etc/passwd", "/etc/shadow"];

/// Digest function for the far side of a transfer.
pub type FileHasher = Box<dyn Fn(&Path) -> io::Result<String> + Send + Sync>;

fn check_path(path: &str, denied: &[&str]) -> Result<(), TransferError> {
    if path.contains("..") || denied.iter().any(|prefix| path.starts_with(prefix)) {
        tracing::warn!(path, "blocked unsafe transfer path");
        return Err(TransferError::UnsafePath(path.to_string()));
    }
    Ok(())
}

pub fn check_upload_path(path: &str) -> Result<(), TransferError> {
    check_path(path, UPLOAD_DENIED_PREFIXES)
}

pub fn check_download_path(path: &str) -> Result<(), TransferError> {
    check_path(path, DOWNLOAD_DENIED_PREFIXES)
}

fn absolute(path: &str) -> Result<PathBuf, TransferError> {
    Ok(std::path::absolute(path)?)
}

/// Verified local transfers.
pub struct LocalTransfer {
    hasher: FileHasher,
    stats: Option<Arc<TransferStats>>,
}

impl std::fmt::Debug for LocalTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransfer")
            .field("stats", &self.stats.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for LocalTransfer {
    fn default() -> Self {
        Self {
            hasher: Box::new(sha256_file),
            stats: None,
        }
    }
}

impl LocalTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the far-side digest, e.g. to simulate corruption.
    pub fn with_hasher(mut self, hasher: FileHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_stats(mut self, stats: Arc<TransferStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn finish(&self, mut report: TransferReport, written: Option<&Path>) -> TransferReport {
        if report.checksum_mismatch {
            tracing::warn!(
                path = %report.path,
                source = %report.source_checksum,
                target = %report.target_checksum,
                "local transfer checksum mismatch"
            );
            if let Some(path) = written {
                report.artifact_removed = fs::remove_file(path).is_ok();
            }
        }
        if let Some(stats) = &self.stats {
            stats.record(&report);
        }
        report
    }

    /// Write `content` to `dest` and verify it.
    pub fn upload(&self, content: &[u8], dest: &str) -> Result<TransferReport, TransferError> {
        check_upload_path(dest)?;
        let started = Instant::now();
        let target = absolute(dest)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = content.len() as u64;
        let mut file = File::create(&target)?;
        let mut chunks = 0u64;
        for chunk in content.chunks(chunk_size(size, TransportKind::Direct)) {
            file.write_all(chunk)?;
            chunks += 1;
        }
        file.sync_all()?;
        drop(file);

        let report = TransferReport::verified(
            Direction::Upload,
            DIRECT_METHOD,
            &target.display().to_string(),
            size,
            sha256_hex(content),
            (self.hasher)(&target)?,
            started,
        )
        .with_chunks(chunks);
        Ok(self.finish(report, Some(&target)))
    }

    pub fn upload_base64(&self, encoded: &str, dest: &str) -> Result<TransferReport, TransferError> {
        let content = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TransferError::InvalidBase64(e.to_string()))?;
        self.upload(&content, dest)
    }

    /// Copy a file to `dest`, hashing the source as it streams.
    pub fn upload_file(&self, src: &Path, dest: &str) -> Result<TransferReport, TransferError> {
        check_upload_path(dest)?;
        let started = Instant::now();
        let mut input = File::open(src).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(src.display().to_string()),
            _ => TransferError::Io(e),
        })?;
        let size = input.metadata()?.len();
        let target = absolute(dest)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let (source_checksum, chunks) = {
            let mut output = File::create(&target)?;
            let copied = copy_hashing(&mut input, &mut output, chunk_size(size, TransportKind::Direct))?;
            output.sync_all()?;
            copied
        };
        let report = TransferReport::verified(
            Direction::Upload,
            DIRECT_METHOD,
            &target.display().to_string(),
            size,
            source_checksum,
            (self.hasher)(&target)?,
            started,
        )
        .with_chunks(chunks);
        Ok(self.finish(report, Some(&target)))
    }

    /// Read `src` into memory and verify what was read.
    pub fn download(&self, src: &str) -> Result<Downloaded, TransferError> {
        check_download_path(src)?;
        let started = Instant::now();
        let source = absolute(src)?;
        if !source.is_file() {
            return Err(TransferError::FileNotFound(source.display().to_string()));
        }
        let source_checksum = (self.hasher)(&source)?;
        let content = fs::read(&source)?;
        let report = TransferReport::verified(
            Direction::Download,
            DIRECT_METHOD,
            &source.display().to_string(),
            content.len() as u64,
            source_checksum,
            sha256_hex(&content),
            started,
        );
        Ok(Downloaded {
            report: self.finish(report, None),
            content,
        })
    }

    /// Copy `src` to a local `dest`; the copy is deleted on mismatch.
    pub fn download_file(&self, src: &str, dest: &Path) -> Result<TransferReport, TransferError> {
        check_download_path(src)?;
        let started = Instant::now();
        let source = absolute(src)?;
        let mut input = File::open(&source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(source.display().to_string()),
            _ => TransferError::Io(e),
        })?;
        let size = input.metadata()?.len();
        let source_checksum = (self.hasher)(&source)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let (target_checksum, chunks) = {
            let mut output = File::create(dest)?;
            let copied = copy_hashing(&mut input, &mut output, chunk_size(size, TransportKind::Direct))?;
            output.sync_all()?;
            copied
        };
        let report = TransferReport::verified(
            Direction::Download,
            DIRECT_METHOD,
            &source.display().to_string(),
            size,
            source_checksum,
            target_checksum,
            started,
        )
        .with_chunks(chunks);
        Ok(self.finish(report, Some(dest)))
    }
}

/// Copy in `chunk`-sized reads, returning the digest of the bytes copied and
/// the number of chunks.
fn copy_hashing(input: &mut impl Read, output: &mut impl Write, chunk: usize) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk.max(1)];
    let mut chunks = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        chunks += 1;
    }
    Ok((format!("{:x}", hasher.finalize()), chunks.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::TestTempDir;

    #[test]
    fn unsafe_paths_are_rejected() {
        for path in ["/tmp/../etc/x", "/etc/cron.d/job", "/sys/kernel/x", "/proc/self/mem"] {
            assert!(matches!(check_upload_path(path), Err(TransferError::UnsafePath(_))), "{path}");
        }
        assert!(check_upload_path("/tmp/ok.txt").is_ok());
        assert!(check_download_path("/etc/shadow").is_err());
        assert!(check_download_path("/etc/hostname").is_ok());
        assert!(check_download_path("a/../b").is_err());
    }

    #[test]
    fn upload_writes_and_verifies() {
        let dir = TestTempDir::new("local-up");
        let dest = dir.child("nested/out.bin");
        let content: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
        let report = LocalTransfer::new()
            .upload(&content, dest.to_str().unwrap())
            .unwrap();
        assert!(report.success);
        assert_eq!(report.method, "direct");
        assert_eq!(report.chunks, 9);
        assert_eq!(fs::read(&dest).unwrap(), content);
    }

    #[test]
    fn mismatch_deletes_written_file() {
        let dir = TestTempDir::new("local-bad");
        let dest = dir.child("out.txt");
        let stats = Arc::new(TransferStats::new());
        let transfer = LocalTransfer::new()
            .with_hasher(Box::new(|_: &Path| Ok::<_, io::Error>("0".repeat(64))))
            .with_stats(Arc::clone(&stats));
        let report = transfer.upload(b"hello-test", dest.to_str().unwrap()).unwrap();
        assert!(!report.success && report.checksum_mismatch);
        assert!(report.artifact_removed);
        assert!(!dest.exists());
        assert_eq!(stats.report().total_transfers, 1);
    }

    #[test]
    fn file_copy_in_both_directions() {
        let dir = TestTempDir::new("local-copy");
        let src = dir.write_bytes("src.bin", &[7u8; 10_000]);
        let staged = dir.child("staged.bin");
        let up = LocalTransfer::new()
            .upload_file(&src, staged.to_str().unwrap())
            .unwrap();
        assert!(up.success);

        let back = dir.child("back/copy.bin");
        let down = LocalTransfer::new()
            .download_file(staged.to_str().unwrap(), &back)
            .unwrap();
        assert!(down.success);
        assert_eq!(fs::read(&back).unwrap(), vec![7u8; 10_000]);

        let read = LocalTransfer::new().download(staged.to_str().unwrap()).unwrap();
        assert!(read.report.success);
        assert_eq!(read.content.len(), 10_000);
    }

    #[test]
    fn corrupted_download_removes_local_copy() {
        let dir = TestTempDir::new("local-down-bad");
        let src = dir.write_bytes("src.txt", b"payload");
        let dest = dir.child("copy.txt");
        let report = LocalTransfer::new()
            .with_hasher(Box::new(|_: &Path| Ok::<_, io::Error>("f".repeat(64))))
            .download_file(src.to_str().unwrap(), &dest)
            .unwrap();
        assert!(!report.success);
        assert!(!dest.exists());
    }

    #[test]
    fn missing_source_is_file_not_found() {
        let dir = TestTempDir::new("local-missing");
        let err = LocalTransfer::new()
            .download(dir.child("nope").to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }

    #[test]
    fn base64_upload_rejects_bad_input() {
        let dir = TestTempDir::new("local-b64");
        let err = LocalTransfer::new()
            .upload_base64("%%%", dir.child("x").to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidBase64(_)));
    }
}
